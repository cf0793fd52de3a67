//! Bidirectional sync reconciliation for a target collection.
//!
//! `sync_fetch` derives the deltas a sync adapter must upload: partial
//! aggregate views (details sourced only from the adapter's own collection
//! and the Local collection — other adapters' contributions never leak),
//! plus tombstones and a high-water timestamp. `sync_update` applies the
//! adapter's downloaded deltas as a three-way merge under a conflict
//! policy, attributing each changed detail to the constituent identified by
//! its provenance.

use chrono::{DateTime, Utc};
use kindred_core::{
  contact::{Contact, AGGREGATE_COLLECTION_ID, LOCAL_COLLECTION_ID},
  detail::{Detail, AGGREGATE_URI_PREFIX},
  filter::FetchHint,
  flags::{AccessConstraints, ChangeFlags},
};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{
  aggregate,
  db::{DbCtx, WriteTx},
  encode::encode_opt_dt,
  reader, writer, Error, Result,
};

fn engine(e: kindred_core::Error) -> Error { Error::Engine(e) }

/// How `sync_update` resolves a detail changed both locally and remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
  /// The device's value wins on conflict.
  PreserveLocalChanges,
  /// The incoming value wins; stray remote modifications with no local
  /// counterpart become additions.
  PreserveRemoteChanges,
}

#[derive(Debug, Default)]
pub struct SyncFetchResult {
  /// Previously exported aggregates whose partial view changed.
  pub updated:       Vec<Contact>,
  /// Aggregates not previously exported.
  pub added:         Vec<Contact>,
  /// Previously exported aggregates now tombstoned, or whose only
  /// target-collection constituent was removed.
  pub deleted_ids:   Vec<i64>,
  /// High-water mark; callers persist it and pass it back as `since`.
  pub max_timestamp: Option<DateTime<Utc>>,
}

// ─── Fetch ───────────────────────────────────────────────────────────────────

fn effective_modified(
  ctx: &DbCtx,
  contact_id: i64,
  durable: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
  match ctx.transient.contact_details(contact_id)? {
    Some((overlay, _)) => Ok(Some(overlay)),
    None => Ok(durable),
  }
}

/// Constituents of `aggregate_id` restricted to `collections`, Local
/// collection first.
fn constituents_in(
  conn: &Connection,
  ctx: &DbCtx,
  aggregate_id: i64,
  collections: &[i64],
) -> Result<Vec<Contact>> {
  let placeholders = vec!["?"; collections.len()].join(", ");
  let sql = format!(
    "SELECT C.contactId FROM Relationships R
     INNER JOIN Contacts C ON C.contactId = R.secondId
     WHERE R.firstId = ?1 AND R.type = 'Aggregates'
       AND C.changeFlags < 4 AND C.isDeactivated = 0
       AND C.collectionId IN ({placeholders})
     ORDER BY (C.collectionId != 2) ASC, C.contactId ASC"
  );
  let mut bindings: Vec<i64> = vec![aggregate_id];
  bindings.extend_from_slice(collections);
  let ids: Vec<i64> = {
    let mut stmt = conn.prepare(&sql)?;
    stmt
      .query_map(rusqlite::params_from_iter(bindings.iter()), |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };
  let mut assembled =
    reader::fetch_contacts(conn, ctx, &ids, &FetchHint::default(), false, true)?;
  Ok(ids.into_iter().filter_map(|id| assembled.remove(&id)).collect())
}

/// The aggregate as seen by the adapter of `collection_id`: a synthetic
/// aggregate promoting details only from that collection's constituent and
/// the Local constituent.
fn partial_aggregate_view(
  conn: &Connection,
  ctx: &DbCtx,
  aggregate_id: i64,
  collection_id: i64,
) -> Result<Option<Contact>> {
  let constituents = constituents_in(
    conn,
    ctx,
    aggregate_id,
    &[collection_id, LOCAL_COLLECTION_ID],
  )?;
  if constituents.is_empty() {
    return Ok(None);
  }
  let refs: Vec<&Contact> = constituents.iter().collect();

  let mut view = Contact::new(AGGREGATE_COLLECTION_ID);
  view.id = Some(aggregate_id);
  view.details = aggregate::promote_details(&[], &refs, &[]);
  writer::synthesize_global_presence(&mut view);
  view.created = refs.iter().filter_map(|c| c.created).min();
  view.modified = refs.iter().filter_map(|c| c.modified).max();
  Ok(Some(view))
}

/// Enumerate the deltas of `collection_id` since `since`.
pub(crate) fn sync_fetch(
  conn: &Connection,
  ctx: &DbCtx,
  collection_id: i64,
  since: Option<DateTime<Utc>>,
  exported_ids: &[i64],
) -> Result<SyncFetchResult> {
  let mut result = SyncFetchResult::default();
  let mut max_ts: Option<DateTime<Utc>> = None;
  let mut observe = |ts: Option<DateTime<Utc>>| {
    if let Some(ts) = ts
      && max_ts.is_none_or(|current| ts > current)
    {
      max_ts = Some(ts);
    }
  };

  // Target-collection constituents, with overlay-coalesced modification
  // times.
  struct ConstituentRow {
    contact_id: i64,
    modified:   Option<DateTime<Utc>>,
    deleted:    Option<DateTime<Utc>>,
    tombstoned: bool,
  }
  let rows: Vec<ConstituentRow> = {
    let mut stmt = conn.prepare(
      "SELECT contactId, modified, deleted, changeFlags FROM Contacts
       WHERE collectionId = ?1 AND contactId > 2",
    )?;
    let raw = stmt
      .query_map([collection_id], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, Option<String>>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, i64>(3)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut rows = Vec::with_capacity(raw.len());
    for (contact_id, modified, deleted, flags) in raw {
      rows.push(ConstituentRow {
        contact_id,
        modified: crate::encode::decode_opt_dt(modified)?,
        deleted: crate::encode::decode_opt_dt(deleted)?,
        tombstoned: ChangeFlags::from_bits_truncate(flags as u32).is_deleted(),
      });
    }
    rows
  };

  let aggregate_of = |conn: &Connection, constituent_id: i64| -> Result<Option<i64>> {
    Ok(
      conn
        .query_row(
          "SELECT R.firstId FROM Relationships R
           INNER JOIN Contacts A ON A.contactId = R.firstId
           WHERE R.secondId = ?1 AND R.type = 'Aggregates' AND A.changeFlags < 4",
          [constituent_id],
          |row| row.get(0),
        )
        .optional()?,
    )
  };

  let mut changed_aggregates: Vec<i64> = Vec::new();
  for row in &rows {
    let effective = effective_modified(ctx, row.contact_id, row.modified)?;
    if row.tombstoned {
      observe(row.deleted.or(effective));
      continue;
    }
    if since.is_none()
      || effective.is_some_and(|ts| ts > since.unwrap_or_default())
    {
      observe(effective);
      if let Some(aggregate_id) = aggregate_of(conn, row.contact_id)? {
        changed_aggregates.push(aggregate_id);
      }
    }
  }

  // Previously exported aggregates also surface when their Local
  // constituent changed.
  for aggregate_id in exported_ids {
    let local_modified: Option<Option<String>> = conn
      .query_row(
        "SELECT C.modified FROM Relationships R
         INNER JOIN Contacts C ON C.contactId = R.secondId
         WHERE R.firstId = ?1 AND R.type = 'Aggregates'
           AND C.collectionId = 2 AND C.changeFlags < 4",
        [aggregate_id],
        |row| row.get(0),
      )
      .optional()?;
    if let Some(modified) = local_modified {
      let durable = crate::encode::decode_opt_dt(modified)?;
      let local_id: Option<i64> = conn
        .query_row(
          "SELECT C.contactId FROM Relationships R
           INNER JOIN Contacts C ON C.contactId = R.secondId
           WHERE R.firstId = ?1 AND R.type = 'Aggregates'
             AND C.collectionId = 2 AND C.changeFlags < 4",
          [aggregate_id],
          |row| row.get(0),
        )
        .optional()?;
      let effective = match local_id {
        Some(id) => effective_modified(ctx, id, durable)?,
        None => durable,
      };
      if since.is_none()
        || effective.is_some_and(|ts| ts > since.unwrap_or_default())
      {
        observe(effective);
        changed_aggregates.push(*aggregate_id);
      }
    }
  }

  changed_aggregates.sort_unstable();
  changed_aggregates.dedup();

  // Partition: exported but gone → deleted; otherwise updated/added views.
  for aggregate_id in exported_ids {
    let row: Option<(i64, Option<String>)> = conn
      .query_row(
        "SELECT changeFlags, deleted FROM Contacts WHERE contactId = ?1",
        [aggregate_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
      )
      .optional()?;
    let tombstoned = match &row {
      Some((flags, _)) => {
        ChangeFlags::from_bits_truncate(*flags as u32).is_deleted()
      }
      None => true,
    };
    let target_constituent_exists: bool = conn
      .query_row(
        "SELECT 1 FROM Relationships R
         INNER JOIN Contacts C ON C.contactId = R.secondId
         WHERE R.firstId = ?1 AND R.type = 'Aggregates'
           AND C.collectionId = ?2 AND C.changeFlags < 4",
        [*aggregate_id, collection_id],
        |_| Ok(true),
      )
      .optional()?
      .unwrap_or(false);

    if tombstoned || !target_constituent_exists {
      result.deleted_ids.push(*aggregate_id);
      if let Some((_, deleted)) = row {
        observe(crate::encode::decode_opt_dt(deleted)?);
      }
    }
  }

  for aggregate_id in changed_aggregates {
    if result.deleted_ids.contains(&aggregate_id) {
      continue;
    }
    let Some(view) =
      partial_aggregate_view(conn, ctx, aggregate_id, collection_id)?
    else {
      continue;
    };
    if exported_ids.contains(&aggregate_id) {
      result.updated.push(view);
    } else {
      result.added.push(view);
    }
  }

  result.max_timestamp = max_ts;
  Ok(result)
}

// ─── Update ──────────────────────────────────────────────────────────────────

struct DetailDelta {
  added:    Vec<Detail>,
  removed:  Vec<Detail>,
  modified: Vec<(Detail, Detail)>, // (old, new)
}

fn details_match(a: &Detail, b: &Detail) -> bool {
  if a.kind() != b.kind() {
    return false;
  }
  if let (Some(a_id), Some(b_id)) = (a.detail_id, b.detail_id) {
    return a_id == b_id;
  }
  // Adapter-edited copies keep the provenance of the detail they edit.
  if let (Some(a_prov), Some(b_prov)) = (a.provenance, b.provenance) {
    return a_prov == b_prov;
  }
  if let (Some(a_uri), Some(b_uri)) = (&a.detail_uri, &b.detail_uri) {
    return a_uri == b_uri;
  }
  a.value_equivalent(b)
}

/// Interpret an (old, new) pair by difference, pairing details by id, then
/// provenance, then URI, then value.
fn diff_details(old: &Contact, new: &Contact) -> DetailDelta {
  let mut delta = DetailDelta {
    added:    Vec::new(),
    removed:  Vec::new(),
    modified: Vec::new(),
  };
  let mut matched_new: Vec<bool> = vec![false; new.details.len()];

  for old_detail in &old.details {
    // Engine-derived kinds never travel through sync deltas.
    if old_detail.kind().excluded_from_promotion() {
      continue;
    }
    let matched = new.details.iter().enumerate().find(|(index, candidate)| {
      !matched_new[*index] && details_match(old_detail, candidate)
    });
    match matched {
      Some((index, new_detail)) => {
        matched_new[index] = true;
        if !old_detail.value_equivalent(new_detail) {
          delta.modified.push((old_detail.clone(), new_detail.clone()));
        }
      }
      None => delta.removed.push(old_detail.clone()),
    }
  }

  for (index, new_detail) in new.details.iter().enumerate() {
    if new_detail.kind().excluded_from_promotion() {
      continue;
    }
    if !matched_new[index] {
      delta.added.push(new_detail.clone());
    }
  }
  delta
}

/// Make an aggregate-view detail writable on a constituent.
fn strip_for_constituent(detail: &Detail) -> Detail {
  let mut out = detail.clone();
  out.detail_id = None;
  out.provenance = None;
  out.access_constraints = AccessConstraints::empty();
  out.modifiable = true;
  out.change_flags = ChangeFlags::empty();
  if let Some(uri) = &out.detail_uri {
    out.detail_uri =
      Some(uri.strip_prefix(AGGREGATE_URI_PREFIX).unwrap_or(uri).to_owned());
  }
  out.linked_detail_uris = out
    .linked_detail_uris
    .iter()
    .map(|uri| uri.strip_prefix(AGGREGATE_URI_PREFIX).unwrap_or(uri).to_owned())
    .collect();
  out
}

fn find_constituent_mut<'a>(
  constituents: &'a mut [Contact],
  contact_id: i64,
) -> Option<&'a mut Contact> {
  constituents.iter_mut().find(|c| c.id == Some(contact_id))
}

/// Apply a batch of remote deltas to `collection_id` under `policy`. Each
/// pair's `new.id` is assigned the aggregate id that was created or reused
/// for it; the returned vector carries those assignments pair-by-pair.
pub(crate) fn sync_update(
  conn: &Connection,
  ctx: &DbCtx,
  collection_id: i64,
  policy: ConflictPolicy,
  pairs: &[(Option<Contact>, Option<Contact>)],
) -> Result<Vec<Option<i64>>> {
  if collection_id == AGGREGATE_COLLECTION_ID
    || collection_id == LOCAL_COLLECTION_ID
  {
    return Err(engine(kindred_core::Error::BadArgument));
  }
  let record_unhandled: bool = conn
    .query_row(
      "SELECT recordUnhandledChangeFlags FROM Collections
       WHERE collectionId = ?1 AND changeFlags < 4",
      [collection_id],
      |row| row.get::<_, Option<bool>>(0),
    )
    .optional()?
    .flatten()
    .unwrap_or(false);

  let tx = WriteTx::begin(conn, ctx)?;
  // The adapter must not see its own deltas echoed back on commit.
  ctx.notifier.suppress_collection(collection_id);

  let mut assigned: Vec<Option<i64>> = Vec::with_capacity(pairs.len());
  for (old, new) in pairs {
    match (old, new) {
      (None, Some(new)) => {
        let mut constituent = Contact::new(collection_id);
        constituent.details = new
          .details
          .iter()
          .filter(|d| !d.kind().excluded_from_promotion())
          .map(strip_for_constituent)
          .collect();
        writer::create_contact(conn, ctx, &mut constituent, &[], record_unhandled)?;
        let constituent_id = constituent
          .id
          .ok_or_else(|| engine(kindred_core::Error::Unspecified))?;
        ctx.notifier.note_contact_added(constituent_id);
        ctx.notifier.note_sync_collection_changed(collection_id);
        let aggregate_id = if ctx.cfg.aggregating {
          aggregate::upsert_aggregate(conn, ctx, constituent_id)?
        } else {
          constituent_id
        };
        assigned.push(Some(aggregate_id));
      }

      (Some(old), None) => {
        let aggregate_id =
          old.id.ok_or_else(|| engine(kindred_core::Error::BadArgument))?;
        let constituent_id: Option<i64> = conn
          .query_row(
            "SELECT C.contactId FROM Relationships R
             INNER JOIN Contacts C ON C.contactId = R.secondId
             WHERE R.firstId = ?1 AND R.type = 'Aggregates'
               AND C.collectionId = ?2 AND C.changeFlags < 4",
            [aggregate_id, collection_id],
            |row| row.get(0),
          )
          .optional()?;
        if let Some(constituent_id) = constituent_id {
          let now = encode_opt_dt(Some(Utc::now()));
          conn.execute(
            "UPDATE Contacts SET changeFlags = changeFlags | 4,
               deleted = ?2, modified = ?2
             WHERE contactId = ?1",
            rusqlite::params![constituent_id, now],
          )?;
          conn.execute(
            "UPDATE Details SET changeFlags = changeFlags | 4 WHERE contactId = ?1",
            [constituent_id],
          )?;
          ctx.transient.remove(constituent_id)?;
          ctx.notifier.note_contact_removed(constituent_id);
          if ctx.cfg.aggregating {
            aggregate::regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
          }
        }
        assigned.push(None);
      }

      (Some(old), Some(new)) => {
        let aggregate_id =
          old.id.ok_or_else(|| engine(kindred_core::Error::BadArgument))?;
        apply_update(
          conn,
          ctx,
          collection_id,
          policy,
          aggregate_id,
          old,
          new,
          record_unhandled,
        )?;
        assigned.push(Some(aggregate_id));
      }

      (None, None) => assigned.push(None),
    }
  }

  if ctx.cfg.aggregating {
    aggregate::remove_childless_aggregates(conn, ctx)?;
  }
  tx.commit()?;
  Ok(assigned)
}

#[allow(clippy::too_many_arguments)]
fn apply_update(
  conn: &Connection,
  ctx: &DbCtx,
  collection_id: i64,
  policy: ConflictPolicy,
  aggregate_id: i64,
  old: &Contact,
  new: &Contact,
  record_unhandled: bool,
) -> Result<()> {
  let mut constituents = constituents_in(
    conn,
    ctx,
    aggregate_id,
    &[collection_id, LOCAL_COLLECTION_ID],
  )?;
  let target_id = constituents
    .iter()
    .find(|c| c.collection_id == Some(collection_id))
    .and_then(|c| c.id);

  let delta = diff_details(old, new);
  let mut touched: Vec<i64> = Vec::new();
  // Additions attributed to a missing target constituent collect here.
  let mut orphan_additions: Vec<Detail> = Vec::new();

  for removed in &delta.removed {
    let Some(provenance) = removed.provenance else { continue };
    if let Some(constituent) =
      find_constituent_mut(&mut constituents, provenance.contact_id)
    {
      let before = constituent.details.len();
      constituent
        .details
        .retain(|d| d.detail_id != Some(provenance.detail_id));
      if constituent.details.len() != before {
        touched.push(provenance.contact_id);
      }
    }
  }

  for (old_detail, new_detail) in &delta.modified {
    let kind = old_detail.kind();
    // Composed kinds apply by type: the owning constituent is whichever
    // one carries a detail of that kind, preferring the provenance source.
    let owner_id = old_detail
      .provenance
      .map(|p| p.contact_id)
      .or(target_id);
    let Some(owner_id) = owner_id else {
      orphan_additions.push(strip_for_constituent(new_detail));
      continue;
    };
    let Some(constituent) = find_constituent_mut(&mut constituents, owner_id)
    else {
      continue;
    };

    let local = if kind.is_composed() {
      constituent
        .details
        .iter_mut()
        .find(|d| d.kind() == kind)
    } else {
      let by_provenance = old_detail.provenance.map(|p| p.detail_id);
      constituent.details.iter_mut().find(|d| {
        d.kind() == kind
          && (d.detail_id == by_provenance
            || d.value_equivalent(old_detail))
      })
    };

    match local {
      Some(local) => {
        let locally_edited = !local.value_equivalent(old_detail);
        match policy {
          ConflictPolicy::PreserveLocalChanges if locally_edited => {}
          _ => {
            local.data = new_detail.data.clone();
            local.contexts = new_detail.contexts.clone();
            touched.push(owner_id);
          }
        }
      }
      None => {
        // The local counterpart vanished; a stray remote modification
        // becomes an addition under PreserveRemoteChanges.
        if policy == ConflictPolicy::PreserveRemoteChanges {
          constituent.details.push(strip_for_constituent(new_detail));
          touched.push(owner_id);
        }
      }
    }
  }

  for added in &delta.added {
    let owner_id = added
      .provenance
      .filter(|p| {
        constituents.iter().any(|c| c.id == Some(p.contact_id))
      })
      .map(|p| p.contact_id)
      .or(target_id);
    match owner_id.and_then(|id| find_constituent_mut(&mut constituents, id)) {
      Some(constituent) => {
        constituent.details.push(strip_for_constituent(added));
        touched.push(constituent.id.unwrap_or_default());
      }
      None => orphan_additions.push(strip_for_constituent(added)),
    }
  }

  touched.sort_unstable();
  touched.dedup();
  for constituent in &mut constituents {
    let Some(id) = constituent.id else { continue };
    if !touched.contains(&id) {
      continue;
    }
    writer::update_contact(conn, ctx, constituent, &[])?;
    ctx.notifier.note_contact_changed(id);
  }

  // No constituent of the target collection yet: the remote additions form
  // a new one, linked to the same aggregate.
  if !orphan_additions.is_empty() {
    let mut constituent = Contact::new(collection_id);
    constituent.details = orphan_additions;
    writer::create_contact(conn, ctx, &mut constituent, &[], record_unhandled)?;
    let constituent_id = constituent
      .id
      .ok_or_else(|| engine(kindred_core::Error::Unspecified))?;
    conn.execute(
      "INSERT OR IGNORE INTO Relationships (firstId, secondId, type)
       VALUES (?1, ?2, 'Aggregates')",
      [aggregate_id, constituent_id],
    )?;
    ctx.notifier.note_contact_added(constituent_id);
  }

  ctx.notifier.note_sync_collection_changed(collection_id);
  if ctx.cfg.aggregating {
    aggregate::regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use kindred_core::detail::DetailData;

  use super::*;

  fn contact_with_details(id: i64, details: Vec<Detail>) -> Contact {
    Contact {
      id: Some(id),
      collection_id: Some(AGGREGATE_COLLECTION_ID),
      details,
      ..Default::default()
    }
  }

  fn email(id: Option<i64>, address: &str) -> Detail {
    let mut d = Detail::new(DetailData::EmailAddress(address.into()));
    d.detail_id = id;
    d
  }

  #[test]
  fn diff_classifies_by_difference() {
    let old = contact_with_details(5, vec![
      email(Some(1), "keep@x"),
      email(Some(2), "change@x"),
      email(Some(3), "drop@x"),
    ]);
    let new = contact_with_details(5, vec![
      email(Some(1), "keep@x"),
      email(Some(2), "changed@x"),
      email(None, "added@x"),
    ]);

    let delta = diff_details(&old, &new);
    assert_eq!(delta.added.len(), 1);
    assert_eq!(delta.removed.len(), 1);
    assert_eq!(delta.modified.len(), 1);
    assert!(matches!(
      &delta.modified[0].1.data,
      DetailData::EmailAddress(a) if a == "changed@x"
    ));
  }

  #[test]
  fn strip_removes_aggregate_trappings() {
    let mut detail = email(Some(9), "a@x");
    detail.detail_uri = Some("aggregate:uri".into());
    detail.access_constraints =
      AccessConstraints::READ_ONLY | AccessConstraints::IRREMOVABLE;
    detail.modifiable = false;

    let stripped = strip_for_constituent(&detail);
    assert_eq!(stripped.detail_id, None);
    assert_eq!(stripped.detail_uri.as_deref(), Some("uri"));
    assert!(stripped.access_constraints.is_empty());
    assert!(stripped.modifiable);
  }
}
