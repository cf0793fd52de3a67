//! Mutation paths: contacts, collections, relationships, identities, and
//! change-flag maintenance.
//!
//! Every public operation opens its own write transaction (the write
//! semaphore plus `BEGIN IMMEDIATE`) spanning the whole operation. Failures
//! roll back and clear the pending-notification accumulator; on commit the
//! accumulator drains to subscribers in a fixed category order.

use chrono::Utc;
use kindred_core::{
  collection::{Collection, IdentitySlot},
  contact::{
    Contact, AGGREGATE_COLLECTION_ID, LOCAL_COLLECTION_ID, CONTACT_TYPE_PERSON,
  },
  detail::{
    Detail, DetailData, DetailKind, DisplayLabelData, PresenceData,
    Provenance,
  },
  error::ErrorMap,
  flags::ChangeFlags,
  label,
  relationship::{Relationship, RelationshipType},
};
use rusqlite::{Connection, OptionalExtension as _};
use uuid::Uuid;

use crate::{
  aggregate,
  db::{DbCtx, WriteTx},
  encode::{
    encode_contexts, encode_opt_dt, encode_string_list,
  },
  tables,
  Error, Result,
};

fn engine(e: kindred_core::Error) -> Error { Error::Engine(e) }

/// Detail kinds whose mutation is fast-changing enough to bypass the
/// durable store entirely (§ transient updates).
const TRANSIENT_KINDS: &[DetailKind] = &[
  DetailKind::Presence,
  DetailKind::GlobalPresence,
  DetailKind::OnlineAccount,
  DetailKind::OriginMetadata,
];

// ─── Derived-detail synthesis ────────────────────────────────────────────────

/// Replace the synthesised `GlobalPresence` detail with the "best" presence
/// across all per-account `Presence` details, by the fixed availability
/// order.
pub(crate) fn synthesize_global_presence(contact: &mut Contact) {
  let best: Option<PresenceData> = contact
    .details_of(DetailKind::Presence)
    .filter_map(|d| match &d.data {
      DetailData::Presence(p) => Some(p.clone()),
      _ => None,
    })
    .min_by_key(|p| p.state.availability_rank());

  contact.remove_details_of(DetailKind::GlobalPresence);
  if let Some(presence) = best {
    contact.push_detail(DetailData::GlobalPresence(presence));
  }
}

/// Recompute the display label, its group, and the group's sort order.
pub(crate) fn recompute_display_label(ctx: &DbCtx, contact: &mut Contact) {
  contact.remove_details_of(DetailKind::DisplayLabel);
  let Some(text) = label::synthesize_display_label(contact) else {
    return;
  };
  let generators = ctx.cfg.generator_refs();
  let group = label::group_for_text(&generators, &ctx.cfg.locale, &text);
  let sort = label::group_sort_value(&group, &ctx.cfg.known_groups);
  if !ctx.cfg.known_groups.contains_key(&group) {
    ctx.notifier.note_display_label_groups_changed();
  }
  contact.push_detail(DetailData::DisplayLabel(DisplayLabelData {
    label:            text,
    group:            Some(group),
    group_sort_order: Some(sort),
  }));
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Enforce the detail constraints: singular cardinality, per-contact URI
/// uniqueness, and the deactivation restrictions.
fn validate_details(contact: &Contact, collection_id: i64) -> Result<()> {
  for kind in DetailKind::ALL {
    if kind.is_singular() && contact.details_of(kind).count() > 1 {
      return Err(engine(kindred_core::Error::LimitReached));
    }
  }

  let mut uris: Vec<&str> = contact
    .details
    .iter()
    .filter_map(|d| d.detail_uri.as_deref())
    .filter(|uri| !uri.is_empty())
    .collect();
  uris.sort_unstable();
  let before = uris.len();
  uris.dedup();
  if uris.len() != before {
    return Err(engine(kindred_core::Error::InvalidDetail));
  }

  if contact.single_detail(DetailKind::Deactivated).is_some()
    && (collection_id == AGGREGATE_COLLECTION_ID
      || collection_id == LOCAL_COLLECTION_ID)
  {
    return Err(engine(kindred_core::Error::BadArgument));
  }
  Ok(())
}

// ─── Detail persistence ──────────────────────────────────────────────────────

/// Delete and reinsert the contact's details for each kind in `kinds`,
/// writing provenance back into the in-memory details. Aggregate details
/// arrive with provenance already set (copied from their source) and keep
/// it.
pub(crate) fn write_details(
  conn: &Connection,
  contact: &mut Contact,
  kinds: &[DetailKind],
  detail_flags: ChangeFlags,
) -> Result<()> {
  let contact_id = contact.id.ok_or_else(|| engine(kindred_core::Error::Unspecified))?;
  let collection_id = contact.collection_id.unwrap_or(LOCAL_COLLECTION_ID);

  for kind in kinds {
    let Some(table) = tables::table_for(*kind) else { continue };
    conn.execute(
      &format!("DELETE FROM {table} WHERE contactId = ?1"),
      [contact_id],
    )?;
    conn.execute(
      "DELETE FROM Details WHERE contactId = ?1 AND detail = ?2",
      rusqlite::params![contact_id, kind.as_str()],
    )?;
  }

  for detail in &mut contact.details {
    let kind = detail.kind();
    if !kinds.contains(&kind) {
      continue;
    }
    let Some(insert_sql) = tables::insert_sql(kind) else { continue };

    conn.execute(
      "INSERT INTO Details (contactId, detail, detailUri, linkedDetailUris,
                            contexts, accessConstraints, provenance,
                            modifiable, nonexportable, changeFlags)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
      rusqlite::params![
        contact_id,
        kind.as_str(),
        detail.detail_uri,
        encode_string_list(&detail.linked_detail_uris)?,
        encode_contexts(&detail.contexts),
        detail.access_constraints.bits() as i64,
        detail.provenance.as_ref().map(Provenance::encode),
        detail.modifiable,
        detail.nonexportable,
        detail_flags.bits() as i64,
      ],
    )?;
    let detail_id = conn.last_insert_rowid();
    detail.detail_id = Some(detail_id);
    detail.change_flags = detail_flags;

    // Non-aggregate details always carry their own triple as provenance
    // (stale triples from a previous write are refreshed); aggregate
    // details keep the source constituent's.
    if collection_id != AGGREGATE_COLLECTION_ID {
      let provenance =
        Provenance { collection_id, contact_id, detail_id };
      detail.provenance = Some(provenance);
      conn.execute(
        "UPDATE Details SET provenance = ?2 WHERE detailId = ?1",
        rusqlite::params![detail_id, provenance.encode()],
      )?;
    }

    let mut values = vec![
      rusqlite::types::Value::Integer(detail_id),
      rusqlite::types::Value::Integer(contact_id),
    ];
    values.extend(tables::bind_values(&detail.data)?);
    conn.execute(&insert_sql, rusqlite::params_from_iter(values.iter()))?;
  }
  Ok(())
}

/// Recompute the rollup columns from the durable detail rows.
pub(crate) fn update_rollups(conn: &Connection, contact_id: i64) -> Result<()> {
  conn.execute(
    "UPDATE Contacts SET
       hasPhoneNumber = EXISTS(SELECT 1 FROM PhoneNumbers WHERE contactId = ?1),
       hasEmailAddress = EXISTS(SELECT 1 FROM EmailAddresses WHERE contactId = ?1),
       hasOnlineAccount = EXISTS(SELECT 1 FROM OnlineAccounts WHERE contactId = ?1),
       isOnline = EXISTS(SELECT 1 FROM GlobalPresences
                         WHERE contactId = ?1 AND presenceState BETWEEN 1 AND 5
                           AND presenceState != 2)
     WHERE contactId = ?1",
    [contact_id],
  )?;
  Ok(())
}

// ─── Contact save ────────────────────────────────────────────────────────────

fn collection_of(conn: &Connection, collection_id: i64) -> Result<Option<(bool, bool)>> {
  // (aggregable, record_unhandled_change_flags)
  Ok(
    conn
      .query_row(
        "SELECT aggregable, recordUnhandledChangeFlags FROM Collections
         WHERE collectionId = ?1 AND changeFlags < 4",
        [collection_id],
        |row| {
          Ok((
            row.get::<_, Option<bool>>(0)?.unwrap_or(true),
            row.get::<_, Option<bool>>(1)?.unwrap_or(false),
          ))
        },
      )
      .optional()?,
  )
}

/// The full mask used when the caller provided none.
fn effective_mask(mask: &[DetailKind]) -> Vec<DetailKind> {
  if mask.is_empty() {
    DetailKind::ALL.to_vec()
  } else {
    let mut kinds = mask.to_vec();
    // Engine-derived kinds ride along with their inputs.
    if kinds.contains(&DetailKind::Presence)
      && !kinds.contains(&DetailKind::GlobalPresence)
    {
      kinds.push(DetailKind::GlobalPresence);
    }
    if !kinds.contains(&DetailKind::DisplayLabel) {
      kinds.push(DetailKind::DisplayLabel);
    }
    kinds
  }
}

pub(crate) fn create_contact(
  conn: &Connection,
  ctx: &DbCtx,
  contact: &mut Contact,
  mask: &[DetailKind],
  record_unhandled: bool,
) -> Result<()> {
  let collection_id = contact.collection_id.unwrap_or(LOCAL_COLLECTION_ID);
  contact.collection_id = Some(collection_id);

  validate_details(contact, collection_id)?;

  if collection_id == LOCAL_COLLECTION_ID
    && contact.single_detail(DetailKind::Guid).is_none()
  {
    contact.push_detail(DetailData::Guid(Uuid::new_v4().to_string()));
  }

  if mask.is_empty() || mask.contains(&DetailKind::Presence) {
    synthesize_global_presence(contact);
  }
  recompute_display_label(ctx, contact);

  let now = Utc::now();
  contact.created = Some(now);
  contact.modified = Some(now);

  let is_deactivated =
    contact.single_detail(DetailKind::Deactivated).is_some();
  let change_flags = ChangeFlags::IS_ADDED;
  let unhandled = if record_unhandled { change_flags } else { ChangeFlags::empty() };

  conn.execute(
    "INSERT INTO Contacts (collectionId, created, modified, isDeactivated,
                           changeFlags, unhandledChangeFlags, type)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    rusqlite::params![
      collection_id,
      encode_opt_dt(contact.created),
      encode_opt_dt(contact.modified),
      is_deactivated,
      change_flags.bits() as i64,
      unhandled.bits() as i64,
      CONTACT_TYPE_PERSON,
    ],
  )?;
  contact.id = Some(conn.last_insert_rowid());
  contact.change_flags = change_flags;

  write_details(
    conn,
    contact,
    &DetailKind::ALL,
    ChangeFlags::IS_ADDED,
  )?;
  update_rollups(conn, contact.id.unwrap_or_default())?;
  Ok(())
}

pub(crate) fn update_contact(
  conn: &Connection,
  ctx: &DbCtx,
  contact: &mut Contact,
  mask: &[DetailKind],
) -> Result<()> {
  let contact_id =
    contact.id.ok_or_else(|| engine(kindred_core::Error::DoesNotExist))?;

  let existing: Option<(Option<i64>, i64)> = conn
    .query_row(
      "SELECT collectionId, changeFlags FROM Contacts WHERE contactId = ?1",
      [contact_id],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?;
  let Some((existing_collection, existing_flags)) = existing else {
    return Err(engine(kindred_core::Error::DoesNotExist));
  };
  if ChangeFlags::from_bits_truncate(existing_flags as u32).is_deleted() {
    return Err(engine(kindred_core::Error::DoesNotExist));
  }

  let collection_id = existing_collection.unwrap_or(LOCAL_COLLECTION_ID);
  if let Some(requested) = contact.collection_id
    && requested != collection_id
  {
    // Contacts never move between collections.
    return Err(engine(kindred_core::Error::Unspecified));
  }
  contact.collection_id = Some(collection_id);

  // A mutation confined to the presence cluster is applied to the overlay
  // only; durable rows remain untouched.
  if !mask.is_empty()
    && mask.iter().all(|kind| TRANSIENT_KINDS.contains(kind))
  {
    synthesize_global_presence(contact);
    let now = Utc::now();
    let overlay: Vec<Detail> = contact
      .details
      .iter()
      .filter(|d| TRANSIENT_KINDS.contains(&d.kind()))
      .cloned()
      .collect();
    ctx.transient.set_contact_details(contact_id, now, &overlay)?;
    ctx.notifier.note_contact_presence_changed(contact_id);
    return Ok(());
  }

  // Durable write: the overlay is invalidated first, so status rollups are
  // recomputed from durable rows.
  ctx.transient.remove(contact_id)?;

  validate_details(contact, collection_id)?;
  if mask.is_empty() || mask.contains(&DetailKind::Presence) {
    synthesize_global_presence(contact);
  }
  recompute_display_label(ctx, contact);

  let now = Utc::now();
  contact.modified = Some(now);
  let is_deactivated =
    contact.single_detail(DetailKind::Deactivated).is_some();

  conn.execute(
    "UPDATE Contacts SET modified = ?2, isDeactivated = ?3,
       changeFlags = changeFlags | ?4, unhandledChangeFlags = unhandledChangeFlags | ?4
     WHERE contactId = ?1",
    rusqlite::params![
      contact_id,
      encode_opt_dt(contact.modified),
      is_deactivated,
      ChangeFlags::IS_MODIFIED.bits() as i64,
    ],
  )?;

  write_details(
    conn,
    contact,
    &effective_mask(mask),
    ChangeFlags::IS_MODIFIED,
  )?;
  update_rollups(conn, contact_id)?;
  Ok(())
}

/// Create or update a batch of contacts. The batch must target a single
/// collection; direct writes to the aggregate collection are rejected.
pub(crate) fn save_contacts(
  conn: &Connection,
  ctx: &DbCtx,
  contacts: &mut [Contact],
  mask: &[DetailKind],
  errors: &mut ErrorMap,
) -> Result<()> {
  if contacts.is_empty() {
    return Ok(());
  }

  let collection_id = contacts[0]
    .collection_id
    .unwrap_or(LOCAL_COLLECTION_ID);
  if collection_id == AGGREGATE_COLLECTION_ID {
    errors.insert(0, kindred_core::Error::BadArgument);
    return Err(engine(kindred_core::Error::BadArgument));
  }
  for (index, contact) in contacts.iter().enumerate() {
    if contact.collection_id.unwrap_or(LOCAL_COLLECTION_ID) != collection_id {
      errors.insert(index, kindred_core::Error::BadArgument);
      return Err(engine(kindred_core::Error::BadArgument));
    }
  }

  let Some((aggregable, record_unhandled)) = collection_of(conn, collection_id)?
  else {
    errors.insert(0, kindred_core::Error::BadArgument);
    return Err(engine(kindred_core::Error::BadArgument));
  };

  let tx = WriteTx::begin(conn, ctx)?;

  let mut saved_ids: Vec<(i64, bool)> = Vec::new(); // (id, created)
  for (index, contact) in contacts.iter_mut().enumerate() {
    let creating = contact.id.is_none();
    let result = if creating {
      contact.collection_id = Some(collection_id);
      create_contact(conn, ctx, contact, mask, record_unhandled)
    } else {
      update_contact(conn, ctx, contact, mask)
    };
    match result {
      Ok(()) => {
        if let Some(id) = contact.id {
          // Transient-only updates notify presence; everything else counts
          // as a durable save.
          let durable = creating
            || mask.is_empty()
            || !mask.iter().all(|kind| TRANSIENT_KINDS.contains(kind));
          if durable {
            saved_ids.push((id, creating));
          }
        }
      }
      Err(e) => {
        errors.insert(index, e.into_taxonomy("save_contacts"));
        // Contact batches are atomic: the guard rolls back on drop.
        return Err(engine(
          kindred_core::error::worst_of(errors)
            .unwrap_or(kindred_core::Error::Unspecified),
        ));
      }
    }
  }

  for (id, created) in &saved_ids {
    if *created {
      ctx.notifier.note_contact_added(*id);
    } else {
      ctx.notifier.note_contact_changed(*id);
    }
  }
  if !saved_ids.is_empty() && collection_id != LOCAL_COLLECTION_ID {
    ctx.notifier.note_sync_collection_changed(collection_id);
  }

  if ctx.cfg.aggregating && aggregable && !saved_ids.is_empty() {
    for (id, _) in &saved_ids {
      let deactivated: bool = conn.query_row(
        "SELECT isDeactivated FROM Contacts WHERE contactId = ?1",
        [id],
        |row| row.get(0),
      )?;
      if !deactivated {
        aggregate::upsert_aggregate(conn, ctx, *id)?;
      }
    }
    // Saves may have deactivated constituents (leaving their aggregate
    // childless) or reactivated ones (leaving them parentless).
    aggregate::remove_childless_aggregates(conn, ctx)?;
    aggregate::aggregate_orphans(conn, ctx)?;
  }

  tx.commit()
}

// ─── Contact removal ─────────────────────────────────────────────────────────

/// Tombstone non-aggregate contacts: the contact row and its detail rows
/// gain `IsDeleted`; physical removal waits for the owning collection's
/// removal or a change-flag clear.
pub(crate) fn remove_contacts(
  conn: &Connection,
  ctx: &DbCtx,
  ids: &[i64],
  errors: &mut ErrorMap,
) -> Result<()> {
  let tx = WriteTx::begin(conn, ctx)?;
  let now = encode_opt_dt(Some(Utc::now()));

  let mut affected_aggregates: Vec<i64> = Vec::new();
  for (index, id) in ids.iter().enumerate() {
    let row: Option<(Option<i64>, i64)> = conn
      .query_row(
        "SELECT collectionId, changeFlags FROM Contacts WHERE contactId = ?1",
        [id],
        |r| Ok((r.get(0)?, r.get(1)?)),
      )
      .optional()?;
    let Some((collection_id, flags)) = row else {
      errors.insert(index, kindred_core::Error::DoesNotExist);
      continue;
    };
    if ChangeFlags::from_bits_truncate(flags as u32).is_deleted() {
      errors.insert(index, kindred_core::Error::DoesNotExist);
      continue;
    }
    let collection_id = collection_id.unwrap_or(LOCAL_COLLECTION_ID);
    if collection_id == AGGREGATE_COLLECTION_ID || *id <= 2 {
      errors.insert(index, kindred_core::Error::BadArgument);
      continue;
    }

    conn.execute(
      "UPDATE Contacts SET changeFlags = changeFlags | 4,
         unhandledChangeFlags = unhandledChangeFlags | 4,
         deleted = ?2, modified = ?2
       WHERE contactId = ?1",
      rusqlite::params![id, now],
    )?;
    conn.execute(
      "UPDATE Details SET changeFlags = changeFlags | 4 WHERE contactId = ?1",
      [id],
    )?;
    ctx.transient.remove(*id)?;
    ctx.notifier.note_contact_removed(*id);
    if collection_id != LOCAL_COLLECTION_ID {
      ctx.notifier.note_sync_collection_changed(collection_id);
    }

    let parents: Vec<i64> = {
      let mut stmt = conn.prepare(
        "SELECT firstId FROM Relationships
         WHERE secondId = ?1 AND type = 'Aggregates'",
      )?;
      stmt
        .query_map([id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };
    affected_aggregates.extend(parents);
  }

  if ctx.cfg.aggregating {
    affected_aggregates.sort_unstable();
    affected_aggregates.dedup();
    for aggregate_id in affected_aggregates {
      aggregate::regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
    }
    aggregate::remove_childless_aggregates(conn, ctx)?;
  }

  tx.commit()
}

// ─── Relationships ───────────────────────────────────────────────────────────

fn contact_exists_active(conn: &Connection, id: i64) -> Result<bool> {
  let flags: Option<i64> = conn
    .query_row(
      "SELECT changeFlags FROM Contacts WHERE contactId = ?1",
      [id],
      |row| row.get(0),
    )
    .optional()?;
  Ok(matches!(flags, Some(f) if !ChangeFlags::from_bits_truncate(f as u32).is_deleted()))
}

/// Insert relationships. Duplicates are silently idempotent; invalid
/// participants mark their index without aborting siblings.
pub(crate) fn save_relationships(
  conn: &Connection,
  ctx: &DbCtx,
  relationships: &[Relationship],
  errors: &mut ErrorMap,
) -> Result<()> {
  let tx = WriteTx::begin(conn, ctx)?;

  let mut touched_aggregates: Vec<i64> = Vec::new();
  for (index, relationship) in relationships.iter().enumerate() {
    if relationship.first_id == relationship.second_id
      || !contact_exists_active(conn, relationship.first_id)?
      || !contact_exists_active(conn, relationship.second_id)?
    {
      errors.insert(index, kindred_core::Error::InvalidRelationship);
      continue;
    }

    let inserted = conn.execute(
      "INSERT OR IGNORE INTO Relationships (firstId, secondId, type)
       VALUES (?1, ?2, ?3)",
      rusqlite::params![
        relationship.first_id,
        relationship.second_id,
        relationship.rel_type.as_str(),
      ],
    )?;
    if inserted > 0 {
      match relationship.rel_type {
        RelationshipType::Aggregates => {
          touched_aggregates.push(relationship.first_id);
        }
        RelationshipType::IsNot => {
          ctx.notifier.note_contact_changed(relationship.first_id);
          ctx.notifier.note_contact_changed(relationship.second_id);
        }
        _ => {}
      }
    }
  }

  if ctx.cfg.aggregating {
    touched_aggregates.sort_unstable();
    touched_aggregates.dedup();
    for aggregate_id in touched_aggregates {
      aggregate::regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
    }
  }

  tx.commit()
}

/// Remove relationships; removing an `Aggregates` edge triggers aggregate
/// regeneration, childless cleanup, and re-aggregation of orphans.
pub(crate) fn remove_relationships(
  conn: &Connection,
  ctx: &DbCtx,
  relationships: &[Relationship],
  errors: &mut ErrorMap,
) -> Result<()> {
  let tx = WriteTx::begin(conn, ctx)?;

  let mut touched_aggregates: Vec<i64> = Vec::new();
  for (index, relationship) in relationships.iter().enumerate() {
    let removed = conn.execute(
      "DELETE FROM Relationships WHERE firstId = ?1 AND secondId = ?2 AND type = ?3",
      rusqlite::params![
        relationship.first_id,
        relationship.second_id,
        relationship.rel_type.as_str(),
      ],
    )?;
    if removed == 0 {
      errors.insert(index, kindred_core::Error::DoesNotExist);
      continue;
    }
    if relationship.rel_type == RelationshipType::Aggregates {
      touched_aggregates.push(relationship.first_id);
    }
  }

  if ctx.cfg.aggregating && !touched_aggregates.is_empty() {
    touched_aggregates.sort_unstable();
    touched_aggregates.dedup();
    for aggregate_id in touched_aggregates {
      aggregate::regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
    }
    aggregate::remove_childless_aggregates(conn, ctx)?;
    aggregate::aggregate_orphans(conn, ctx)?;
  }

  tx.commit()
}

// ─── Collections ─────────────────────────────────────────────────────────────

fn write_collection_metadata(
  conn: &Connection,
  collection: &Collection,
) -> Result<()> {
  let Some(id) = collection.id else { return Ok(()) };
  conn.execute(
    "DELETE FROM CollectionsMetadata WHERE collectionId = ?1",
    [id],
  )?;
  let mut stmt = conn.prepare(
    "INSERT INTO CollectionsMetadata (collectionId, key, value) VALUES (?1, ?2, ?3)",
  )?;
  for (key, value) in &collection.metadata {
    stmt.execute(rusqlite::params![id, key, serde_json::to_string(value)?])?;
  }
  Ok(())
}

pub(crate) fn save_collections(
  conn: &Connection,
  ctx: &DbCtx,
  collections: &mut [Collection],
  errors: &mut ErrorMap,
) -> Result<()> {
  let tx = WriteTx::begin(conn, ctx)?;

  for (index, collection) in collections.iter_mut().enumerate() {
    if collection.id == Some(AGGREGATE_COLLECTION_ID) {
      errors.insert(index, kindred_core::Error::BadArgument);
      continue;
    }
    match collection.id {
      None => {
        conn.execute(
          "INSERT INTO Collections (aggregable, name, description, color,
             secondaryColor, image, applicationName, accountId, remotePath,
             changeFlags, recordUnhandledChangeFlags)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
          rusqlite::params![
            collection.aggregable,
            collection.name,
            collection.description,
            collection.color,
            collection.secondary_color,
            collection.image,
            collection.application_name,
            collection.account_id,
            collection.remote_path,
            ChangeFlags::IS_ADDED.bits() as i64,
            collection.record_unhandled_change_flags,
          ],
        )?;
        collection.id = Some(conn.last_insert_rowid());
        collection.change_flags = ChangeFlags::IS_ADDED;
        write_collection_metadata(conn, collection)?;
        ctx.notifier.note_collection_added(collection.id.unwrap_or_default());
      }
      Some(id) => {
        let updated = conn.execute(
          "UPDATE Collections SET aggregable = ?2, name = ?3, description = ?4,
             color = ?5, secondaryColor = ?6, image = ?7, applicationName = ?8,
             accountId = ?9, remotePath = ?10,
             changeFlags = changeFlags | ?11,
             recordUnhandledChangeFlags = ?12
           WHERE collectionId = ?1 AND changeFlags < 4",
          rusqlite::params![
            id,
            collection.aggregable,
            collection.name,
            collection.description,
            collection.color,
            collection.secondary_color,
            collection.image,
            collection.application_name,
            collection.account_id,
            collection.remote_path,
            ChangeFlags::IS_MODIFIED.bits() as i64,
            collection.record_unhandled_change_flags,
          ],
        )?;
        if updated == 0 {
          errors.insert(index, kindred_core::Error::DoesNotExist);
          continue;
        }
        write_collection_metadata(conn, collection)?;
        ctx.notifier.note_collection_changed(id);
      }
    }
  }

  tx.commit()
}

/// Remove collections. Reserved collections are protected. Removal cascades
/// to all contacts of the collection: physically when `clear_change_flags`
/// is set, as tombstones otherwise.
pub(crate) fn remove_collections(
  conn: &Connection,
  ctx: &DbCtx,
  ids: &[i64],
  clear_change_flags: bool,
  errors: &mut ErrorMap,
) -> Result<()> {
  let tx = WriteTx::begin(conn, ctx)?;
  let now = encode_opt_dt(Some(Utc::now()));

  for (index, collection_id) in ids.iter().enumerate() {
    if *collection_id == AGGREGATE_COLLECTION_ID
      || *collection_id == LOCAL_COLLECTION_ID
    {
      errors.insert(index, kindred_core::Error::BadArgument);
      continue;
    }
    let exists: Option<i64> = conn
      .query_row(
        "SELECT collectionId FROM Collections WHERE collectionId = ?1 AND changeFlags < 4",
        [collection_id],
        |row| row.get(0),
      )
      .optional()?;
    if exists.is_none() {
      errors.insert(index, kindred_core::Error::DoesNotExist);
      continue;
    }

    let contact_ids: Vec<i64> = {
      let mut stmt = conn.prepare(
        "SELECT contactId FROM Contacts WHERE collectionId = ?1",
      )?;
      stmt
        .query_map([collection_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    if clear_change_flags {
      // Physical removal; the delete trigger records the tombstones.
      conn.execute(
        "DELETE FROM Contacts WHERE collectionId = ?1",
        [collection_id],
      )?;
      conn.execute(
        "DELETE FROM CollectionsMetadata WHERE collectionId = ?1",
        [collection_id],
      )?;
      conn.execute(
        "DELETE FROM Collections WHERE collectionId = ?1",
        [collection_id],
      )?;
    } else {
      conn.execute(
        "UPDATE Contacts SET changeFlags = changeFlags | 4,
           unhandledChangeFlags = unhandledChangeFlags | 4,
           deleted = ?2, modified = ?2
         WHERE collectionId = ?1",
        rusqlite::params![collection_id, now],
      )?;
      conn.execute(
        "UPDATE Details SET changeFlags = changeFlags | 4
         WHERE contactId IN (SELECT contactId FROM Contacts WHERE collectionId = ?1)",
        [collection_id],
      )?;
      conn.execute(
        "UPDATE Collections SET changeFlags = changeFlags | 4 WHERE collectionId = ?1",
        [collection_id],
      )?;
    }

    ctx.transient.remove_many(&contact_ids)?;
    for contact_id in &contact_ids {
      ctx.notifier.note_contact_removed(*contact_id);
    }
    ctx.notifier.note_collection_removed(*collection_id);
  }

  if ctx.cfg.aggregating {
    aggregate::remove_childless_aggregates(conn, ctx)?;
  }

  tx.commit()
}

// ─── Identities ──────────────────────────────────────────────────────────────

pub(crate) fn identity(
  conn: &Connection,
  slot: IdentitySlot,
) -> Result<Option<i64>> {
  Ok(
    conn
      .query_row(
        "SELECT contactId FROM Identities WHERE identity = ?1",
        [slot.to_int()],
        |row| row.get(0),
      )
      .optional()?,
  )
}

/// Write an identity slot. The self-contact slot is fixed at
/// initialisation and cannot be reassigned.
pub(crate) fn set_identity(
  _conn: &Connection,
  slot: IdentitySlot,
  _contact_id: i64,
) -> Result<()> {
  match slot {
    IdentitySlot::SelfContactId => {
      Err(engine(kindred_core::Error::BadArgument))
    }
  }
}

// ─── Change-flag clearing ────────────────────────────────────────────────────

/// Clear the change flags of a collection and its contacts after a sync
/// adapter has uploaded them. Tombstoned rows are physically removed at
/// this point.
pub(crate) fn clear_change_flags(
  conn: &Connection,
  ctx: &DbCtx,
  collection_id: i64,
) -> Result<()> {
  let tx = WriteTx::begin(conn, ctx)?;

  conn.execute(
    "DELETE FROM Contacts WHERE collectionId = ?1 AND changeFlags >= 4",
    [collection_id],
  )?;
  conn.execute(
    "DELETE FROM Details WHERE changeFlags >= 4
     AND contactId IN (SELECT contactId FROM Contacts WHERE collectionId = ?1)",
    [collection_id],
  )?;
  conn.execute(
    "UPDATE Contacts SET changeFlags = 0, unhandledChangeFlags = 0
     WHERE collectionId = ?1",
    [collection_id],
  )?;
  conn.execute(
    "UPDATE Details SET changeFlags = 0, unhandledChangeFlags = 0
     WHERE contactId IN (SELECT contactId FROM Contacts WHERE collectionId = ?1)",
    [collection_id],
  )?;
  conn.execute(
    "UPDATE Collections SET changeFlags = 0 WHERE collectionId = ?1 AND changeFlags < 4",
    [collection_id],
  )?;
  conn.execute(
    "DELETE FROM Collections WHERE collectionId = ?1 AND changeFlags >= 4",
    [collection_id],
  )?;

  tx.commit()
}
