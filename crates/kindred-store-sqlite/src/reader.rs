//! Query execution and contact assembly.
//!
//! Ids are resolved first through the compiled filter; matching contacts
//! are then assembled from three ascending cursors (contact rows, detail
//! rows joined across the per-type tables against a transient ids table,
//! and relationships), with the transient overlay spliced in last.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use kindred_core::{
  collection::{Collection, CollectionChanges},
  contact::{Contact, AGGREGATE_COLLECTION_ID},
  detail::{Detail, DetailData, DetailKind, Provenance},
  filter::{ChangeLogEvent, DetailFilter, Field, FetchHint, Filter, FilterValue, SortOrder},
  flags::{AccessConstraints, ChangeFlags, StatusFlags},
  relationship::{Relationship, RelationshipType},
};
use rusqlite::{types::Value, Connection, Row};

use crate::{
  compile::{apply_default_constraints, compile_filter, compile_sort},
  db::{
    create_transient_id_table, drop_transient_id_tables,
    populate_overlay_tables, DbCtx,
  },
  encode::{decode_contexts, decode_opt_dt, decode_string_list},
  tables,
  Error, Result,
};

/// Streaming batch size for `read_contacts`.
pub(crate) const DEFAULT_BATCH_SIZE: usize = 50;

fn unsupported() -> Error { Error::Engine(kindred_core::Error::Unspecified) }

// ─── Id queries ──────────────────────────────────────────────────────────────

/// Resolve the ids matching `filter` in `orders` order, applying the
/// default visibility constraints.
pub(crate) fn query_contact_ids(
  conn: &Connection,
  ctx: &DbCtx,
  filter: &Filter,
  orders: &[SortOrder],
) -> Result<Vec<i64>> {
  drop_transient_id_tables(conn, "filterIds")?;

  let compiled_where = compile_filter(conn, ctx, filter)?;
  let compiled_order = compile_sort(ctx, orders)?;

  populate_overlay_tables(
    conn,
    ctx,
    compiled_where.needs_timestamp || compiled_order.needs_timestamp,
    compiled_where.needs_presence || compiled_order.needs_presence,
  )?;

  let mut sql = String::from("SELECT Contacts.contactId FROM Contacts");
  if compiled_where.needs_timestamp || compiled_order.needs_timestamp {
    sql.push_str(
      " LEFT JOIN temp.Timestamps ON temp.Timestamps.contactId = Contacts.contactId",
    );
  }
  if compiled_where.needs_presence || compiled_order.needs_presence {
    sql.push_str(
      " LEFT JOIN temp.GlobalPresenceStates ON temp.GlobalPresenceStates.contactId = Contacts.contactId",
    );
  }
  for table in &compiled_order.joins {
    sql.push_str(&format!(
      " LEFT JOIN {table} ON {table}.contactId = Contacts.contactId"
    ));
  }

  let where_clause = apply_default_constraints(&compiled_where);
  if !where_clause.is_empty() {
    sql.push_str(" WHERE ");
    sql.push_str(&where_clause);
  }
  sql.push_str(" ORDER BY ");
  sql.push_str(&compiled_order.order_by);

  ctx.trace_sql(&sql, compiled_where.bindings.len());

  let mut stmt = conn.prepare(&sql)?;
  let rows = stmt
    .query_map(
      rusqlite::params_from_iter(compiled_where.bindings.iter()),
      |row| row.get::<_, i64>(0),
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  // Sort joins against non-singular detail tables can duplicate rows; keep
  // the first occurrence so caller-visible order is preserved.
  let mut seen = HashSet::new();
  Ok(rows.into_iter().filter(|id| seen.insert(*id)).collect())
}

// ─── Assembly ────────────────────────────────────────────────────────────────

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Contact)> {
  let id: i64 = row.get(0)?;
  let mut status = StatusFlags::empty();
  for (index, flag) in [
    (5, StatusFlags::HAS_PHONE_NUMBER),
    (6, StatusFlags::HAS_EMAIL_ADDRESS),
    (7, StatusFlags::HAS_ONLINE_ACCOUNT),
    (8, StatusFlags::IS_ONLINE),
    (9, StatusFlags::IS_DEACTIVATED),
  ] {
    if row.get::<_, Option<bool>>(index)?.unwrap_or(false) {
      status |= flag;
    }
  }
  let change_flags =
    ChangeFlags::from_bits_truncate(row.get::<_, i64>(10)? as u32);

  Ok((id, Contact {
    id: Some(id),
    collection_id: row.get(1)?,
    created: None,  // decoded by the caller (fallible string parse)
    modified: None,
    deleted: None,
    status_flags: status,
    change_flags,
    details: Vec::new(),
    relationships: Vec::new(),
  }))
}

struct DetailEnvelope {
  detail_id:          i64,
  contact_id:         i64,
  kind:               DetailKind,
  detail_uri:         Option<String>,
  linked_detail_uris: Vec<String>,
  contexts:           Vec<kindred_core::detail::Context>,
  access_constraints: AccessConstraints,
  provenance:         Option<Provenance>,
  modifiable:         bool,
  nonexportable:      bool,
  change_flags:       ChangeFlags,
}

/// Materialise the given contacts. Results follow the order of `ids`;
/// missing ids are absent from the returned map.
pub(crate) fn fetch_contacts(
  conn: &Connection,
  ctx: &DbCtx,
  ids: &[i64],
  hint: &FetchHint,
  keep_change_flags: bool,
  relax_constraints: bool,
) -> Result<BTreeMap<i64, Contact>> {
  let mut contacts: BTreeMap<i64, Contact> = BTreeMap::new();
  if ids.is_empty() {
    return Ok(contacts);
  }

  drop_transient_id_tables(conn, "fetchIds")?;
  let ids_table = create_transient_id_table(conn, "fetchIds", ids)?;

  // Contact rows.
  {
    let sql = format!(
      "SELECT contactId, collectionId, created, modified, deleted,
              hasPhoneNumber, hasEmailAddress, hasOnlineAccount, isOnline,
              isDeactivated, changeFlags, type
       FROM Contacts
       WHERE contactId IN (SELECT contactId FROM {ids_table})
       ORDER BY contactId ASC"
    );
    ctx.trace_sql(&sql, 0);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map([], |row| {
        let (id, contact) = contact_from_row(row)?;
        let created: Option<String> = row.get(2)?;
        let modified: Option<String> = row.get(3)?;
        let deleted: Option<String> = row.get(4)?;
        Ok((id, contact, created, modified, deleted))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, mut contact, created, modified, deleted) in rows {
      contact.created = decode_opt_dt(created)?;
      contact.modified = decode_opt_dt(modified)?;
      contact.deleted = decode_opt_dt(deleted)?;
      contacts.insert(id, contact);
    }
  }

  // Detail envelopes, ascending by contactId then detailId.
  let envelopes: Vec<DetailEnvelope> = {
    let sql = format!(
      "SELECT detailId, contactId, detail, detailUri, linkedDetailUris,
              contexts, accessConstraints, provenance, modifiable,
              nonexportable, changeFlags
       FROM Details
       WHERE contactId IN (SELECT contactId FROM {ids_table})
       ORDER BY contactId ASC, detailId ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, i64>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, Option<String>>(3)?,
          row.get::<_, Option<String>>(4)?,
          row.get::<_, Option<String>>(5)?,
          row.get::<_, i64>(6)?,
          row.get::<_, Option<String>>(7)?,
          row.get::<_, Option<bool>>(8)?,
          row.get::<_, Option<bool>>(9)?,
          row.get::<_, i64>(10)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut envelopes = Vec::with_capacity(raw.len());
    for (
      detail_id,
      contact_id,
      kind_str,
      detail_uri,
      linked,
      contexts,
      constraints,
      provenance,
      modifiable,
      nonexportable,
      change_flags,
    ) in raw
    {
      // Unknown discriminants (written by a newer engine) are skipped.
      let Some(kind) = DetailKind::from_str(&kind_str) else {
        continue;
      };
      envelopes.push(DetailEnvelope {
        detail_id,
        contact_id,
        kind,
        detail_uri,
        linked_detail_uris: decode_string_list(linked)?,
        contexts: decode_contexts(contexts),
        access_constraints: AccessConstraints::from_bits_truncate(
          constraints as u32,
        ),
        provenance: provenance.as_deref().and_then(Provenance::decode),
        modifiable: modifiable.unwrap_or(true),
        nonexportable: nonexportable.unwrap_or(false),
        change_flags: ChangeFlags::from_bits_truncate(change_flags as u32),
      });
    }
    envelopes
  };

  // Per-type data, keyed by detailId.
  let mut data_by_detail: HashMap<i64, DetailData> = HashMap::new();
  let requested: Vec<DetailKind> = DetailKind::ALL
    .into_iter()
    .filter(|kind| hint.wants_kind(*kind))
    .collect();
  for kind in &requested {
    let Some(sql) = tables::select_sql(*kind, &ids_table) else {
      continue;
    };
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
      let detail_id: i64 = row.get(1)?;
      data_by_detail.insert(detail_id, tables::read_data(*kind, row, 2)?);
    }
  }

  // Overlay snapshot per contact: kinds present in the overlay supersede
  // their durable counterparts.
  let mut overlays: HashMap<i64, (DateTime<Utc>, Vec<Detail>)> = HashMap::new();
  for id in contacts.keys() {
    if let Some(entry) = ctx.transient.contact_details(*id)? {
      overlays.insert(*id, entry);
    }
  }

  for envelope in envelopes {
    let Some(contact) = contacts.get_mut(&envelope.contact_id) else {
      continue;
    };
    if !hint.wants_kind(envelope.kind) {
      continue;
    }
    if envelope.change_flags.is_deleted() && !keep_change_flags {
      continue;
    }
    if let Some((_, overlay_details)) = overlays.get(&envelope.contact_id)
      && overlay_details.iter().any(|d| d.kind() == envelope.kind)
    {
      continue;
    }
    let Some(data) = data_by_detail.remove(&envelope.detail_id) else {
      continue;
    };
    contact.details.push(Detail {
      detail_id: Some(envelope.detail_id),
      data,
      detail_uri: envelope.detail_uri,
      linked_detail_uris: envelope.linked_detail_uris,
      contexts: envelope.contexts,
      access_constraints: envelope.access_constraints,
      provenance: envelope.provenance,
      modifiable: envelope.modifiable,
      nonexportable: envelope.nonexportable,
      change_flags: if keep_change_flags {
        envelope.change_flags
      } else {
        ChangeFlags::empty()
      },
    });
  }

  // Splice in the overlay and synthesise marker details.
  for (id, contact) in contacts.iter_mut() {
    if let Some((overlay_modified, overlay_details)) = overlays.remove(id) {
      contact.modified = Some(overlay_modified);
      for detail in overlay_details {
        if hint.wants_kind(detail.kind()) {
          contact.details.push(detail);
        }
      }
    }
    if contact.status_flags.contains(StatusFlags::IS_DEACTIVATED)
      && hint.wants_kind(DetailKind::Deactivated)
    {
      contact.details.push(Detail::new(DetailData::Deactivated));
    }
  }

  // Relationships, streamed per contact id.
  if hint.include_relationships {
    let sql = format!(
      "SELECT firstId, secondId, type FROM Relationships
       WHERE firstId IN (SELECT contactId FROM {ids_table})
          OR secondId IN (SELECT contactId FROM {ids_table})
       ORDER BY firstId ASC, secondId ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, i64>(1)?,
          row.get::<_, Option<String>>(2)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    for (first_id, second_id, rel_type) in rows {
      let relationship = Relationship {
        first_id,
        second_id,
        rel_type: RelationshipType::from_str(rel_type.as_deref().unwrap_or("")),
      };
      for end in [first_id, second_id] {
        if let Some(contact) = contacts.get_mut(&end) {
          contact.relationships.push(relationship.clone());
        }
      }
    }
  }

  // Aggregate details are derived; clients may never edit them through the
  // aggregate.
  if !relax_constraints {
    for contact in contacts.values_mut() {
      if contact.collection_id == Some(AGGREGATE_COLLECTION_ID) {
        for detail in &mut contact.details {
          detail.access_constraints =
            AccessConstraints::READ_ONLY | AccessConstraints::IRREMOVABLE;
          detail.modifiable = false;
        }
      }
    }
  }

  drop_transient_id_tables(conn, "fetchIds")?;
  Ok(contacts)
}

// ─── Public read operations ──────────────────────────────────────────────────

/// Materialise contacts matching `filter`, streaming batches to `sink`.
pub(crate) fn read_contacts(
  conn: &Connection,
  ctx: &DbCtx,
  filter: &Filter,
  orders: &[SortOrder],
  hint: &FetchHint,
  batch_size: usize,
  sink: &mut dyn FnMut(Vec<Contact>),
) -> Result<()> {
  let mut ids = query_contact_ids(conn, ctx, filter, orders)?;
  if let Some(max) = hint.max_count {
    ids.truncate(max);
  }

  let batch = batch_size.max(1);
  for chunk in ids.chunks(batch) {
    let mut assembled = fetch_contacts(conn, ctx, chunk, hint, false, false)?;
    let batch_contacts: Vec<Contact> = chunk
      .iter()
      .filter_map(|id| assembled.remove(id))
      .collect();
    if !batch_contacts.is_empty() {
      sink(batch_contacts);
    }
  }
  Ok(())
}

/// Contacts by explicit id, in caller order. Missing ids yield empty
/// placeholder contacts and a `DoesNotExist` entry in the error map.
pub(crate) fn read_contacts_by_id(
  conn: &Connection,
  ctx: &DbCtx,
  ids: &[i64],
  hint: &FetchHint,
  relax_constraints: bool,
) -> Result<(Vec<Contact>, kindred_core::ErrorMap)> {
  let mut assembled =
    fetch_contacts(conn, ctx, ids, hint, false, relax_constraints)?;
  let mut results = Vec::with_capacity(ids.len());
  let mut errors = kindred_core::ErrorMap::new();

  for (index, id) in ids.iter().enumerate() {
    match assembled.remove(id) {
      Some(contact) if !contact.change_flags.is_deleted() => {
        results.push(contact);
      }
      _ => {
        errors.insert(index, kindred_core::Error::DoesNotExist);
        results.push(Contact::default());
      }
    }
  }
  Ok((results, errors))
}

/// Tombstoned contact ids. Only change-log-since, collection, and
/// sync-target filters are supported here.
pub(crate) fn read_deleted_contact_ids(
  conn: &Connection,
  filter: &Filter,
) -> Result<Vec<i64>> {
  struct Accepted {
    since:       Option<DateTime<Utc>>,
    collections: Option<Vec<i64>>,
    sync_target: Option<String>,
  }

  fn accept(filter: &Filter, out: &mut Accepted) -> Result<()> {
    match filter {
      Filter::Default => Ok(()),
      Filter::ChangeLog { since, event: ChangeLogEvent::Removed } => {
        out.since = Some(*since);
        Ok(())
      }
      Filter::Collections(ids) => {
        out.collections = Some(ids.clone());
        Ok(())
      }
      Filter::Detail(DetailFilter {
        field: Field::SyncTarget,
        value: Some(FilterValue::Text(target)),
        ..
      }) => {
        out.sync_target = Some(target.clone());
        Ok(())
      }
      Filter::Intersection(children) => {
        for child in children {
          accept(child, out)?;
        }
        Ok(())
      }
      _ => Err(unsupported()),
    }
  }

  let mut accepted =
    Accepted { since: None, collections: None, sync_target: None };
  accept(filter, &mut accepted)?;

  let mut ids: Vec<i64> = Vec::new();

  // Tombstoned rows still present in Contacts.
  {
    let mut sql = String::from(
      "SELECT DISTINCT Contacts.contactId FROM Contacts",
    );
    let mut clauses = vec!["Contacts.changeFlags >= 4".to_owned()];
    let mut bindings: Vec<Value> = Vec::new();
    if let Some(target) = &accepted.sync_target {
      sql.push_str(
        " INNER JOIN SyncTargets ON SyncTargets.contactId = Contacts.contactId",
      );
      clauses.push("SyncTargets.syncTarget = ?".to_owned());
      bindings.push(Value::Text(target.clone()));
    }
    if let Some(since) = accepted.since {
      clauses.push("COALESCE(Contacts.deleted, Contacts.modified) >= ?".to_owned());
      bindings.push(Value::Text(crate::encode::encode_dt(since)));
    }
    if let Some(collections) = &accepted.collections {
      let placeholders = vec!["?"; collections.len()].join(", ");
      clauses.push(format!("Contacts.collectionId IN ({placeholders})"));
      bindings.extend(collections.iter().map(|id| Value::Integer(*id)));
    }
    sql.push_str(" WHERE ");
    sql.push_str(&clauses.join(" AND "));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map(rusqlite::params_from_iter(bindings.iter()), |row| {
        row.get::<_, i64>(0)
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    ids.extend(rows);
  }

  // Physically removed rows recorded by the delete trigger. Sync-target
  // information does not survive physical removal.
  if accepted.sync_target.is_none() {
    let mut sql =
      String::from("SELECT contactId FROM DeletedContacts");
    let mut clauses: Vec<String> = Vec::new();
    let mut bindings: Vec<Value> = Vec::new();
    if let Some(since) = accepted.since {
      clauses.push("deleted >= ?".to_owned());
      bindings.push(Value::Text(crate::encode::encode_dt(since)));
    }
    if let Some(collections) = &accepted.collections {
      let placeholders = vec!["?"; collections.len()].join(", ");
      clauses.push(format!("collectionId IN ({placeholders})"));
      bindings.extend(collections.iter().map(|id| Value::Integer(*id)));
    }
    if !clauses.is_empty() {
      sql.push_str(" WHERE ");
      sql.push_str(&clauses.join(" AND "));
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map(rusqlite::params_from_iter(bindings.iter()), |row| {
        row.get::<_, i64>(0)
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    ids.extend(rows);
  }

  ids.sort_unstable();
  ids.dedup();
  Ok(ids)
}

/// Relationships matching any combination of type and participants,
/// excluding edges with a deleted participant.
pub(crate) fn read_relationships(
  conn: &Connection,
  rel_type: Option<&RelationshipType>,
  first_id: Option<i64>,
  second_id: Option<i64>,
) -> Result<Vec<Relationship>> {
  let mut sql = String::from(
    "SELECT Relationships.firstId, Relationships.secondId, Relationships.type
     FROM Relationships
     INNER JOIN Contacts AS First ON First.contactId = Relationships.firstId
     INNER JOIN Contacts AS Second ON Second.contactId = Relationships.secondId
     WHERE First.changeFlags < 4 AND Second.changeFlags < 4",
  );
  let mut bindings: Vec<Value> = Vec::new();
  if let Some(t) = rel_type {
    sql.push_str(" AND Relationships.type = ?");
    bindings.push(Value::Text(t.as_str().to_owned()));
  }
  if let Some(id) = first_id {
    sql.push_str(" AND Relationships.firstId = ?");
    bindings.push(Value::Integer(id));
  }
  if let Some(id) = second_id {
    sql.push_str(" AND Relationships.secondId = ?");
    bindings.push(Value::Integer(id));
  }
  sql.push_str(" ORDER BY Relationships.firstId ASC, Relationships.secondId ASC");

  let mut stmt = conn.prepare(&sql)?;
  let rows = stmt
    .query_map(rusqlite::params_from_iter(bindings.iter()), |row| {
      Ok((
        row.get::<_, i64>(0)?,
        row.get::<_, i64>(1)?,
        row.get::<_, Option<String>>(2)?,
      ))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  Ok(
    rows
      .into_iter()
      .map(|(first_id, second_id, rel_type)| Relationship {
        first_id,
        second_id,
        rel_type: RelationshipType::from_str(rel_type.as_deref().unwrap_or("")),
      })
      .collect(),
  )
}

/// Unique detail values of an append-unique kind. Fields not listed in
/// `fields` are nulled out; duplicates (after nulling) collapse.
pub(crate) fn read_details(
  conn: &Connection,
  ctx: &DbCtx,
  kind: DetailKind,
  fields: &[Field],
  filter: &Filter,
  orders: &[SortOrder],
  hint: &FetchHint,
) -> Result<Vec<Detail>> {
  if !kind.can_append_unique() {
    return Err(Error::Engine(kindred_core::Error::NotSupported));
  }

  let ids = query_contact_ids(conn, ctx, filter, orders)?;
  if ids.is_empty() {
    return Ok(Vec::new());
  }

  let detail_hint = FetchHint {
    detail_types: Some(vec![kind]),
    ..FetchHint::default()
  };
  let assembled = fetch_contacts(conn, ctx, &ids, &detail_hint, false, false)?;

  let mut seen: Vec<DetailData> = Vec::new();
  let mut results: Vec<Detail> = Vec::new();
  for id in &ids {
    let Some(contact) = assembled.get(id) else { continue };
    for detail in contact.details_of(kind) {
      let mut stripped = detail.clone();
      strip_unrequested_fields(&mut stripped.data, fields);
      if seen.contains(&stripped.data) {
        continue;
      }
      seen.push(stripped.data.clone());
      results.push(stripped);
      if let Some(max) = hint.max_count
        && results.len() >= max
      {
        return Ok(results);
      }
    }
  }
  Ok(results)
}

/// Null out any field the caller did not request. An empty field list
/// requests everything.
fn strip_unrequested_fields(data: &mut DetailData, fields: &[Field]) {
  if fields.is_empty() {
    return;
  }
  let keep = |field: Field| fields.contains(&field);
  match data {
    DetailData::PhoneNumber(p) => {
      if !keep(Field::PhoneNumber) {
        p.number.clear();
        p.normalized = None;
      }
      if !keep(Field::PhoneSubTypes) {
        p.sub_types.clear();
      }
    }
    DetailData::OnlineAccount(a) => {
      if !keep(Field::OnlineAccountUri) {
        a.account_uri.clear();
      }
      if !keep(Field::OnlineAccountProtocol) {
        a.protocol = None;
      }
      if !keep(Field::OnlineAccountServiceProvider) {
        a.service_provider = None;
      }
      if !keep(Field::OnlineAccountSubTypes) {
        a.sub_types.clear();
      }
    }
    DetailData::Organization(o) => {
      if !keep(Field::OrganizationName) {
        o.name = None;
      }
      if !keep(Field::OrganizationRole) {
        o.role = None;
      }
      if !keep(Field::OrganizationTitle) {
        o.title = None;
      }
      if !keep(Field::OrganizationLocation) {
        o.location = None;
      }
      if !keep(Field::OrganizationDepartment) {
        o.department = None;
      }
    }
    DetailData::Url(u) => {
      if !keep(Field::Url) {
        u.url.clear();
      }
      if !keep(Field::UrlSubType) {
        u.sub_type = None;
      }
    }
    // Single-field kinds: the field list either includes the value field or
    // the read is meaningless; nothing to strip.
    _ => {}
  }
}

// ─── Collections ─────────────────────────────────────────────────────────────

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<Collection> {
  Ok(Collection {
    id: Some(row.get(0)?),
    aggregable: row.get::<_, Option<bool>>(1)?.unwrap_or(true),
    name: row.get(2)?,
    description: row.get(3)?,
    color: row.get(4)?,
    secondary_color: row.get(5)?,
    image: row.get(6)?,
    application_name: row.get(7)?,
    account_id: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
    remote_path: row.get(9)?,
    change_flags: ChangeFlags::from_bits_truncate(
      row.get::<_, i64>(10)? as u32,
    ),
    record_unhandled_change_flags: row
      .get::<_, Option<bool>>(11)?
      .unwrap_or(false),
    metadata: BTreeMap::new(),
  })
}

const COLLECTION_COLUMNS: &str =
  "collectionId, aggregable, name, description, color, secondaryColor,
   image, applicationName, accountId, remotePath, changeFlags,
   recordUnhandledChangeFlags";

fn load_collection_metadata(
  conn: &Connection,
  collection: &mut Collection,
) -> Result<()> {
  let Some(id) = collection.id else { return Ok(()) };
  let mut stmt = conn.prepare(
    "SELECT key, value FROM CollectionsMetadata WHERE collectionId = ?1",
  )?;
  let rows = stmt
    .query_map([id], |row| {
      Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  for (key, value) in rows {
    let parsed = match value {
      Some(raw) => serde_json::from_str(&raw)
        .unwrap_or(serde_json::Value::String(raw)),
      None => serde_json::Value::Null,
    };
    collection.metadata.insert(key, parsed);
  }
  Ok(())
}

/// All collections, optionally restricted by account or application,
/// including tombstoned ones (callers partition by change flags).
pub(crate) fn read_collections(
  conn: &Connection,
  account_id: Option<i64>,
  application_name: Option<&str>,
) -> Result<Vec<Collection>> {
  let mut sql = format!("SELECT {COLLECTION_COLUMNS} FROM Collections");
  let mut clauses: Vec<&str> = Vec::new();
  let mut bindings: Vec<Value> = Vec::new();
  if let Some(account) = account_id {
    clauses.push("accountId = ?");
    bindings.push(Value::Integer(account));
  }
  if let Some(app) = application_name {
    clauses.push("applicationName = ?");
    bindings.push(Value::Text(app.to_owned()));
  }
  if !clauses.is_empty() {
    sql.push_str(" WHERE ");
    sql.push_str(&clauses.join(" AND "));
  }
  sql.push_str(" ORDER BY collectionId ASC");

  let mut stmt = conn.prepare(&sql)?;
  let mut collections = stmt
    .query_map(rusqlite::params_from_iter(bindings.iter()), |row| {
      collection_from_row(row)
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  for collection in &mut collections {
    load_collection_metadata(conn, collection)?;
  }
  Ok(collections)
}

/// Collections partitioned by change flags.
pub(crate) fn fetch_collection_changes(
  conn: &Connection,
  account_id: Option<i64>,
  application_name: Option<&str>,
) -> Result<CollectionChanges> {
  let mut changes = CollectionChanges::default();
  for collection in read_collections(conn, account_id, application_name)? {
    let flags = collection.change_flags;
    if flags.is_deleted() {
      changes.deleted.push(collection);
    } else if flags.contains(ChangeFlags::IS_ADDED) {
      changes.added.push(collection);
    } else if flags.contains(ChangeFlags::IS_MODIFIED) {
      changes.modified.push(collection);
    } else {
      changes.unmodified.push(collection);
    }
  }
  Ok(changes)
}

/// Contacts of one collection partitioned by change flags; always read with
/// `keepChangeFlags` so the adapter can observe and later clear them.
pub struct ContactChanges {
  pub added:      Vec<Contact>,
  pub modified:   Vec<Contact>,
  pub deleted:    Vec<Contact>,
  pub unmodified: Vec<Contact>,
}

pub(crate) fn fetch_contacts_in_collection(
  conn: &Connection,
  ctx: &DbCtx,
  collection_id: i64,
  hint: &FetchHint,
) -> Result<ContactChanges> {
  let ids: Vec<i64> = {
    let mut stmt = conn.prepare(
      "SELECT contactId FROM Contacts WHERE collectionId = ?1 ORDER BY contactId ASC",
    )?;
    stmt
      .query_map([collection_id], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };

  let mut assembled = fetch_contacts(conn, ctx, &ids, hint, true, true)?;
  let mut changes = ContactChanges {
    added:      Vec::new(),
    modified:   Vec::new(),
    deleted:    Vec::new(),
    unmodified: Vec::new(),
  };
  for id in ids {
    let Some(contact) = assembled.remove(&id) else { continue };
    let flags = contact.change_flags;
    if flags.is_deleted() {
      changes.deleted.push(contact);
    } else if flags.contains(ChangeFlags::IS_ADDED) {
      changes.added.push(contact);
    } else if flags.contains(ChangeFlags::IS_MODIFIED) {
      changes.modified.push(contact);
    } else {
      changes.unmodified.push(contact);
    }
  }
  Ok(changes)
}
