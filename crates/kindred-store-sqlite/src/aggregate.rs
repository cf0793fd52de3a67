//! The aggregation engine.
//!
//! Maintains, for every active non-aggregate contact in an aggregable
//! collection, exactly one aggregate parent in the aggregate collection,
//! reachable via an `Aggregates` relationship. Candidate aggregates are
//! scored in SQL against temp match-value tables; the best candidate at or
//! above [`MINIMUM_MATCH_SCORE`] wins, otherwise a new aggregate is created.

use chrono::Utc;
use kindred_core::{
  contact::{Contact, AGGREGATE_COLLECTION_ID},
  detail::{Detail, DetailData, DetailKind, Gender, NameData, Provenance},
  filter::FetchHint,
  flags::{AccessConstraints, ChangeFlags},
  phone::normalize_phone_number,
};
use rusqlite::Connection;

use crate::{
  db::{fill_temp_values_table, DbCtx},
  encode::{encode_opt_dt, fold_case},
  reader, writer, Error, Result,
};

pub(crate) const MINIMUM_MATCH_SCORE: i64 = 15;

fn engine(e: kindred_core::Error) -> Error { Error::Engine(e) }

// ─── Match keys ──────────────────────────────────────────────────────────────

struct MatchKeys {
  first_name:     Option<String>,
  last_name:      Option<String>,
  nickname:       Option<String>,
  exclude_gender: String,
  emails:         Vec<String>,
  phones:         Vec<String>,
  account_uris:   Vec<String>,
}

fn match_keys(contact: &Contact) -> MatchKeys {
  let mut keys = MatchKeys {
    first_name:     None,
    last_name:      None,
    nickname:       None,
    exclude_gender: "none".to_owned(),
    emails:         Vec::new(),
    phones:         Vec::new(),
    account_uris:   Vec::new(),
  };

  for detail in &contact.details {
    match &detail.data {
      DetailData::Name(name) => {
        keys.first_name = name.first.as_deref().map(fold_case);
        keys.last_name = name.last.as_deref().map(fold_case);
      }
      DetailData::Nickname(nickname) if keys.nickname.is_none() => {
        keys.nickname = Some(fold_case(nickname));
      }
      DetailData::Gender(gender) => {
        if let Some(opposite) = gender.opposite() {
          keys.exclude_gender = opposite.to_int().to_string();
        }
      }
      DetailData::EmailAddress(address) => {
        keys.emails.push(fold_case(address));
      }
      DetailData::PhoneNumber(phone) => {
        let normalized = normalize_phone_number(&phone.number);
        if !normalized.is_empty() {
          keys.phones.push(normalized);
        }
      }
      DetailData::OnlineAccount(account) => {
        keys.account_uris.push(fold_case(&account.account_uri));
      }
      _ => {}
    }
  }
  keys
}

// ─── Candidate scoring ───────────────────────────────────────────────────────

/// Candidate aggregates: active, not self, gender-compatible, surname
/// compatible, and not blocked from `contact_id` by an `IsNot` edge.
const POSSIBLE_AGGREGATES_SQL: &str = "
INSERT INTO temp.possibleAggregates
SELECT Contacts.contactId FROM Contacts
LEFT JOIN Names ON Names.contactId = Contacts.contactId
LEFT JOIN Genders ON Genders.contactId = Contacts.contactId
WHERE Contacts.collectionId = 1
  AND (COALESCE(Names.lowerLastName, '') = ''
       OR COALESCE(:lastName, '') = ''
       OR Names.lowerLastName = :lastName)
  AND COALESCE(Genders.gender, '') != :excludeGender
  AND Contacts.contactId > 2
  AND Contacts.isDeactivated = 0
  AND Contacts.changeFlags < 4
  AND Contacts.contactId NOT IN (
    SELECT secondId FROM Relationships WHERE firstId = :contactId AND type = 'IsNot'
    UNION
    SELECT firstId FROM Relationships WHERE secondId = :contactId AND type = 'IsNot')
ORDER BY Contacts.contactId ASC";

/// Heuristic match scores, summed per candidate:
/// 20 first+last equal, 15 nickname with names absent on both sides,
/// 12 one name part equal with the other missing, 3 per matching email /
/// normalised phone / account URI, 1 nickname fallback.
const HEURISTIC_MATCH_SQL: &str = "
SELECT Matches.contactId, sum(Matches.score) AS total FROM (
  SELECT Names.contactId, 20 AS score FROM Names
    INNER JOIN temp.possibleAggregates ON Names.contactId = temp.possibleAggregates.contactId
    WHERE COALESCE(Names.lowerLastName, '') != '' AND Names.lowerLastName = :lastName
      AND COALESCE(Names.lowerFirstName, '') != '' AND Names.lowerFirstName = :firstName
  UNION
  SELECT Contacts.contactId, 15 AS score FROM Contacts
    INNER JOIN temp.possibleAggregates ON Contacts.contactId = temp.possibleAggregates.contactId
    WHERE COALESCE(:firstName, '') = '' AND COALESCE(:lastName, '') = ''
      AND NOT EXISTS (
        SELECT 1 FROM Names WHERE Names.contactId = Contacts.contactId
          AND (COALESCE(Names.lowerFirstName, '') != ''
               OR COALESCE(Names.lowerLastName, '') != ''))
      AND EXISTS (
        SELECT 1 FROM Nicknames WHERE Nicknames.contactId = Contacts.contactId
          AND Nicknames.lowerNickname = :nickname)
  UNION
  SELECT Names.contactId, 12 AS score FROM Names
    INNER JOIN temp.possibleAggregates ON Names.contactId = temp.possibleAggregates.contactId
    WHERE (COALESCE(Names.lowerLastName, '') = '' OR COALESCE(:lastName, '') = '')
      AND COALESCE(Names.lowerFirstName, '') != '' AND Names.lowerFirstName = :firstName
  UNION
  SELECT Names.contactId, 12 AS score FROM Names
    INNER JOIN temp.possibleAggregates ON Names.contactId = temp.possibleAggregates.contactId
    WHERE COALESCE(Names.lowerLastName, '') != '' AND Names.lowerLastName = :lastName
      AND (COALESCE(Names.lowerFirstName, '') = '' OR COALESCE(:firstName, '') = '')
  UNION ALL
  SELECT EmailAddresses.contactId, 3 AS score FROM EmailAddresses
    INNER JOIN temp.possibleAggregates ON EmailAddresses.contactId = temp.possibleAggregates.contactId
    INNER JOIN temp.matchEmailAddresses ON EmailAddresses.lowerEmailAddress = temp.matchEmailAddresses.value
  UNION ALL
  SELECT PhoneNumbers.contactId, 3 AS score FROM PhoneNumbers
    INNER JOIN temp.possibleAggregates ON PhoneNumbers.contactId = temp.possibleAggregates.contactId
    INNER JOIN temp.matchPhoneNumbers ON PhoneNumbers.normalizedNumber = temp.matchPhoneNumbers.value
  UNION ALL
  SELECT OnlineAccounts.contactId, 3 AS score FROM OnlineAccounts
    INNER JOIN temp.possibleAggregates ON OnlineAccounts.contactId = temp.possibleAggregates.contactId
    INNER JOIN temp.matchOnlineAccounts ON OnlineAccounts.lowerAccountUri = temp.matchOnlineAccounts.value
  UNION
  SELECT Nicknames.contactId, 1 AS score FROM Nicknames
    INNER JOIN temp.possibleAggregates ON Nicknames.contactId = temp.possibleAggregates.contactId
    WHERE COALESCE(Nicknames.lowerNickname, '') != '' AND Nicknames.lowerNickname = :nickname
) AS Matches
GROUP BY Matches.contactId
ORDER BY total DESC, Matches.contactId ASC
LIMIT 1";

/// Find the best matching aggregate for `contact`, if any reaches the
/// threshold. The match temp tables are rebuilt at entry, which also
/// disposes of state left by a failed previous invocation.
fn find_matching_aggregate(
  conn: &Connection,
  contact: &Contact,
) -> Result<Option<i64>> {
  let keys = match_keys(contact);

  conn.execute_batch(
    "CREATE TABLE IF NOT EXISTS temp.possibleAggregates (contactId INTEGER);
     DELETE FROM temp.possibleAggregates;",
  )?;
  conn.execute(
    POSSIBLE_AGGREGATES_SQL,
    rusqlite::named_params! {
      ":lastName": keys.last_name,
      ":excludeGender": keys.exclude_gender,
      ":contactId": contact.id,
    },
  )?;

  fill_temp_values_table(conn, "matchEmailAddresses", &keys.emails)?;
  fill_temp_values_table(conn, "matchPhoneNumbers", &keys.phones)?;
  fill_temp_values_table(conn, "matchOnlineAccounts", &keys.account_uris)?;

  let row: Option<(i64, i64)> = {
    use rusqlite::OptionalExtension as _;
    conn
      .query_row(
        HEURISTIC_MATCH_SQL,
        rusqlite::named_params! {
          ":firstName": keys.first_name,
          ":lastName": keys.last_name,
          ":nickname": keys.nickname,
        },
        |r| Ok((r.get(0)?, r.get(1)?)),
      )
      .optional()?
  };

  Ok(match row {
    Some((aggregate_id, score)) if score >= MINIMUM_MATCH_SCORE => {
      Some(aggregate_id)
    }
    _ => None,
  })
}

// ─── Promotion ───────────────────────────────────────────────────────────────

fn first_non_empty(target: &mut Option<String>, candidate: &Option<String>) {
  if target.as_deref().is_none_or(str::is_empty)
    && candidate.as_deref().is_some_and(|s| !s.is_empty())
  {
    *target = candidate.clone();
  }
}

fn promoted(detail: &Detail) -> Detail {
  let mut out = detail.clone();
  out.detail_id = None;
  out.access_constraints =
    AccessConstraints::READ_ONLY | AccessConstraints::IRREMOVABLE;
  out.modifiable = false;
  out.change_flags = ChangeFlags::empty();
  out.apply_aggregate_uri_prefix();
  out
}

/// Derive the aggregate's detail list from its constituents.
///
/// `previous` supplies the identity details carried forward verbatim
/// (sync target, GUID) and any kinds outside a non-empty `mask`.
/// `constituents` must be ordered Local first, then ascending id.
pub(crate) fn promote_details(
  previous: &[Detail],
  constituents: &[&Contact],
  mask: &[DetailKind],
) -> Vec<Detail> {
  let rederived = |kind: DetailKind| mask.is_empty() || mask.contains(&kind);
  let mut out: Vec<Detail> = Vec::new();

  for detail in previous {
    let kind = detail.kind();
    if kind.identifies_aggregate()
      || (!kind.excluded_from_promotion() && !rederived(kind))
    {
      out.push(detail.clone());
    }
  }

  // Composed kinds: field-wise combination across constituents.
  if rederived(DetailKind::Name) {
    let mut name = NameData::default();
    let mut provenance: Option<Provenance> = None;
    for constituent in constituents {
      for detail in constituent.details_of(DetailKind::Name) {
        let DetailData::Name(n) = &detail.data else { continue };
        first_non_empty(&mut name.prefix, &n.prefix);
        first_non_empty(&mut name.first, &n.first);
        first_non_empty(&mut name.middle, &n.middle);
        first_non_empty(&mut name.last, &n.last);
        first_non_empty(&mut name.suffix, &n.suffix);
        first_non_empty(&mut name.custom_label, &n.custom_label);
        if provenance.is_none() {
          provenance = detail.provenance;
        }
      }
    }
    if name != NameData::default() {
      let mut detail = promoted(&Detail::new(DetailData::Name(name)));
      detail.provenance = provenance;
      out.push(detail);
    }
  }

  if rederived(DetailKind::Gender) {
    if let Some(detail) = constituents.iter().find_map(|c| {
      c.details_of(DetailKind::Gender).find(|d| {
        matches!(&d.data, DetailData::Gender(g) if *g != Gender::Unspecified)
      })
    }) {
      out.push(promoted(detail));
    }
  }

  if rederived(DetailKind::Favorite) {
    let any_favorite = constituents.iter().any(|c| {
      c.details_of(DetailKind::Favorite)
        .any(|d| matches!(d.data, DetailData::Favorite(true)))
    });
    let source = constituents
      .iter()
      .find_map(|c| c.details_of(DetailKind::Favorite).next());
    if let Some(detail) = source {
      let mut favorite = promoted(detail);
      favorite.data = DetailData::Favorite(any_favorite);
      out.push(favorite);
    }
  }

  if rederived(DetailKind::Birthday) {
    if let Some(detail) = constituents.iter().find_map(|c| {
      c.details_of(DetailKind::Birthday).find(|d| {
        matches!(&d.data, DetailData::Birthday(b) if b.date.is_some())
      })
    }) {
      out.push(promoted(detail));
    }
  }

  // Everything else is duplicated, value-equivalent details collapsing.
  for constituent in constituents {
    for detail in &constituent.details {
      let kind = detail.kind();
      if kind.is_composed()
        || kind.excluded_from_promotion()
        || kind.identifies_aggregate()
        || !rederived(kind)
        || detail.change_flags.is_deleted()
      {
        continue;
      }
      if out
        .iter()
        .any(|existing| existing.kind() == kind && existing.value_equivalent(detail))
      {
        continue;
      }
      out.push(promoted(detail));
    }
  }

  out
}

// ─── Constituent access ──────────────────────────────────────────────────────

/// Active constituents of `aggregate_id`, Local collection first, then
/// ascending id.
fn active_constituents(
  conn: &Connection,
  ctx: &DbCtx,
  aggregate_id: i64,
) -> Result<Vec<Contact>> {
  let ids: Vec<i64> = {
    let mut stmt = conn.prepare(
      "SELECT C.contactId FROM Relationships R
       INNER JOIN Contacts C ON C.contactId = R.secondId
       WHERE R.firstId = ?1 AND R.type = 'Aggregates'
         AND C.changeFlags < 4 AND C.isDeactivated = 0
       ORDER BY (C.collectionId != 2) ASC, C.contactId ASC",
    )?;
    stmt
      .query_map([aggregate_id], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };
  let mut assembled =
    reader::fetch_contacts(conn, ctx, &ids, &FetchHint::default(), false, true)?;
  Ok(ids.into_iter().filter_map(|id| assembled.remove(&id)).collect())
}

// ─── Regeneration ────────────────────────────────────────────────────────────

/// Rebuild an aggregate's details from its active constituents. If no
/// active constituents remain, the aggregate is left for the childless
/// cleanup at the end of the transaction.
pub(crate) fn regenerate_aggregate(
  conn: &Connection,
  ctx: &DbCtx,
  aggregate_id: i64,
  mask: &[DetailKind],
) -> Result<()> {
  let mut assembled = reader::fetch_contacts(
    conn,
    ctx,
    &[aggregate_id],
    &FetchHint::default(),
    false,
    true,
  )?;
  let Some(mut aggregate) = assembled.remove(&aggregate_id) else {
    return Err(engine(kindred_core::Error::DoesNotExist));
  };

  let constituents = active_constituents(conn, ctx, aggregate_id)?;
  if constituents.is_empty() {
    return Ok(());
  }
  let refs: Vec<&Contact> = constituents.iter().collect();

  aggregate.details = promote_details(&aggregate.details, &refs, mask);

  // Presence and the display label are synthesised on the aggregate itself
  // (from the promoted per-account presences).
  writer::synthesize_global_presence(&mut aggregate);
  writer::recompute_display_label(ctx, &mut aggregate);

  // Timestamps compose as min(created) / max(modified) over constituents.
  aggregate.created = refs.iter().filter_map(|c| c.created).min();
  aggregate.modified =
    refs.iter().filter_map(|c| c.modified).max().or(Some(Utc::now()));

  conn.execute(
    "UPDATE Contacts SET created = ?2, modified = ?3,
       changeFlags = changeFlags | 2
     WHERE contactId = ?1",
    rusqlite::params![
      aggregate_id,
      encode_opt_dt(aggregate.created),
      encode_opt_dt(aggregate.modified),
    ],
  )?;
  writer::write_details(
    conn,
    &mut aggregate,
    &DetailKind::ALL,
    ChangeFlags::IS_MODIFIED,
  )?;
  writer::update_rollups(conn, aggregate_id)?;
  ctx.notifier.note_contact_changed(aggregate_id);
  Ok(())
}

/// Create a fresh aggregate for `constituent` and link it.
fn create_aggregate_for(
  conn: &Connection,
  ctx: &DbCtx,
  constituent: &Contact,
) -> Result<i64> {
  let constituent_id =
    constituent.id.ok_or_else(|| engine(kindred_core::Error::Unspecified))?;

  let mut aggregate = Contact::new(AGGREGATE_COLLECTION_ID);
  aggregate.created = constituent.created;
  aggregate.modified = constituent.modified;

  conn.execute(
    "INSERT INTO Contacts (collectionId, created, modified, changeFlags, type)
     VALUES (?1, ?2, ?3, ?4, 0)",
    rusqlite::params![
      AGGREGATE_COLLECTION_ID,
      encode_opt_dt(aggregate.created),
      encode_opt_dt(aggregate.modified),
      ChangeFlags::IS_ADDED.bits() as i64,
    ],
  )?;
  let aggregate_id = conn.last_insert_rowid();
  aggregate.id = Some(aggregate_id);

  conn.execute(
    "INSERT OR IGNORE INTO Relationships (firstId, secondId, type)
     VALUES (?1, ?2, 'Aggregates')",
    [aggregate_id, constituent_id],
  )?;

  regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
  ctx.notifier.note_contact_added(aggregate_id);
  Ok(aggregate_id)
}

// ─── Upsert ──────────────────────────────────────────────────────────────────

/// Attach a new or updated constituent to its aggregate: the best-scoring
/// candidate at or above the threshold, or a fresh aggregate. The chosen
/// aggregate is fully regenerated, since precedence may have shifted.
pub(crate) fn upsert_aggregate(
  conn: &Connection,
  ctx: &DbCtx,
  constituent_id: i64,
) -> Result<i64> {
  let mut assembled = reader::fetch_contacts(
    conn,
    ctx,
    &[constituent_id],
    &FetchHint::default(),
    false,
    true,
  )?;
  let Some(constituent) = assembled.remove(&constituent_id) else {
    return Err(engine(kindred_core::Error::DoesNotExist));
  };
  if constituent.collection_id == Some(AGGREGATE_COLLECTION_ID) {
    return Err(engine(kindred_core::Error::BadArgument));
  }

  // An existing parent wins outright; updates regenerate it.
  let existing_parent: Option<i64> = {
    use rusqlite::OptionalExtension as _;
    conn
      .query_row(
        "SELECT R.firstId FROM Relationships R
         INNER JOIN Contacts A ON A.contactId = R.firstId
         WHERE R.secondId = ?1 AND R.type = 'Aggregates' AND A.changeFlags < 4",
        [constituent_id],
        |row| row.get(0),
      )
      .optional()?
  };
  if let Some(aggregate_id) = existing_parent {
    regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
    return Ok(aggregate_id);
  }

  match find_matching_aggregate(conn, &constituent)? {
    Some(aggregate_id) => {
      conn.execute(
        "INSERT OR IGNORE INTO Relationships (firstId, secondId, type)
         VALUES (?1, ?2, 'Aggregates')",
        [aggregate_id, constituent_id],
      )?;
      regenerate_aggregate(conn, ctx, aggregate_id, &[])?;
      Ok(aggregate_id)
    }
    None => create_aggregate_for(conn, ctx, &constituent),
  }
}

// ─── Cleanup ─────────────────────────────────────────────────────────────────

/// Tombstone aggregates left with no active constituents. Returns the ids
/// removed.
pub(crate) fn remove_childless_aggregates(
  conn: &Connection,
  ctx: &DbCtx,
) -> Result<Vec<i64>> {
  let ids: Vec<i64> = {
    let mut stmt = conn.prepare(
      "SELECT Contacts.contactId FROM Contacts
       WHERE Contacts.collectionId = 1 AND Contacts.contactId > 2
         AND Contacts.changeFlags < 4
         AND NOT EXISTS (
           SELECT 1 FROM Relationships R
           INNER JOIN Contacts C ON C.contactId = R.secondId
           WHERE R.firstId = Contacts.contactId AND R.type = 'Aggregates'
             AND C.changeFlags < 4 AND C.isDeactivated = 0)",
    )?;
    stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?
  };

  let now = encode_opt_dt(Some(Utc::now()));
  for id in &ids {
    conn.execute(
      "UPDATE Contacts SET changeFlags = changeFlags | 4, deleted = ?2, modified = ?2
       WHERE contactId = ?1",
      rusqlite::params![id, now],
    )?;
    conn.execute(
      "UPDATE Details SET changeFlags = changeFlags | 4 WHERE contactId = ?1",
      [id],
    )?;
    ctx.transient.remove(*id)?;
    ctx.notifier.note_contact_removed(*id);
  }
  Ok(ids)
}

/// Re-aggregate active constituents that lost their aggregate parent
/// (e.g. after reactivation or relationship removal).
pub(crate) fn aggregate_orphans(conn: &Connection, ctx: &DbCtx) -> Result<()> {
  let ids: Vec<i64> = {
    let mut stmt = conn.prepare(
      "SELECT Contacts.contactId FROM Contacts
       INNER JOIN Collections ON Collections.collectionId = Contacts.collectionId
       WHERE Contacts.collectionId != 1 AND Collections.aggregable = 1
         AND Contacts.contactId > 2
         AND Contacts.changeFlags < 4 AND Contacts.isDeactivated = 0
         AND NOT EXISTS (
           SELECT 1 FROM Relationships R
           INNER JOIN Contacts A ON A.contactId = R.firstId
           WHERE R.secondId = Contacts.contactId AND R.type = 'Aggregates'
             AND A.changeFlags < 4)
       ORDER BY Contacts.contactId ASC",
    )?;
    stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?
  };
  for id in ids {
    upsert_aggregate(conn, ctx, id)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use kindred_core::{contact::LOCAL_COLLECTION_ID, detail::BirthdayData};

  use super::*;

  fn constituent(id: i64, collection: i64, details: Vec<DetailData>) -> Contact {
    let mut contact = Contact::new(collection);
    contact.id = Some(id);
    for (index, data) in details.into_iter().enumerate() {
      let detail = contact.push_detail(data);
      detail.provenance = Some(Provenance {
        collection_id: collection,
        contact_id:    id,
        detail_id:     (id * 100) + index as i64,
      });
    }
    contact
  }

  #[test]
  fn name_composes_field_wise() {
    let a = constituent(10, LOCAL_COLLECTION_ID, vec![DetailData::Name(
      NameData { first: Some("John".into()), ..Default::default() },
    )]);
    let b = constituent(11, 7, vec![DetailData::Name(NameData {
      first: Some("Jonathan".into()),
      last: Some("Smith".into()),
      ..Default::default()
    })]);

    let details = promote_details(&[], &[&a, &b], &[]);
    let name = details
      .iter()
      .find_map(|d| match &d.data {
        DetailData::Name(n) => Some(n.clone()),
        _ => None,
      })
      .unwrap();
    // Local constituent takes precedence for the first name; the missing
    // last name fills from the other constituent.
    assert_eq!(name.first.as_deref(), Some("John"));
    assert_eq!(name.last.as_deref(), Some("Smith"));
  }

  #[test]
  fn duplicated_details_collapse_by_value() {
    let a = constituent(10, LOCAL_COLLECTION_ID, vec![
      DetailData::EmailAddress("j@x".into()),
    ]);
    let b = constituent(11, 7, vec![
      DetailData::EmailAddress("j@x".into()),
      DetailData::EmailAddress("work@x".into()),
    ]);

    let details = promote_details(&[], &[&a, &b], &[]);
    let emails: Vec<_> = details
      .iter()
      .filter(|d| d.kind() == DetailKind::EmailAddress)
      .collect();
    assert_eq!(emails.len(), 2);
    assert!(emails.iter().all(|d| {
      d.access_constraints
        == (AccessConstraints::READ_ONLY | AccessConstraints::IRREMOVABLE)
    }));
  }

  #[test]
  fn favorite_composes_as_any() {
    let a = constituent(10, LOCAL_COLLECTION_ID, vec![DetailData::Favorite(false)]);
    let b = constituent(11, 7, vec![DetailData::Favorite(true)]);
    let details = promote_details(&[], &[&a, &b], &[]);
    assert!(details.iter().any(|d| matches!(d.data, DetailData::Favorite(true))));
  }

  #[test]
  fn identity_details_carry_forward() {
    let mut previous = Detail::new(DetailData::Guid("agg-guid".into()));
    previous.detail_uri = Some("aggregate:guid".into());
    let a = constituent(10, LOCAL_COLLECTION_ID, vec![
      DetailData::Guid("constituent-guid".into()),
    ]);

    let details = promote_details(&[previous], &[&a], &[]);
    let guids: Vec<_> = details
      .iter()
      .filter_map(|d| match &d.data {
        DetailData::Guid(g) => Some(g.as_str()),
        _ => None,
      })
      .collect();
    assert_eq!(guids, vec!["agg-guid"]);
  }

  #[test]
  fn mask_preserves_unmasked_kinds_from_previous() {
    let mut previous_note = Detail::new(DetailData::Note("old note".into()));
    previous_note.access_constraints =
      AccessConstraints::READ_ONLY | AccessConstraints::IRREMOVABLE;
    let a = constituent(10, LOCAL_COLLECTION_ID, vec![
      DetailData::Note("new note".into()),
      DetailData::Birthday(BirthdayData::default()),
    ]);

    // Only birthdays are re-derived; the note survives from the previous
    // aggregate state.
    let details =
      promote_details(&[previous_note], &[&a], &[DetailKind::Birthday]);
    let notes: Vec<_> = details
      .iter()
      .filter_map(|d| match &d.data {
        DetailData::Note(n) => Some(n.as_str()),
        _ => None,
      })
      .collect();
    assert_eq!(notes, vec!["old note"]);
  }

  #[test]
  fn promoted_uris_gain_prefix() {
    let mut contact = constituent(10, 7, vec![]);
    let detail = contact.push_detail(DetailData::EmailAddress("j@x".into()));
    detail.detail_uri = Some("uri-7".into());

    let details = promote_details(&[], &[&contact], &[]);
    assert_eq!(details[0].detail_uri.as_deref(), Some("aggregate:uri-7"));
  }
}
