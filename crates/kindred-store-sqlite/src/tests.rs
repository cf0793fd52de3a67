//! Integration tests for the engine against temp-dir stores.

use std::collections::BTreeMap;

use kindred_core::{
  collection::{Collection, IdentitySlot},
  contact::{Contact, AGGREGATE_COLLECTION_ID, LOCAL_COLLECTION_ID},
  detail::{
    DetailData, DetailKind, NameData, PhoneNumberData, PresenceData,
    PresenceState,
  },
  filter::{DetailFilter, Field, FetchHint, Filter, FilterValue, MatchFlags},
  flags::{AccessConstraints, StatusFlags},
  relationship::{Relationship, RelationshipType},
};
use tempfile::TempDir;

use crate::{
  notify::ChangeNotification, oob::OobValue, ConflictPolicy, ContactsStore,
  StoreConfig,
};

async fn store() -> (ContactsStore, TempDir) {
  let dir = TempDir::new().expect("temp dir");
  let mut config = StoreConfig::new(dir.path());
  config.test_mode = true;
  let store = ContactsStore::open(config).await.expect("open store");
  (store, dir)
}

fn person(first: &str, last: &str) -> Contact {
  let mut contact = Contact::new(LOCAL_COLLECTION_ID);
  contact.push_detail(DetailData::Name(NameData {
    first: Some(first.into()),
    last: Some(last.into()),
    ..Default::default()
  }));
  contact
}

async fn save_one(
  store: &ContactsStore,
  contact: Contact,
) -> Contact {
  let (result, errors) = store.save_contacts(vec![contact], vec![]).await;
  assert!(errors.is_empty(), "save errors: {errors:?}");
  result.expect("save").remove(0)
}

async fn make_sync_collection(store: &ContactsStore, name: &str) -> i64 {
  let mut collection = Collection::named(name);
  collection.account_id = 11;
  collection.remote_path = Some(format!("/remote/{name}"));
  let (result, errors) = store.save_collections(vec![collection]).await;
  assert!(errors.is_empty());
  result.expect("save collection")[0].id.expect("collection id")
}

/// The aggregate parent of a constituent, via the Aggregates edge.
async fn aggregate_of(store: &ContactsStore, constituent_id: i64) -> i64 {
  let edges = store
    .read_relationships(
      Some(RelationshipType::Aggregates),
      None,
      Some(constituent_id),
    )
    .await
    .expect("read relationships");
  assert_eq!(edges.len(), 1, "expected one aggregate parent");
  edges[0].first_id
}

// ─── Initialisation ──────────────────────────────────────────────────────────

#[tokio::test]
async fn open_seeds_reserved_rows() {
  let (store, _dir) = store().await;
  assert!(store.is_aggregating());

  let collections = store.read_collections().await.unwrap();
  let ids: Vec<i64> = collections.iter().filter_map(|c| c.id).collect();
  assert!(ids.contains(&AGGREGATE_COLLECTION_ID));
  assert!(ids.contains(&LOCAL_COLLECTION_ID));
  let aggregate = collections
    .iter()
    .find(|c| c.id == Some(AGGREGATE_COLLECTION_ID))
    .unwrap();
  assert!(!aggregate.aggregable);

  // Self contacts plus the self-aggregates-self edge.
  let edges = store
    .read_relationships(Some(RelationshipType::Aggregates), Some(2), Some(1))
    .await
    .unwrap();
  assert_eq!(edges.len(), 1);

  assert_eq!(
    store.identity(IdentitySlot::SelfContactId).await.unwrap(),
    Some(2)
  );
}

#[tokio::test]
async fn self_identity_is_read_only() {
  let (store, _dir) = store().await;
  let err = store
    .set_identity(IdentitySlot::SelfContactId, 42)
    .await
    .unwrap_err();
  assert_eq!(err, kindred_core::Error::BadArgument);
}

// ─── Save and read round trip ────────────────────────────────────────────────

#[tokio::test]
async fn save_and_read_round_trip() {
  let (store, _dir) = store().await;

  let mut contact = person("Alice", "Liddell");
  contact.push_detail(DetailData::EmailAddress("alice@example.com".into()));
  contact.push_detail(DetailData::PhoneNumber(PhoneNumberData {
    number: "+1 (555) 010-0199".into(),
    ..Default::default()
  }));
  let saved = save_one(&store, contact).await;
  let id = saved.id.unwrap();

  let (read, errors) = store
    .read_contacts_by_id(vec![id], FetchHint::default(), false)
    .await
    .unwrap();
  assert!(errors.is_empty());
  let read = &read[0];

  assert_eq!(read.id, Some(id));
  assert_eq!(read.collection_id, Some(LOCAL_COLLECTION_ID));
  assert!(read.created.is_some());
  assert!(read.modified.is_some());

  let name = read.single_detail(DetailKind::Name).unwrap();
  assert!(matches!(
    &name.data,
    DetailData::Name(n) if n.first.as_deref() == Some("Alice")
  ));

  // Engine-injected fields: a GUID, a display label with a group, rollup
  // flags, provenance on every durable detail.
  assert!(read.single_detail(DetailKind::Guid).is_some());
  let label = read.single_detail(DetailKind::DisplayLabel).unwrap();
  assert!(matches!(
    &label.data,
    DetailData::DisplayLabel(l) if l.label == "Alice Liddell"
      && l.group.as_deref() == Some("A")
  ));
  assert!(read.status_flags.contains(StatusFlags::HAS_PHONE_NUMBER));
  assert!(read.status_flags.contains(StatusFlags::HAS_EMAIL_ADDRESS));
  let phone = read.single_detail(DetailKind::PhoneNumber).unwrap();
  assert!(matches!(
    &phone.data,
    DetailData::PhoneNumber(p)
      if p.normalized.as_deref() == Some("+15550100199")
  ));
  assert!(phone.provenance.is_some());
}

#[tokio::test]
async fn read_missing_id_reports_does_not_exist() {
  let (store, _dir) = store().await;
  let (contacts, errors) = store
    .read_contacts_by_id(vec![9999], FetchHint::default(), false)
    .await
    .unwrap();
  assert_eq!(contacts.len(), 1);
  assert!(contacts[0].id.is_none());
  assert_eq!(errors.get(&0), Some(&kindred_core::Error::DoesNotExist));
}

#[tokio::test]
async fn saving_into_aggregate_collection_is_rejected() {
  let (store, _dir) = store().await;
  let mut contact = person("No", "Body");
  contact.collection_id = Some(AGGREGATE_COLLECTION_ID);
  let (result, _errors) = store.save_contacts(vec![contact], vec![]).await;
  assert_eq!(result.unwrap_err(), kindred_core::Error::BadArgument);
}

#[tokio::test]
async fn contacts_cannot_move_between_collections() {
  let (store, _dir) = store().await;
  let saved = save_one(&store, person("Stay", "Put")).await;
  let collection = make_sync_collection(&store, "elsewhere").await;

  let mut moved = saved;
  moved.collection_id = Some(collection);
  let (result, _errors) = store.save_contacts(vec![moved], vec![]).await;
  assert_eq!(result.unwrap_err(), kindred_core::Error::Unspecified);
}

// ─── Aggregation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn matching_contacts_aggregate_together() {
  let (store, _dir) = store().await;
  let sync_collection = make_sync_collection(&store, "carddav").await;

  let local = save_one(&store, person("John", "Smith")).await;
  let local_id = local.id.unwrap();

  let mut remote = person("John", "Smith");
  remote.collection_id = Some(sync_collection);
  let email = remote.push_detail(DetailData::EmailAddress("j@x".into()));
  email.detail_uri = Some("email-1".into());
  let remote = save_one(&store, remote).await;
  let remote_id = remote.id.unwrap();

  let aggregate_id = aggregate_of(&store, local_id).await;
  assert_eq!(aggregate_id, aggregate_of(&store, remote_id).await);

  // The default read surfaces aggregates only.
  let aggregates = store
    .read_contacts(Filter::Default, vec![], FetchHint::default())
    .await
    .unwrap();
  assert_eq!(aggregates.len(), 1);
  let aggregate = &aggregates[0];
  assert_eq!(aggregate.id, Some(aggregate_id));
  assert_eq!(aggregate.collection_id, Some(AGGREGATE_COLLECTION_ID));

  let name = aggregate.single_detail(DetailKind::Name).unwrap();
  assert!(matches!(
    &name.data,
    DetailData::Name(n) if n.first.as_deref() == Some("John")
      && n.last.as_deref() == Some("Smith")
  ));

  let email = aggregate
    .details_of(DetailKind::EmailAddress)
    .next()
    .expect("promoted email");
  assert!(matches!(
    &email.data,
    DetailData::EmailAddress(a) if a == "j@x"
  ));
  assert!(email.detail_uri.as_deref().unwrap().starts_with("aggregate:"));

  // Every aggregate detail is read-only and irremovable.
  for detail in &aggregate.details {
    assert_eq!(
      detail.access_constraints,
      AccessConstraints::READ_ONLY | AccessConstraints::IRREMOVABLE,
      "{:?}",
      detail.kind()
    );
    assert!(!detail.modifiable);
  }
}

#[tokio::test]
async fn non_matching_contacts_get_separate_aggregates() {
  let (store, _dir) = store().await;
  let a = save_one(&store, person("John", "Smith")).await;
  let b = save_one(&store, person("Jane", "Doe")).await;

  assert_ne!(
    aggregate_of(&store, a.id.unwrap()).await,
    aggregate_of(&store, b.id.unwrap()).await
  );
}

#[tokio::test]
async fn third_match_joins_existing_aggregate() {
  let (store, _dir) = store().await;
  let sync_collection = make_sync_collection(&store, "sync").await;

  let c10 = save_one(&store, person("John", "Smith")).await;
  let mut remote = person("John", "Smith");
  remote.collection_id = Some(sync_collection);
  remote.push_detail(DetailData::EmailAddress("j@x".into()));
  let c11 = save_one(&store, remote).await;

  let aggregate_id = aggregate_of(&store, c10.id.unwrap()).await;

  // An IsNot edge between the two constituents does not block a third
  // matching contact from joining their aggregate.
  let (result, errors) = store
    .save_relationships(vec![Relationship::is_not(
      c10.id.unwrap(),
      c11.id.unwrap(),
    )])
    .await;
  result.unwrap();
  assert!(errors.is_empty());

  let mut third = person("John", "Smith");
  third.push_detail(DetailData::PhoneNumber(PhoneNumberData {
    number: "+1-555-0100".into(),
    ..Default::default()
  }));
  let c12 = save_one(&store, third).await;

  assert_eq!(aggregate_of(&store, c12.id.unwrap()).await, aggregate_id);
}

#[tokio::test]
async fn is_not_blocks_re_aggregation_of_orphans() {
  let (store, _dir) = store().await;
  let sync_collection = make_sync_collection(&store, "sync").await;

  let local = save_one(&store, person("Ann", "Lee")).await;
  let mut remote = person("Ann", "Lee");
  remote.collection_id = Some(sync_collection);
  let remote = save_one(&store, remote).await;

  let aggregate_id = aggregate_of(&store, local.id.unwrap()).await;
  assert_eq!(aggregate_id, aggregate_of(&store, remote.id.unwrap()).await);

  // Block the pairing, then detach the remote constituent. The orphan
  // cleanup must aggregate it into a fresh aggregate, not back into the
  // blocked one.
  let (result, _) = store
    .save_relationships(vec![Relationship::is_not(
      remote.id.unwrap(),
      aggregate_id,
    )])
    .await;
  result.unwrap();
  let (result, _) = store
    .remove_relationships(vec![Relationship::aggregates(
      aggregate_id,
      remote.id.unwrap(),
    )])
    .await;
  result.unwrap();

  let new_aggregate = aggregate_of(&store, remote.id.unwrap()).await;
  assert_ne!(new_aggregate, aggregate_id);
  // The original aggregate still holds the local constituent.
  assert_eq!(aggregate_of(&store, local.id.unwrap()).await, aggregate_id);
}

#[tokio::test]
async fn removing_last_constituent_removes_aggregate() {
  let (store, _dir) = store().await;
  let sync_collection = make_sync_collection(&store, "sync").await;

  let mut remote = person("Only", "Child");
  remote.collection_id = Some(sync_collection);
  let remote = save_one(&store, remote).await;
  let constituent_id = remote.id.unwrap();
  let aggregate_id = aggregate_of(&store, constituent_id).await;

  let mut rx = store.subscribe();
  let (result, errors) = store.remove_contacts(vec![constituent_id]).await;
  result.unwrap();
  assert!(errors.is_empty());

  // Both the constituent and the childless aggregate are reported removed.
  let mut removed: Vec<i64> = Vec::new();
  while let Ok(notification) = rx.try_recv() {
    if let ChangeNotification::ContactsRemoved(ids) = notification {
      removed.extend(ids);
    }
  }
  assert!(removed.contains(&constituent_id));
  assert!(removed.contains(&aggregate_id));

  let remaining = store
    .read_contacts(Filter::Default, vec![], FetchHint::default())
    .await
    .unwrap();
  assert!(remaining.iter().all(|c| c.id != Some(aggregate_id)));
}

// ─── Tombstones & status-flag filters ────────────────────────────────────────

#[tokio::test]
async fn deleted_filter_flips_tombstone_visibility() {
  let (store, _dir) = store().await;
  let saved = save_one(&store, person("Gone", "Soon")).await;
  let constituent_id = saved.id.unwrap();
  let aggregate_id = aggregate_of(&store, constituent_id).await;

  let (result, _) = store.remove_contacts(vec![constituent_id]).await;
  result.unwrap();

  // Default visibility excludes tombstones entirely.
  let visible = store
    .read_contact_ids(Filter::Ids(vec![constituent_id, aggregate_id]), vec![])
    .await
    .unwrap();
  assert!(visible.is_empty());

  // A status-flag filter for IsDeleted flips the view to tombstones only.
  let deleted_filter = Filter::Intersection(vec![
    Filter::Ids(vec![constituent_id, aggregate_id]),
    Filter::Detail(DetailFilter {
      field:       Field::StatusFlags,
      value:       Some(FilterValue::Integer(
        StatusFlags::IS_DELETED.bits() as i64
      )),
      match_flags: MatchFlags::CONTAINS,
    }),
  ]);
  let mut tombstones =
    store.read_contact_ids(deleted_filter, vec![]).await.unwrap();
  tombstones.sort_unstable();
  assert_eq!(tombstones, vec![constituent_id, aggregate_id]);

  let deleted = store
    .read_deleted_contact_ids(Filter::Default)
    .await
    .unwrap();
  assert!(deleted.contains(&constituent_id));
}

// ─── Transient presence ──────────────────────────────────────────────────────

#[tokio::test]
async fn presence_only_update_stays_transient() {
  let (store, _dir) = store().await;
  let saved = save_one(&store, person("Livia", "Online")).await;
  let id = saved.id.unwrap();

  let (before, _) = store
    .read_contacts_by_id(vec![id], FetchHint::default(), false)
    .await
    .unwrap();
  let durable_modified = before[0].modified;

  let mut rx = store.subscribe();

  let mut update = before[0].clone();
  update.push_detail(DetailData::Presence(PresenceData {
    state: PresenceState::Available,
    ..Default::default()
  }));
  let (result, errors) = store
    .save_contacts(vec![update], vec![
      DetailKind::Presence,
      DetailKind::OnlineAccount,
      DetailKind::OriginMetadata,
    ])
    .await;
  result.unwrap();
  assert!(errors.is_empty());

  // Only the presence notification fires; no durable contact change.
  let mut saw_presence = false;
  while let Ok(notification) = rx.try_recv() {
    match notification {
      ChangeNotification::ContactsPresenceChanged(ids) => {
        assert_eq!(ids, vec![id]);
        saw_presence = true;
      }
      ChangeNotification::ContactsChanged(ids) => {
        panic!("unexpected durable change for {ids:?}");
      }
      _ => {}
    }
  }
  assert!(saw_presence);

  let (after, _) = store
    .read_contacts_by_id(vec![id], FetchHint::default(), false)
    .await
    .unwrap();
  let after = &after[0];

  // The read reflects the overlay: new presence, newer modification time.
  let global = after
    .details_of(DetailKind::GlobalPresence)
    .next()
    .expect("overlay global presence");
  assert!(matches!(
    &global.data,
    DetailData::GlobalPresence(p) if p.state == PresenceState::Available
  ));
  assert!(after.modified >= durable_modified);

  // A durable write invalidates the overlay again.
  let mut durable = after.clone();
  durable.remove_details_of(DetailKind::Presence);
  durable.remove_details_of(DetailKind::GlobalPresence);
  let (result, _) = store.save_contacts(vec![durable], vec![]).await;
  result.unwrap();
  let (final_read, _) = store
    .read_contacts_by_id(vec![id], FetchHint::default(), false)
    .await
    .unwrap();
  assert!(final_read[0]
    .details_of(DetailKind::GlobalPresence)
    .next()
    .is_none());
}

// ─── Filter boundaries ───────────────────────────────────────────────────────

#[tokio::test]
async fn oversize_id_filter_spills_to_temp_table() {
  let (store, _dir) = store().await;
  for (first, last) in [("A", "One"), ("B", "Two"), ("C", "Three")] {
    save_one(&store, person(first, last)).await;
  }

  // 897 ids force the temp-table path; the result must equal the union of
  // inline-sized sub-queries.
  let big: Vec<i64> = (3..900).collect();
  let spilled = store
    .read_contact_ids(Filter::Ids(big), vec![])
    .await
    .unwrap();

  let mut unioned = store
    .read_contact_ids(Filter::Ids((3..800).collect()), vec![])
    .await
    .unwrap();
  unioned.extend(
    store
      .read_contact_ids(Filter::Ids((800..900).collect()), vec![])
      .await
      .unwrap(),
  );
  unioned.sort_unstable();
  unioned.dedup();

  let mut spilled_sorted = spilled.clone();
  spilled_sorted.sort_unstable();
  assert!(!spilled.is_empty());
  assert_eq!(spilled_sorted, unioned);
}

#[tokio::test]
async fn oversize_collection_filter_is_refused() {
  let (store, _dir) = store().await;
  let err = store
    .read_contact_ids(Filter::Collections((0..900).collect()), vec![])
    .await
    .unwrap_err();
  assert_eq!(err, kindred_core::Error::Unspecified);
}

#[tokio::test]
async fn case_insensitive_match_uses_lowered_sibling() {
  let (store, _dir) = store().await;
  let saved = save_one(&store, person("MIXED", "Case")).await;
  let constituent_id = saved.id.unwrap();

  let found = store
    .read_contact_ids(
      Filter::Intersection(vec![
        Filter::Collections(vec![LOCAL_COLLECTION_ID]),
        Filter::matching(
          Field::NameFirst,
          "mixed",
          MatchFlags::STARTS_WITH,
        ),
      ]),
      vec![],
    )
    .await
    .unwrap();
  assert_eq!(found, vec![constituent_id]);

  // Case-sensitive with the wrong case finds nothing.
  let found = store
    .read_contact_ids(
      Filter::Intersection(vec![
        Filter::Collections(vec![LOCAL_COLLECTION_ID]),
        Filter::matching(
          Field::NameFirst,
          "mixed",
          MatchFlags::STARTS_WITH | MatchFlags::CASE_SENSITIVE,
        ),
      ]),
      vec![],
    )
    .await
    .unwrap();
  assert!(found.is_empty());
}

#[tokio::test]
async fn phone_filter_matches_normalised_form() {
  let (store, _dir) = store().await;
  let mut contact = person("Dial", "Tone");
  contact.push_detail(DetailData::PhoneNumber(PhoneNumberData {
    number: "+1 (555) 010-0199".into(),
    ..Default::default()
  }));
  let saved = save_one(&store, contact).await;

  let found = store
    .read_contact_ids(
      Filter::Intersection(vec![
        Filter::Collections(vec![LOCAL_COLLECTION_ID]),
        Filter::matching(
          Field::PhoneNumber,
          "+1-555-010-0199",
          MatchFlags::PHONE_NUMBER,
        ),
      ]),
      vec![],
    )
    .await
    .unwrap();
  assert_eq!(found, vec![saved.id.unwrap()]);
}

// ─── Sync reconciliation ─────────────────────────────────────────────────────

fn remote_person(first: &str, last: &str, email: &str) -> Contact {
  let mut contact = Contact::default();
  contact.push_detail(DetailData::Name(NameData {
    first: Some(first.into()),
    last: Some(last.into()),
    ..Default::default()
  }));
  contact.push_detail(DetailData::EmailAddress(email.into()));
  contact
}

#[tokio::test]
async fn sync_addition_and_fetch_round_trip() {
  let (store, _dir) = store().await;
  let collection = make_sync_collection(&store, "remote").await;

  let assigned = store
    .sync_update(collection, ConflictPolicy::PreserveRemoteChanges, vec![(
      None,
      Some(remote_person("Bob", "Roberts", "bob@x")),
    )])
    .await
    .unwrap();
  let aggregate_id = assigned[0].expect("aggregate assigned");

  let fetched = store
    .sync_fetch(collection, None, vec![])
    .await
    .unwrap();
  assert_eq!(fetched.added.len(), 1);
  assert!(fetched.updated.is_empty());
  assert!(fetched.deleted_ids.is_empty());
  assert!(fetched.max_timestamp.is_some());

  let view = &fetched.added[0];
  assert_eq!(view.id, Some(aggregate_id));
  assert!(view
    .details_of(DetailKind::EmailAddress)
    .any(|d| matches!(&d.data, DetailData::EmailAddress(a) if a == "bob@x")));
}

#[tokio::test]
async fn sync_update_preserves_local_changes() {
  let (store, _dir) = store().await;
  let collection = make_sync_collection(&store, "remote").await;

  let assigned = store
    .sync_update(collection, ConflictPolicy::PreserveRemoteChanges, vec![(
      None,
      Some(remote_person("Sally", "Fields", "old@x")),
    )])
    .await
    .unwrap();
  let aggregate_id = assigned[0].unwrap();

  let fetched = store.sync_fetch(collection, None, vec![]).await.unwrap();
  let old_view = fetched.added[0].clone();

  // Local edit: replace the constituent's email.
  let constituent_ids = store
    .read_contact_ids(Filter::Collections(vec![collection]), vec![])
    .await
    .unwrap();
  assert_eq!(constituent_ids.len(), 1);
  let (mut constituents, _) = store
    .read_contacts_by_id(constituent_ids.clone(), FetchHint::default(), true)
    .await
    .unwrap();
  let mut constituent = constituents.remove(0);
  for detail in &mut constituent.details {
    if let DetailData::EmailAddress(address) = &mut detail.data {
      *address = "local@x".into();
    }
  }
  let (result, _) = store.save_contacts(vec![constituent], vec![]).await;
  result.unwrap();

  // Remote changes the email too and adds a phone.
  let mut new_view = old_view.clone();
  for detail in &mut new_view.details {
    if let DetailData::EmailAddress(address) = &mut detail.data {
      *address = "remote@x".into();
    }
  }
  new_view.push_detail(DetailData::PhoneNumber(PhoneNumberData {
    number: "555-0101".into(),
    ..Default::default()
  }));

  store
    .sync_update(collection, ConflictPolicy::PreserveLocalChanges, vec![(
      Some(old_view),
      Some(new_view),
    )])
    .await
    .unwrap();

  // The local email wins; the phone addition is applied; the regenerated
  // aggregate reflects both.
  let (aggregates, _) = store
    .read_contacts_by_id(vec![aggregate_id], FetchHint::default(), false)
    .await
    .unwrap();
  let aggregate = &aggregates[0];
  let emails: Vec<&str> = aggregate
    .details_of(DetailKind::EmailAddress)
    .filter_map(|d| match &d.data {
      DetailData::EmailAddress(a) => Some(a.as_str()),
      _ => None,
    })
    .collect();
  assert_eq!(emails, vec!["local@x"]);
  assert!(aggregate
    .details_of(DetailKind::PhoneNumber)
    .any(|d| matches!(
      &d.data,
      DetailData::PhoneNumber(p) if p.number == "555-0101"
    )));
}

#[tokio::test]
async fn sync_deletion_tombstones_and_reports() {
  let (store, _dir) = store().await;
  let collection = make_sync_collection(&store, "remote").await;

  let assigned = store
    .sync_update(collection, ConflictPolicy::PreserveRemoteChanges, vec![(
      None,
      Some(remote_person("Tom", "Thumb", "tom@x")),
    )])
    .await
    .unwrap();
  let aggregate_id = assigned[0].unwrap();

  let fetched = store.sync_fetch(collection, None, vec![]).await.unwrap();
  let view = fetched.added[0].clone();

  store
    .sync_update(collection, ConflictPolicy::PreserveRemoteChanges, vec![(
      Some(view),
      None,
    )])
    .await
    .unwrap();

  // A later fetch passing the exported id reports the deletion.
  let fetched = store
    .sync_fetch(collection, None, vec![aggregate_id])
    .await
    .unwrap();
  assert_eq!(fetched.deleted_ids, vec![aggregate_id]);
}

// ─── Collections ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn collection_save_is_idempotent_for_same_fields() {
  let (store, _dir) = store().await;
  let id = make_sync_collection(&store, "twice").await;

  let collections = store.read_collections().await.unwrap();
  let collection = collections
    .iter()
    .find(|c| c.id == Some(id))
    .cloned()
    .unwrap();

  let (result, errors) = store.save_collections(vec![collection.clone()]).await;
  result.unwrap();
  assert!(errors.is_empty());

  let after = store.read_collections().await.unwrap();
  let after = after.iter().find(|c| c.id == Some(id)).unwrap();
  assert_eq!(after.name, collection.name);
  assert_eq!(after.account_id, collection.account_id);
}

#[tokio::test]
async fn reserved_collections_cannot_be_removed() {
  let (store, _dir) = store().await;
  let (result, errors) = store
    .remove_collections(
      vec![AGGREGATE_COLLECTION_ID, LOCAL_COLLECTION_ID],
      false,
    )
    .await;
  assert_eq!(result.unwrap_err(), kindred_core::Error::BadArgument);
  assert_eq!(errors.len(), 2);
}

#[tokio::test]
async fn collection_removal_cascades_to_contacts() {
  let (store, _dir) = store().await;
  let collection = make_sync_collection(&store, "doomed").await;

  let mut contact = person("In", "Doomed");
  contact.collection_id = Some(collection);
  let saved = save_one(&store, contact).await;
  let contact_id = saved.id.unwrap();

  let (result, errors) = store.remove_collections(vec![collection], false).await;
  result.unwrap();
  assert!(errors.is_empty());

  let visible = store
    .read_contact_ids(Filter::Ids(vec![contact_id]), vec![])
    .await
    .unwrap();
  assert!(visible.is_empty());

  let deleted = store
    .read_deleted_contact_ids(Filter::Collections(vec![collection]))
    .await
    .unwrap();
  assert!(deleted.contains(&contact_id));
}

#[tokio::test]
async fn fetch_contacts_in_collection_partitions_by_change_flags() {
  let (store, _dir) = store().await;
  let collection = make_sync_collection(&store, "partitioned").await;

  let mut contact = person("Fresh", "Row");
  contact.collection_id = Some(collection);
  let saved = save_one(&store, contact).await;

  let changes = store
    .fetch_contacts_in_collection(collection, FetchHint::default())
    .await
    .unwrap();
  assert_eq!(changes.added.len(), 1);
  assert!(changes.modified.is_empty());
  assert!(changes.deleted.is_empty());

  // Clearing the flags moves the contact to unmodified.
  store.clear_change_flags(collection).await.unwrap();
  let changes = store
    .fetch_contacts_in_collection(collection, FetchHint::default())
    .await
    .unwrap();
  assert!(changes.added.is_empty());
  assert_eq!(changes.unmodified.len(), 1);
  assert_eq!(changes.unmodified[0].id, saved.id);
}

// ─── OOB ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn oob_round_trip_across_compression_boundary() {
  let (store, _dir) = store().await;

  let mut values = BTreeMap::new();
  values.insert("small".to_owned(), OobValue::Text("anchor".into()));
  // Valid UTF-8 bytes must come back as bytes, not as a string.
  values.insert(
    "small-bytes".to_owned(),
    OobValue::Bytes(b"anchor".to_vec()),
  );
  values.insert(
    "large-string".to_owned(),
    OobValue::Text("cursor-state ".repeat(64)),
  );
  values.insert(
    "large-bytes".to_owned(),
    OobValue::Bytes(vec![7u8; 2048]),
  );
  store
    .store_oob("adapter".to_owned(), values.clone())
    .await
    .unwrap();

  let keys = store.fetch_oob_keys("adapter".to_owned()).await.unwrap();
  assert_eq!(keys, vec!["large-bytes", "large-string", "small", "small-bytes"]);

  let fetched = store
    .fetch_oob(
      "adapter".to_owned(),
      Some(vec![
        "small".to_owned(),
        "small-bytes".to_owned(),
        "large-string".to_owned(),
        "large-bytes".to_owned(),
      ]),
    )
    .await
    .unwrap();
  assert_eq!(fetched, values);

  // Scope isolation: other scopes see nothing.
  let other = store.fetch_oob("other".to_owned(), None).await.unwrap();
  assert!(other.is_empty());

  store
    .remove_oob("adapter".to_owned(), Some(vec!["small".to_owned()]))
    .await
    .unwrap();
  let keys = store.fetch_oob_keys("adapter".to_owned()).await.unwrap();
  assert_eq!(keys, vec!["large-bytes", "large-string", "small-bytes"]);
}

// ─── Relationships ───────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_relationships_are_silently_idempotent() {
  let (store, _dir) = store().await;
  let a = save_one(&store, person("First", "Friend")).await;
  let b = save_one(&store, person("Second", "Friend")).await;

  let edge = Relationship {
    first_id:  a.id.unwrap(),
    second_id: b.id.unwrap(),
    rel_type:  RelationshipType::HasMember,
  };
  let (result, errors) = store.save_relationships(vec![edge.clone()]).await;
  result.unwrap();
  assert!(errors.is_empty());

  let (result, errors) = store.save_relationships(vec![edge.clone()]).await;
  result.unwrap();
  assert!(errors.is_empty());

  let edges = store
    .read_relationships(Some(RelationshipType::HasMember), None, None)
    .await
    .unwrap();
  assert_eq!(edges.len(), 1);
}

#[tokio::test]
async fn invalid_relationship_marks_index_without_aborting_batch() {
  let (store, _dir) = store().await;
  let a = save_one(&store, person("Still", "Saved")).await;
  let b = save_one(&store, person("Also", "Saved")).await;

  let bad = Relationship {
    first_id:  a.id.unwrap(),
    second_id: a.id.unwrap(),
    rel_type:  RelationshipType::HasMember,
  };
  let good = Relationship {
    first_id:  a.id.unwrap(),
    second_id: b.id.unwrap(),
    rel_type:  RelationshipType::HasMember,
  };
  let (result, errors) = store.save_relationships(vec![bad, good]).await;
  assert_eq!(result.unwrap_err(), kindred_core::Error::InvalidRelationship);
  assert_eq!(errors.get(&0), Some(&kindred_core::Error::InvalidRelationship));

  let edges = store
    .read_relationships(Some(RelationshipType::HasMember), None, None)
    .await
    .unwrap();
  assert_eq!(edges.len(), 1);
}

// ─── Unique detail reads ─────────────────────────────────────────────────────

#[tokio::test]
async fn read_details_returns_unique_values() {
  let (store, _dir) = store().await;

  let mut a = person("Dup", "Email");
  a.push_detail(DetailData::EmailAddress("shared@x".into()));
  save_one(&store, a).await;
  let mut b = person("Other", "Person");
  b.push_detail(DetailData::EmailAddress("shared@x".into()));
  b.push_detail(DetailData::EmailAddress("unique@x".into()));
  save_one(&store, b).await;

  let details = store
    .read_details(
      DetailKind::EmailAddress,
      vec![Field::EmailAddress],
      Filter::Collections(vec![LOCAL_COLLECTION_ID]),
      vec![],
      FetchHint::default(),
    )
    .await
    .unwrap();
  let mut addresses: Vec<String> = details
    .iter()
    .filter_map(|d| match &d.data {
      DetailData::EmailAddress(a) => Some(a.clone()),
      _ => None,
    })
    .collect();
  addresses.sort();
  assert_eq!(addresses, vec!["shared@x", "unique@x"]);

  // Non-append-unique kinds are refused.
  let err = store
    .read_details(
      DetailKind::Name,
      vec![],
      Filter::Default,
      vec![],
      FetchHint::default(),
    )
    .await
    .unwrap_err();
  assert_eq!(err, kindred_core::Error::NotSupported);
}
