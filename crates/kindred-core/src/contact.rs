//! The contact record and its reserved ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  detail::{Detail, DetailData, DetailKind},
  flags::{ChangeFlags, StatusFlags},
  relationship::Relationship,
};

/// Collection holding synthesised aggregate contacts. Not aggregable and
/// never written directly by clients.
pub const AGGREGATE_COLLECTION_ID: i64 = 1;
/// Collection holding device-originated contacts.
pub const LOCAL_COLLECTION_ID: i64 = 2;

/// The device owner's local constituent contact.
pub const LOCAL_SELF_CONTACT_ID: i64 = 1;
/// The device owner's aggregate contact; reported as the self contact.
pub const SELF_CONTACT_ID: i64 = 2;

/// Only the "person" contact type is supported; the column is reserved.
pub const CONTACT_TYPE_PERSON: i32 = 0;

/// A contact row plus its materialised details.
///
/// Materialised contacts are ephemeral per operation; the engine works in
/// terms of ids and rebuilds these on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
  /// Row id; `None` until persisted.
  pub id:            Option<i64>,
  /// Owning collection; defaults to the local collection on create.
  pub collection_id: Option<i64>,
  pub created:       Option<DateTime<Utc>>,
  pub modified:      Option<DateTime<Utc>>,
  /// Tombstone timestamp; set when the contact is deleted.
  pub deleted:       Option<DateTime<Utc>>,
  pub status_flags:  StatusFlags,
  pub change_flags:  ChangeFlags,
  pub details:       Vec<Detail>,
  /// Relationships this contact participates in; populated on read when the
  /// fetch hint asks for them.
  pub relationships: Vec<Relationship>,
}

impl Contact {
  pub fn new(collection_id: i64) -> Self {
    Self { collection_id: Some(collection_id), ..Default::default() }
  }

  pub fn is_aggregate(&self) -> bool {
    self.collection_id == Some(AGGREGATE_COLLECTION_ID)
  }

  pub fn details_of(&self, kind: DetailKind) -> impl Iterator<Item = &Detail> {
    self.details.iter().filter(move |d| d.kind() == kind)
  }

  /// The unique detail of a singular kind, if present.
  pub fn single_detail(&self, kind: DetailKind) -> Option<&Detail> {
    self.details_of(kind).next()
  }

  pub fn push_detail(&mut self, data: DetailData) -> &mut Detail {
    self.details.push(Detail::new(data));
    self.details.last_mut().unwrap()
  }

  /// Drop all details of `kind` (used before the engine re-synthesises
  /// derived details such as the display label).
  pub fn remove_details_of(&mut self, kind: DetailKind) {
    self.details.retain(|d| d.kind() != kind);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_detail_of_kind() {
    let mut c = Contact::new(LOCAL_COLLECTION_ID);
    c.push_detail(DetailData::Nickname("Ace".into()));
    c.push_detail(DetailData::EmailAddress("a@x".into()));
    c.push_detail(DetailData::EmailAddress("b@x".into()));

    assert_eq!(c.details_of(DetailKind::EmailAddress).count(), 2);
    assert!(c.single_detail(DetailKind::Nickname).is_some());
    assert!(c.single_detail(DetailKind::Name).is_none());

    c.remove_details_of(DetailKind::EmailAddress);
    assert_eq!(c.details_of(DetailKind::EmailAddress).count(), 0);
  }
}
