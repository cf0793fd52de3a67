//! Collections (address books) and identity slots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flags::ChangeFlags;

/// A named container for contacts, possibly tied to an external sync source
/// via `account_id` and `remote_path`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
  /// Row id; `None` until persisted.
  pub id:               Option<i64>,
  pub name:             Option<String>,
  pub description:      Option<String>,
  pub color:            Option<String>,
  pub secondary_color:  Option<String>,
  pub image:            Option<String>,
  pub application_name: Option<String>,
  /// Owning account; 0 means none.
  pub account_id:       i64,
  pub remote_path:      Option<String>,
  /// Whether contacts of this collection participate in aggregation.
  pub aggregable:       bool,
  pub change_flags:     ChangeFlags,
  /// Whether per-row unhandled change flags are recorded for this
  /// collection's contacts (set by sync adapters that batch uploads).
  pub record_unhandled_change_flags: bool,
  /// Arbitrary adapter-defined metadata.
  pub metadata:         BTreeMap<String, serde_json::Value>,
}

impl Collection {
  pub fn named(name: &str) -> Self {
    Self { name: Some(name.to_owned()), aggregable: true, ..Default::default() }
  }
}

/// Collections partitioned by their change flags, as returned by the
/// collection fetch operations.
#[derive(Debug, Clone, Default)]
pub struct CollectionChanges {
  pub added:      Vec<Collection>,
  pub modified:   Vec<Collection>,
  pub deleted:    Vec<Collection>,
  pub unmodified: Vec<Collection>,
}

/// Well-known identity slots mapping to contact ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentitySlot {
  /// The device owner's aggregate contact. Fixed; cannot be reassigned.
  SelfContactId,
}

impl IdentitySlot {
  pub fn to_int(self) -> i64 {
    match self {
      Self::SelfContactId => 1,
    }
  }
}
