//! Relationships — typed edges between two contacts.

use serde::{Deserialize, Serialize};

/// The type tag of a relationship edge. `Aggregates` and `IsNot` are
/// reserved for the aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipType {
  /// Aggregate → constituent edge; maintained by the engine only.
  Aggregates,
  /// Prevents the aggregation heuristic from ever merging two contacts.
  IsNot,
  HasMember,
  Other(String),
}

impl RelationshipType {
  pub fn as_str(&self) -> &str {
    match self {
      Self::Aggregates => "Aggregates",
      Self::IsNot => "IsNot",
      Self::HasMember => "HasMember",
      Self::Other(s) => s,
    }
  }

  pub fn from_str(s: &str) -> Self {
    match s {
      "Aggregates" => Self::Aggregates,
      "IsNot" => Self::IsNot,
      "HasMember" => Self::HasMember,
      other => Self::Other(other.to_owned()),
    }
  }
}

/// A directed, typed edge. `(first, second, type)` is unique; no ordering
/// between `first` and `second` is imposed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
  pub first_id:  i64,
  pub second_id: i64,
  pub rel_type:  RelationshipType,
}

impl Relationship {
  pub fn aggregates(aggregate_id: i64, constituent_id: i64) -> Self {
    Self {
      first_id:  aggregate_id,
      second_id: constituent_id,
      rel_type:  RelationshipType::Aggregates,
    }
  }

  pub fn is_not(first_id: i64, second_id: i64) -> Self {
    Self { first_id, second_id, rel_type: RelationshipType::IsNot }
  }
}
