//! The caller-visible error taxonomy.
//!
//! Engine operations never panic; unexpected storage failures are logged at
//! the point of occurrence and surface as [`Error::Unspecified`]. Batch
//! operations additionally report a per-index [`ErrorMap`] and return the
//! worst error encountered.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// The referenced contact, collection, or relationship does not exist.
  #[error("does not exist")]
  DoesNotExist,

  /// The request is malformed (reserved id, wrong collection, etc.).
  #[error("bad argument")]
  BadArgument,

  /// A detail violates the supported-type or uniqueness constraints.
  #[error("invalid detail")]
  InvalidDetail,

  /// A relationship refers to an invalid participant pair.
  #[error("invalid relationship")]
  InvalidRelationship,

  /// A cardinality limit was exceeded (singular detail, inline id count).
  #[error("limit reached")]
  LimitReached,

  /// The operation is not supported by this engine.
  #[error("not supported")]
  NotSupported,

  /// The store is locked by another writer.
  #[error("locked")]
  Locked,

  /// Any other failure; diagnostics are emitted via `tracing`.
  #[error("unspecified error")]
  Unspecified,
}

impl Error {
  /// Relative severity, used to pick the "worst" error of a batch.
  /// Higher is worse; `Unspecified` dominates everything.
  fn severity(self) -> u8 {
    match self {
      Self::DoesNotExist => 1,
      Self::NotSupported => 2,
      Self::LimitReached => 3,
      Self::InvalidRelationship => 4,
      Self::InvalidDetail => 5,
      Self::BadArgument => 6,
      Self::Locked => 7,
      Self::Unspecified => 8,
    }
  }

  /// The worse of two errors.
  pub fn worst(self, other: Error) -> Error {
    if other.severity() > self.severity() {
      other
    } else {
      self
    }
  }
}

/// Per-index errors produced by batch operations.
pub type ErrorMap = BTreeMap<usize, Error>;

/// The worst error in `map`, if any.
pub fn worst_of(map: &ErrorMap) -> Option<Error> {
  map.values().copied().reduce(Error::worst)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn worst_error_ordering() {
    assert_eq!(
      Error::DoesNotExist.worst(Error::Unspecified),
      Error::Unspecified
    );
    assert_eq!(
      Error::BadArgument.worst(Error::DoesNotExist),
      Error::BadArgument
    );

    let mut map = ErrorMap::new();
    assert_eq!(worst_of(&map), None);
    map.insert(0, Error::DoesNotExist);
    map.insert(3, Error::InvalidDetail);
    assert_eq!(worst_of(&map), Some(Error::InvalidDetail));
  }
}
