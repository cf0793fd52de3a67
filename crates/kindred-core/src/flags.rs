//! Bit-set types shared across rows: change flags, status rollups, and
//! detail access constraints.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
  /// Durable per-row change tracking. `IS_DELETED` tombstones the row; the
  /// physical row survives until the owning collection is removed or a
  /// sync adapter clears its flags.
  #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
  pub struct ChangeFlags: u32 {
    const IS_ADDED    = 1;
    const IS_MODIFIED = 2;
    const IS_DELETED  = 4;
  }
}

impl ChangeFlags {
  pub fn is_deleted(self) -> bool { self.contains(Self::IS_DELETED) }
}

bitflags! {
  /// Rollup flags kept on the `Contacts` row, plus the change-flag bits as
  /// seen through the status-flags filter field.
  #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
  pub struct StatusFlags: u32 {
    const HAS_PHONE_NUMBER   = 1;
    const HAS_EMAIL_ADDRESS  = 2;
    const HAS_ONLINE_ACCOUNT = 4;
    const IS_ONLINE          = 8;
    const IS_DEACTIVATED     = 16;
    const IS_ADDED           = 32;
    const IS_MODIFIED        = 64;
    const IS_DELETED         = 128;
  }
}

bitflags! {
  /// Constraints applied to details that clients may not alter. All details
  /// of an aggregate contact carry `READ_ONLY | IRREMOVABLE`.
  #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
  pub struct AccessConstraints: u32 {
    const READ_ONLY   = 1;
    const IRREMOVABLE = 2;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deleted_flag_round_trip() {
    let flags = ChangeFlags::IS_ADDED | ChangeFlags::IS_DELETED;
    assert!(flags.is_deleted());
    assert_eq!(ChangeFlags::from_bits_truncate(flags.bits()), flags);
    assert!(!ChangeFlags::IS_MODIFIED.is_deleted());
  }
}
