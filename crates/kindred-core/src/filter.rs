//! The composable filter tree and sort orders accepted by read operations.
//!
//! Filters are plain data; the storage engine compiles them into SQL. A
//! filter that cannot be compiled causes the read to fail with
//! [`crate::Error::Unspecified`].

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  detail::DetailKind,
  relationship::RelationshipType,
};

// ─── Fields ──────────────────────────────────────────────────────────────────

/// A filterable / sortable field of some detail type (or of the contact row
/// itself, for the timestamp and status-flag pseudo-details).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
  AddressStreet,
  AddressPostOfficeBox,
  AddressRegion,
  AddressLocality,
  AddressPostCode,
  AddressCountry,
  AddressSubTypes,
  AnniversaryDate,
  AnniversaryCalendarId,
  AnniversarySubType,
  AnniversaryEvent,
  AvatarImageUrl,
  AvatarVideoUrl,
  AvatarMetadata,
  BirthdayDate,
  BirthdayCalendarId,
  DisplayLabel,
  DisplayLabelGroup,
  DisplayLabelGroupSortOrder,
  EmailAddress,
  FamilySpouse,
  FamilyChildren,
  Favorite,
  Gender,
  GeoLabel,
  GeoLatitude,
  GeoLongitude,
  GeoAccuracy,
  GeoAltitude,
  GeoTimestamp,
  GlobalPresenceState,
  GlobalPresenceNickname,
  GlobalPresenceCustomMessage,
  Guid,
  Hobby,
  NameFirst,
  NameLast,
  NameMiddle,
  NamePrefix,
  NameSuffix,
  NameCustomLabel,
  Nickname,
  Note,
  OnlineAccountUri,
  OnlineAccountProtocol,
  OnlineAccountServiceProvider,
  OnlineAccountSubTypes,
  OrganizationName,
  OrganizationRole,
  OrganizationTitle,
  OrganizationLocation,
  OrganizationDepartment,
  PhoneNumber,
  PhoneSubTypes,
  PresenceState,
  PresenceNickname,
  PresenceCustomMessage,
  PresenceTimestamp,
  RingtoneAudio,
  RingtoneVideo,
  SyncTarget,
  Tag,
  Url,
  UrlSubType,
  OriginMetadataId,
  OriginMetadataGroupId,
  OriginMetadataEnabled,
  ExtendedDetailName,
  /// Rollup + change-flag bits on the contact row (see
  /// [`crate::flags::StatusFlags`]).
  StatusFlags,
  /// Creation timestamp on the contact row.
  TimestampCreated,
  /// Modification timestamp, overlay-coalesced with the transient store.
  TimestampModified,
  /// Reserved contact-type tag.
  ContactType,
}

impl Field {
  /// The detail kind this field belongs to, or `None` for contact-row
  /// pseudo-details (timestamps, status flags, type).
  pub fn kind(self) -> Option<DetailKind> {
    use Field::*;
    Some(match self {
      AddressStreet | AddressPostOfficeBox | AddressRegion
      | AddressLocality | AddressPostCode | AddressCountry
      | AddressSubTypes => DetailKind::Address,
      AnniversaryDate | AnniversaryCalendarId | AnniversarySubType
      | AnniversaryEvent => DetailKind::Anniversary,
      AvatarImageUrl | AvatarVideoUrl | AvatarMetadata => DetailKind::Avatar,
      BirthdayDate | BirthdayCalendarId => DetailKind::Birthday,
      DisplayLabel | DisplayLabelGroup | DisplayLabelGroupSortOrder => {
        DetailKind::DisplayLabel
      }
      EmailAddress => DetailKind::EmailAddress,
      FamilySpouse | FamilyChildren => DetailKind::Family,
      Favorite => DetailKind::Favorite,
      Gender => DetailKind::Gender,
      GeoLabel | GeoLatitude | GeoLongitude | GeoAccuracy | GeoAltitude
      | GeoTimestamp => DetailKind::GeoLocation,
      GlobalPresenceState | GlobalPresenceNickname
      | GlobalPresenceCustomMessage => DetailKind::GlobalPresence,
      Guid => DetailKind::Guid,
      Hobby => DetailKind::Hobby,
      NameFirst | NameLast | NameMiddle | NamePrefix | NameSuffix
      | NameCustomLabel => DetailKind::Name,
      Nickname => DetailKind::Nickname,
      Note => DetailKind::Note,
      OnlineAccountUri | OnlineAccountProtocol
      | OnlineAccountServiceProvider | OnlineAccountSubTypes => {
        DetailKind::OnlineAccount
      }
      OrganizationName | OrganizationRole | OrganizationTitle
      | OrganizationLocation | OrganizationDepartment => {
        DetailKind::Organization
      }
      PhoneNumber | PhoneSubTypes => DetailKind::PhoneNumber,
      PresenceState | PresenceNickname | PresenceCustomMessage
      | PresenceTimestamp => DetailKind::Presence,
      RingtoneAudio | RingtoneVideo => DetailKind::Ringtone,
      SyncTarget => DetailKind::SyncTarget,
      Tag => DetailKind::Tag,
      Url | UrlSubType => DetailKind::Url,
      OriginMetadataId | OriginMetadataGroupId | OriginMetadataEnabled => {
        DetailKind::OriginMetadata
      }
      ExtendedDetailName => DetailKind::ExtendedDetail,
      StatusFlags | TimestampCreated | TimestampModified | ContactType => {
        return None;
      }
    })
  }
}

// ─── Values & match semantics ────────────────────────────────────────────────

/// A value bound into a compiled filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
  Text(String),
  Integer(i64),
  Real(f64),
  Boolean(bool),
  Date(DateTime<Utc>),
}

impl From<&str> for FilterValue {
  fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<i64> for FilterValue {
  fn from(v: i64) -> Self { Self::Integer(v) }
}

impl From<bool> for FilterValue {
  fn from(v: bool) -> Self { Self::Boolean(v) }
}

impl From<DateTime<Utc>> for FilterValue {
  fn from(v: DateTime<Utc>) -> Self { Self::Date(v) }
}

bitflags! {
  /// How a detail filter value is compared. The low three bits select the
  /// GLOB shape; the remainder are modifiers.
  #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
  pub struct MatchFlags: u32 {
    const CONTAINS         = 1;
    const STARTS_WITH      = 2;
    const ENDS_WITH        = 4;
    const FIXED_STRING     = 8;
    const CASE_SENSITIVE   = 16;
    /// Compare phone numbers by normalised form.
    const PHONE_NUMBER     = 1024;
    /// Keypad-collation matching; not supported by this engine.
    const KEYPAD_COLLATION = 2048;
  }
}

impl MatchFlags {
  /// The GLOB-shape selector (exact / contains / starts-with / ends-with).
  pub fn glob_shape(self) -> MatchFlags {
    MatchFlags::from_bits_truncate(self.bits() & 7)
  }
}

bitflags! {
  /// Bound inclusion for range filters. The default is inclusive lower,
  /// exclusive upper.
  #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
  pub struct RangeFlags: u32 {
    const EXCLUDE_LOWER = 1;
    const INCLUDE_UPPER = 2;
  }
}

// ─── Filter tree ─────────────────────────────────────────────────────────────

/// Which change-log events a [`Filter::ChangeLog`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeLogEvent {
  Added,
  Changed,
  Removed,
}

/// Which side of the relationship the filtered contact occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipRole {
  First,
  Second,
  Either,
}

/// A detail-value predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailFilter {
  pub field:       Field,
  /// `None` tests for mere presence of a value in the field.
  pub value:       Option<FilterValue>,
  pub match_flags: MatchFlags,
}

/// A detail-value range predicate. With both bounds `None` this tests
/// `IS NOT NULL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailRangeFilter {
  pub field: Field,
  pub min:   Option<FilterValue>,
  pub max:   Option<FilterValue>,
  pub flags: RangeFlags,
}

/// The composable filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
  /// Matches everything (subject to default visibility constraints).
  Default,
  /// At least one detail of the kind exists.
  DetailExists(DetailKind),
  Detail(DetailFilter),
  DetailRange(DetailRangeFilter),
  Ids(Vec<i64>),
  Collections(Vec<i64>),
  ChangeLog {
    since: DateTime<Utc>,
    event: ChangeLogEvent,
  },
  Relationship {
    rel_type:   Option<RelationshipType>,
    contact_id: Option<i64>,
    role:       RelationshipRole,
  },
  Union(Vec<Filter>),
  Intersection(Vec<Filter>),
}

impl Filter {
  /// Equality detail filter with default match semantics.
  pub fn equals(field: Field, value: impl Into<FilterValue>) -> Self {
    Self::Detail(DetailFilter {
      field,
      value: Some(value.into()),
      match_flags: MatchFlags::empty(),
    })
  }

  pub fn matching(
    field: Field,
    value: impl Into<FilterValue>,
    match_flags: MatchFlags,
  ) -> Self {
    Self::Detail(DetailFilter { field, value: Some(value.into()), match_flags })
  }
}

// ─── Sort orders ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
  Ascending,
  Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlankPolicy {
  BlanksFirst,
  BlanksLast,
}

/// One term of a multi-field sort order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortOrder {
  pub field:          Field,
  pub direction:      SortDirection,
  pub blank_policy:   BlankPolicy,
  pub case_sensitive: bool,
}

impl SortOrder {
  pub fn ascending(field: Field) -> Self {
    Self {
      field,
      direction: SortDirection::Ascending,
      blank_policy: BlankPolicy::BlanksLast,
      case_sensitive: false,
    }
  }

  pub fn descending(field: Field) -> Self {
    Self { direction: SortDirection::Descending, ..Self::ascending(field) }
  }
}

// ─── Fetch hints ─────────────────────────────────────────────────────────────

/// Caller guidance for read operations; never changes which contacts match,
/// only how much of each is materialised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchHint {
  pub max_count:             Option<usize>,
  /// Restrict materialised details to these kinds; `None` means all.
  pub detail_types:          Option<Vec<DetailKind>>,
  pub include_relationships: bool,
}

impl FetchHint {
  pub fn wants_kind(&self, kind: DetailKind) -> bool {
    match &self.detail_types {
      Some(kinds) => kinds.contains(&kind),
      None => true,
    }
  }
}
