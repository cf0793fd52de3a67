//! Detail types — the typed field payloads attached to contacts.
//!
//! Every detail is stored as a row in the shared `Details` table plus a row
//! in one per-type table. The [`DetailData`] variant name doubles as the
//! type discriminant stored in the `detail` column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flags::{AccessConstraints, ChangeFlags};

// ─── Contexts ────────────────────────────────────────────────────────────────

/// The sphere of life a detail belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Context {
  Home,
  Work,
  Other,
}

impl Context {
  pub fn to_int(self) -> i32 {
    match self {
      Self::Home => 0,
      Self::Work => 1,
      Self::Other => 2,
    }
  }

  pub fn from_int(value: i32) -> Option<Self> {
    match value {
      0 => Some(Self::Home),
      1 => Some(Self::Work),
      2 => Some(Self::Other),
      _ => None,
    }
  }
}

// ─── Enumerated field values ─────────────────────────────────────────────────

/// Presence availability. Numeric values are the stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
  Unknown      = 0,
  Available    = 1,
  Hidden       = 2,
  Busy         = 3,
  Away         = 4,
  ExtendedAway = 5,
  Offline      = 6,
}

impl PresenceState {
  pub fn to_int(self) -> i32 { self as i32 }

  pub fn from_int(value: i32) -> Self {
    match value {
      1 => Self::Available,
      2 => Self::Hidden,
      3 => Self::Busy,
      4 => Self::Away,
      5 => Self::ExtendedAway,
      6 => Self::Offline,
      _ => Self::Unknown,
    }
  }

  /// Position in the fixed availability order used to pick the "best"
  /// presence across a contact's accounts:
  /// `Available < Away < ExtendedAway < Busy < Hidden < Offline < Unknown`.
  pub fn availability_rank(self) -> u8 {
    match self {
      Self::Available => 0,
      Self::Away => 1,
      Self::ExtendedAway => 2,
      Self::Busy => 3,
      Self::Hidden => 4,
      Self::Offline => 5,
      Self::Unknown => 6,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
  Male   = 0,
  Female = 1,
  #[default]
  Unspecified = 2,
}

impl Gender {
  pub fn to_int(self) -> i32 { self as i32 }

  pub fn from_int(value: i32) -> Self {
    match value {
      0 => Self::Male,
      1 => Self::Female,
      _ => Self::Unspecified,
    }
  }

  /// The gender excluded from aggregation candidates, if any.
  pub fn opposite(self) -> Option<Gender> {
    match self {
      Self::Male => Some(Self::Female),
      Self::Female => Some(Self::Male),
      Self::Unspecified => None,
    }
  }
}

// ─── Structured payloads ─────────────────────────────────────────────────────

/// A postal address. Sub-types are stored as `;`-joined numeric text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressData {
  pub street:          Option<String>,
  pub post_office_box: Option<String>,
  pub region:          Option<String>,
  pub locality:        Option<String>,
  pub post_code:       Option<String>,
  pub country:         Option<String>,
  pub sub_types:       Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnniversaryData {
  pub original_date: Option<DateTime<Utc>>,
  pub calendar_id:   Option<String>,
  pub sub_type:      Option<i32>,
  pub event:         Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvatarData {
  pub image_url: Option<String>,
  pub video_url: Option<String>,
  /// Arbitrary adapter-defined metadata.
  pub metadata:  Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BirthdayData {
  pub date:        Option<DateTime<Utc>>,
  pub calendar_id: Option<String>,
}

/// Unique per contact; recomputed by the engine on every save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayLabelData {
  pub label:            String,
  pub group:            Option<String>,
  pub group_sort_order: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyData {
  pub spouse:   Option<String>,
  pub children: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoLocationData {
  pub label:             Option<String>,
  pub latitude:          Option<f64>,
  pub longitude:         Option<f64>,
  pub accuracy:          Option<f64>,
  pub altitude:          Option<f64>,
  pub altitude_accuracy: Option<f64>,
  pub heading:           Option<f64>,
  pub speed:             Option<f64>,
  pub timestamp:         Option<DateTime<Utc>>,
}

/// Shared by the per-account `Presence` detail and the synthesised
/// `GlobalPresence` detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
  pub state:           PresenceState,
  pub timestamp:       Option<DateTime<Utc>>,
  pub nickname:        Option<String>,
  pub custom_message:  Option<String>,
  pub state_text:      Option<String>,
  pub state_image_url: Option<String>,
}

impl Default for PresenceData {
  fn default() -> Self {
    Self {
      state:           PresenceState::Unknown,
      timestamp:       None,
      nickname:        None,
      custom_message:  None,
      state_text:      None,
      state_image_url: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameData {
  pub first:        Option<String>,
  pub last:         Option<String>,
  pub middle:       Option<String>,
  pub prefix:       Option<String>,
  pub suffix:       Option<String>,
  pub custom_label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineAccountData {
  pub account_uri:                   String,
  /// Messaging protocol, stored as numeric text.
  pub protocol:                      Option<i32>,
  pub service_provider:              Option<String>,
  pub capabilities:                  Vec<String>,
  pub sub_types:                     Vec<i32>,
  pub account_path:                  Option<String>,
  pub account_icon_path:             Option<String>,
  pub enabled:                       Option<bool>,
  pub account_display_name:          Option<String>,
  pub service_provider_display_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationData {
  pub name:           Option<String>,
  pub role:           Option<String>,
  pub title:          Option<String>,
  pub location:       Option<String>,
  pub department:     Option<String>,
  pub logo_url:       Option<String>,
  pub assistant_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhoneNumberData {
  pub number:    String,
  pub sub_types: Vec<i32>,
  /// Computed by the engine at write time; never accepted from callers.
  pub normalized: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RingtoneData {
  pub audio:     Option<String>,
  pub video:     Option<String>,
  pub vibration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UrlData {
  pub url:      String,
  pub sub_type: Option<i32>,
}

/// Sync-adapter bookkeeping attached to a single detail or contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginMetadataData {
  pub id:       Option<String>,
  pub group_id: Option<String>,
  pub enabled:  Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedDetailData {
  pub name: String,
  pub data: serde_json::Value,
}

// ─── DetailData ──────────────────────────────────────────────────────────────

/// The typed payload of a detail. The variant name is the discriminant
/// stored in the `detail` column of the shared table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DetailData {
  Address(AddressData),
  Anniversary(AnniversaryData),
  Avatar(AvatarData),
  Birthday(BirthdayData),
  DisplayLabel(DisplayLabelData),
  EmailAddress(String),
  Family(FamilyData),
  Favorite(bool),
  Gender(Gender),
  GeoLocation(GeoLocationData),
  GlobalPresence(PresenceData),
  Guid(String),
  Hobby(String),
  Name(NameData),
  Nickname(String),
  Note(String),
  OnlineAccount(OnlineAccountData),
  Organization(OrganizationData),
  PhoneNumber(PhoneNumberData),
  Presence(PresenceData),
  Ringtone(RingtoneData),
  SyncTarget(String),
  Tag(String),
  Url(UrlData),
  OriginMetadata(OriginMetadataData),
  ExtendedDetail(ExtendedDetailData),
  /// Marker detail with no per-type table; its presence sets the
  /// `isDeactivated` rollup on the contact row.
  Deactivated,
}

impl DetailData {
  pub fn kind(&self) -> DetailKind {
    match self {
      Self::Address(_) => DetailKind::Address,
      Self::Anniversary(_) => DetailKind::Anniversary,
      Self::Avatar(_) => DetailKind::Avatar,
      Self::Birthday(_) => DetailKind::Birthday,
      Self::DisplayLabel(_) => DetailKind::DisplayLabel,
      Self::EmailAddress(_) => DetailKind::EmailAddress,
      Self::Family(_) => DetailKind::Family,
      Self::Favorite(_) => DetailKind::Favorite,
      Self::Gender(_) => DetailKind::Gender,
      Self::GeoLocation(_) => DetailKind::GeoLocation,
      Self::GlobalPresence(_) => DetailKind::GlobalPresence,
      Self::Guid(_) => DetailKind::Guid,
      Self::Hobby(_) => DetailKind::Hobby,
      Self::Name(_) => DetailKind::Name,
      Self::Nickname(_) => DetailKind::Nickname,
      Self::Note(_) => DetailKind::Note,
      Self::OnlineAccount(_) => DetailKind::OnlineAccount,
      Self::Organization(_) => DetailKind::Organization,
      Self::PhoneNumber(_) => DetailKind::PhoneNumber,
      Self::Presence(_) => DetailKind::Presence,
      Self::Ringtone(_) => DetailKind::Ringtone,
      Self::SyncTarget(_) => DetailKind::SyncTarget,
      Self::Tag(_) => DetailKind::Tag,
      Self::Url(_) => DetailKind::Url,
      Self::OriginMetadata(_) => DetailKind::OriginMetadata,
      Self::ExtendedDetail(_) => DetailKind::ExtendedDetail,
      Self::Deactivated => DetailKind::Deactivated,
    }
  }
}

// ─── DetailKind ──────────────────────────────────────────────────────────────

/// Fieldless mirror of [`DetailData`], used for masks, hints, and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DetailKind {
  Address,
  Anniversary,
  Avatar,
  Birthday,
  DisplayLabel,
  EmailAddress,
  Family,
  Favorite,
  Gender,
  GeoLocation,
  GlobalPresence,
  Guid,
  Hobby,
  Name,
  Nickname,
  Note,
  OnlineAccount,
  Organization,
  PhoneNumber,
  Presence,
  Ringtone,
  SyncTarget,
  Tag,
  Url,
  OriginMetadata,
  ExtendedDetail,
  Deactivated,
}

impl DetailKind {
  pub const ALL: [DetailKind; 27] = [
    Self::Address,
    Self::Anniversary,
    Self::Avatar,
    Self::Birthday,
    Self::DisplayLabel,
    Self::EmailAddress,
    Self::Family,
    Self::Favorite,
    Self::Gender,
    Self::GeoLocation,
    Self::GlobalPresence,
    Self::Guid,
    Self::Hobby,
    Self::Name,
    Self::Nickname,
    Self::Note,
    Self::OnlineAccount,
    Self::Organization,
    Self::PhoneNumber,
    Self::Presence,
    Self::Ringtone,
    Self::SyncTarget,
    Self::Tag,
    Self::Url,
    Self::OriginMetadata,
    Self::ExtendedDetail,
    Self::Deactivated,
  ];

  /// The discriminant stored in the `detail` column.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Address => "Address",
      Self::Anniversary => "Anniversary",
      Self::Avatar => "Avatar",
      Self::Birthday => "Birthday",
      Self::DisplayLabel => "DisplayLabel",
      Self::EmailAddress => "EmailAddress",
      Self::Family => "Family",
      Self::Favorite => "Favorite",
      Self::Gender => "Gender",
      Self::GeoLocation => "GeoLocation",
      Self::GlobalPresence => "GlobalPresence",
      Self::Guid => "Guid",
      Self::Hobby => "Hobby",
      Self::Name => "Name",
      Self::Nickname => "Nickname",
      Self::Note => "Note",
      Self::OnlineAccount => "OnlineAccount",
      Self::Organization => "Organization",
      Self::PhoneNumber => "PhoneNumber",
      Self::Presence => "Presence",
      Self::Ringtone => "Ringtone",
      Self::SyncTarget => "SyncTarget",
      Self::Tag => "Tag",
      Self::Url => "Url",
      Self::OriginMetadata => "OriginMetadata",
      Self::ExtendedDetail => "ExtendedDetail",
      Self::Deactivated => "Deactivated",
    }
  }

  pub fn from_str(s: &str) -> Option<Self> {
    Self::ALL.iter().copied().find(|k| k.as_str() == s)
  }

  /// At most one detail of this kind may exist per contact.
  pub fn is_singular(self) -> bool {
    matches!(
      self,
      Self::DisplayLabel
        | Self::Name
        | Self::SyncTarget
        | Self::Favorite
        | Self::Gender
        | Self::Birthday
        | Self::OriginMetadata
        | Self::Deactivated
    )
  }

  /// Aggregate values of this kind are combined field-wise from the
  /// constituents, rather than copied per-detail.
  pub fn is_composed(self) -> bool {
    matches!(
      self,
      Self::Name | Self::Gender | Self::Favorite | Self::Birthday
    )
  }

  /// Unique values of this kind may be enumerated by `read_details`.
  pub fn can_append_unique(self) -> bool {
    matches!(
      self,
      Self::EmailAddress
        | Self::PhoneNumber
        | Self::OnlineAccount
        | Self::Nickname
        | Self::Tag
        | Self::Hobby
        | Self::Url
        | Self::Organization
    )
  }

  /// Kinds that identify the aggregate itself; carried forward verbatim
  /// during regeneration instead of being re-derived from constituents.
  pub fn identifies_aggregate(self) -> bool {
    matches!(self, Self::SyncTarget | Self::Guid)
  }

  /// Kinds never promoted from constituents onto an aggregate.
  pub fn excluded_from_promotion(self) -> bool {
    matches!(
      self,
      Self::DisplayLabel | Self::GlobalPresence | Self::Deactivated
    )
  }
}

// ─── Provenance ──────────────────────────────────────────────────────────────

/// Identifies the origin row of a detail:
/// `"<collectionId>:<contactId>:<detailId>"`. Aggregate details carry the
/// provenance of the constituent detail they were promoted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
  pub collection_id: i64,
  pub contact_id:    i64,
  pub detail_id:     i64,
}

impl Provenance {
  pub fn encode(&self) -> String {
    format!("{}:{}:{}", self.collection_id, self.contact_id, self.detail_id)
  }

  pub fn decode(s: &str) -> Option<Self> {
    let mut parts = s.splitn(3, ':');
    let collection_id = parts.next()?.parse().ok()?;
    let contact_id = parts.next()?.parse().ok()?;
    let detail_id = parts.next()?.parse().ok()?;
    Some(Self { collection_id, contact_id, detail_id })
  }
}

// ─── Detail ──────────────────────────────────────────────────────────────────

/// URI prefix applied to every detail promoted onto an aggregate, so that
/// aggregate detail URIs never collide with constituent originals.
pub const AGGREGATE_URI_PREFIX: &str = "aggregate:";

/// A typed payload plus the envelope columns of the shared `Details` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detail {
  /// Row id; `None` until persisted.
  pub detail_id:          Option<i64>,
  pub data:               DetailData,
  /// Optional URI, unique within the owning contact.
  pub detail_uri:         Option<String>,
  pub linked_detail_uris: Vec<String>,
  pub contexts:           Vec<Context>,
  pub access_constraints: AccessConstraints,
  pub provenance:         Option<Provenance>,
  pub modifiable:         bool,
  pub nonexportable:      bool,
  pub change_flags:       ChangeFlags,
}

impl Detail {
  pub fn new(data: DetailData) -> Self {
    Self {
      detail_id:          None,
      data,
      detail_uri:         None,
      linked_detail_uris: Vec::new(),
      contexts:           Vec::new(),
      access_constraints: AccessConstraints::empty(),
      provenance:         None,
      modifiable:         true,
      nonexportable:      false,
      change_flags:       ChangeFlags::empty(),
    }
  }

  pub fn kind(&self) -> DetailKind { self.data.kind() }

  /// True if `other` carries the same information, ignoring engine-injected
  /// envelope fields (ids, provenance, constraints, modifiability, flags).
  pub fn value_equivalent(&self, other: &Detail) -> bool {
    self.data == other.data && self.contexts == other.contexts
  }

  /// Prefix the detail URI and linked URIs for use on an aggregate,
  /// stripping any stale prefix first.
  pub fn apply_aggregate_uri_prefix(&mut self) {
    fn prefixed(uri: &str) -> String {
      let stripped = uri.strip_prefix(AGGREGATE_URI_PREFIX).unwrap_or(uri);
      format!("{AGGREGATE_URI_PREFIX}{stripped}")
    }
    if let Some(uri) = &self.detail_uri {
      self.detail_uri = Some(prefixed(uri));
    }
    self.linked_detail_uris =
      self.linked_detail_uris.iter().map(|u| prefixed(u)).collect();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn provenance_round_trip() {
    let p = Provenance { collection_id: 7, contact_id: 42, detail_id: 1003 };
    assert_eq!(p.encode(), "7:42:1003");
    assert_eq!(Provenance::decode("7:42:1003"), Some(p));
    assert_eq!(Provenance::decode("nonsense"), None);
  }

  #[test]
  fn aggregate_prefix_is_idempotent() {
    let mut d = Detail::new(DetailData::EmailAddress("a@x".into()));
    d.detail_uri = Some("uri-1".into());
    d.apply_aggregate_uri_prefix();
    assert_eq!(d.detail_uri.as_deref(), Some("aggregate:uri-1"));
    d.apply_aggregate_uri_prefix();
    assert_eq!(d.detail_uri.as_deref(), Some("aggregate:uri-1"));
  }

  #[test]
  fn availability_ranks_follow_fixed_order() {
    use PresenceState::*;
    let order = [Available, Away, ExtendedAway, Busy, Hidden, Offline, Unknown];
    for pair in order.windows(2) {
      assert!(pair[0].availability_rank() < pair[1].availability_rank());
    }
  }

  #[test]
  fn value_equivalence_ignores_envelope() {
    let mut a = Detail::new(DetailData::Nickname("Ace".into()));
    let mut b = a.clone();
    b.access_constraints = AccessConstraints::READ_ONLY;
    b.modifiable = false;
    b.provenance =
      Some(Provenance { collection_id: 2, contact_id: 9, detail_id: 1 });
    assert!(a.value_equivalent(&b));

    a.contexts.push(Context::Work);
    assert!(!a.value_equivalent(&b));
  }
}
