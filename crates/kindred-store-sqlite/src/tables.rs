//! The per-detail-type descriptor set: table names, column lists, and the
//! value codecs between [`DetailData`] variants and their table rows.
//!
//! All type-generic detail logic (writing, reading, deleting) is driven off
//! these descriptors; nothing else in the engine enumerates detail columns.

use kindred_core::{
  detail::{
    AddressData, AnniversaryData, AvatarData, BirthdayData, DetailData,
    DetailKind, DisplayLabelData, ExtendedDetailData, FamilyData, Gender,
    GeoLocationData, NameData, OnlineAccountData, OrganizationData,
    PhoneNumberData, PresenceData, PresenceState, RingtoneData, UrlData,
    OriginMetadataData,
  },
  phone::normalize_phone_number,
};
use rusqlite::{types::Value, Row};

use crate::{
  encode::{
    decode_int_list, decode_opt_dt, decode_string_list, encode_int_list,
    encode_opt_dt, encode_string_list, fold_case, fold_case_opt,
  },
  Error, Result,
};

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// The per-type table, or `None` for marker kinds with no table of their
/// own (`Deactivated` lives on the contact row).
pub(crate) fn table_for(kind: DetailKind) -> Option<&'static str> {
  Some(match kind {
    DetailKind::Address => "Addresses",
    DetailKind::Anniversary => "Anniversaries",
    DetailKind::Avatar => "Avatars",
    DetailKind::Birthday => "Birthdays",
    DetailKind::DisplayLabel => "DisplayLabels",
    DetailKind::EmailAddress => "EmailAddresses",
    DetailKind::Family => "Families",
    DetailKind::Favorite => "Favorites",
    DetailKind::Gender => "Genders",
    DetailKind::GeoLocation => "GeoLocations",
    DetailKind::GlobalPresence => "GlobalPresences",
    DetailKind::Guid => "Guids",
    DetailKind::Hobby => "Hobbies",
    DetailKind::Name => "Names",
    DetailKind::Nickname => "Nicknames",
    DetailKind::Note => "Notes",
    DetailKind::OnlineAccount => "OnlineAccounts",
    DetailKind::Organization => "Organizations",
    DetailKind::PhoneNumber => "PhoneNumbers",
    DetailKind::Presence => "Presences",
    DetailKind::Ringtone => "Ringtones",
    DetailKind::SyncTarget => "SyncTargets",
    DetailKind::Tag => "Tags",
    DetailKind::Url => "Urls",
    DetailKind::OriginMetadata => "OriginMetadata",
    DetailKind::ExtendedDetail => "ExtendedDetails",
    DetailKind::Deactivated => return None,
  })
}

/// Value columns, in binding order (after `detailId` and `contactId`).
pub(crate) fn value_columns(kind: DetailKind) -> &'static [&'static str] {
  match kind {
    DetailKind::Address => &[
      "street", "postOfficeBox", "region", "locality", "postCode", "country",
      "subTypes",
    ],
    DetailKind::Anniversary => {
      &["originalDateTime", "calendarId", "subType", "event"]
    }
    DetailKind::Avatar => &["imageUrl", "videoUrl", "avatarMetadata"],
    DetailKind::Birthday => &["birthday", "calendarId"],
    DetailKind::DisplayLabel => {
      &["displayLabel", "displayLabelGroup", "displayLabelGroupSortOrder"]
    }
    DetailKind::EmailAddress => &["emailAddress", "lowerEmailAddress"],
    DetailKind::Family => &["spouse", "children"],
    DetailKind::Favorite => &["isFavorite"],
    DetailKind::Gender => &["gender"],
    DetailKind::GeoLocation => &[
      "label", "latitude", "longitude", "accuracy", "altitude",
      "altitudeAccuracy", "heading", "speed", "timestamp",
    ],
    DetailKind::GlobalPresence | DetailKind::Presence => &[
      "presenceState", "timestamp", "nickname", "customMessage",
      "presenceStateText", "presenceStateImageUrl",
    ],
    DetailKind::Guid => &["guid"],
    DetailKind::Hobby => &["hobby"],
    DetailKind::Name => &[
      "firstName", "lowerFirstName", "lastName", "lowerLastName",
      "middleName", "prefix", "suffix", "customLabel",
    ],
    DetailKind::Nickname => &["nickname", "lowerNickname"],
    DetailKind::Note => &["note"],
    DetailKind::OnlineAccount => &[
      "accountUri", "lowerAccountUri", "protocol", "serviceProvider",
      "capabilities", "subTypes", "accountPath", "accountIconPath", "enabled",
      "accountDisplayName", "serviceProviderDisplayName",
    ],
    DetailKind::Organization => &[
      "name", "role", "title", "location", "department", "logoUrl",
      "assistantName",
    ],
    DetailKind::PhoneNumber => {
      &["phoneNumber", "subTypes", "normalizedNumber"]
    }
    DetailKind::Ringtone => {
      &["audioRingtone", "videoRingtone", "vibrationRingtone"]
    }
    DetailKind::SyncTarget => &["syncTarget"],
    DetailKind::Tag => &["tag"],
    DetailKind::Url => &["url", "subTypes"],
    DetailKind::OriginMetadata => &["id", "groupId", "enabled"],
    DetailKind::ExtendedDetail => &["name", "data"],
    DetailKind::Deactivated => &[],
  }
}

/// `INSERT INTO <table> (detailId, contactId, <cols>) VALUES (...)`.
pub(crate) fn insert_sql(kind: DetailKind) -> Option<String> {
  let table = table_for(kind)?;
  let columns = value_columns(kind);
  let placeholders = (0..columns.len() + 2)
    .map(|i| format!("?{}", i + 1))
    .collect::<Vec<_>>()
    .join(", ");
  Some(format!(
    "INSERT INTO {table} (detailId, contactId, {}) VALUES ({placeholders})",
    columns.join(", ")
  ))
}

/// `SELECT contactId, detailId, <cols> FROM <table> WHERE contactId IN
/// (SELECT contactId FROM <ids_table>) ORDER BY contactId, detailId`.
pub(crate) fn select_sql(kind: DetailKind, ids_table: &str) -> Option<String> {
  let table = table_for(kind)?;
  Some(format!(
    "SELECT contactId, detailId, {} FROM {table}
     WHERE contactId IN (SELECT contactId FROM {ids_table})
     ORDER BY contactId ASC, detailId ASC",
    value_columns(kind).join(", ")
  ))
}

// ─── Binding helpers ─────────────────────────────────────────────────────────

fn text(v: &Option<String>) -> Value {
  match v {
    Some(s) => Value::Text(s.clone()),
    None => Value::Null,
  }
}

fn required_text(v: &str) -> Value { Value::Text(v.to_owned()) }

fn real(v: Option<f64>) -> Value {
  match v {
    Some(r) => Value::Real(r),
    None => Value::Null,
  }
}

fn flag(v: Option<bool>) -> Value {
  match v {
    Some(b) => Value::Integer(b as i64),
    None => Value::Null,
  }
}

fn opt_text(v: Option<String>) -> Value {
  match v {
    Some(s) => Value::Text(s),
    None => Value::Null,
  }
}

/// Numeric enum stored as text, matching the `to_string(int)` convention.
fn numeric_text(v: Option<i32>) -> Value {
  match v {
    Some(n) => Value::Text(n.to_string()),
    None => Value::Null,
  }
}

// ─── DetailData → row values ─────────────────────────────────────────────────

/// Values in [`value_columns`] order. Derived columns (lowercased siblings,
/// the normalised phone number) are computed here so that write paths can
/// never forget them.
pub(crate) fn bind_values(data: &DetailData) -> Result<Vec<Value>> {
  Ok(match data {
    DetailData::Address(a) => vec![
      text(&a.street),
      text(&a.post_office_box),
      text(&a.region),
      text(&a.locality),
      text(&a.post_code),
      text(&a.country),
      opt_text(encode_int_list(&a.sub_types)),
    ],
    DetailData::Anniversary(a) => vec![
      opt_text(encode_opt_dt(a.original_date)),
      text(&a.calendar_id),
      numeric_text(a.sub_type),
      text(&a.event),
    ],
    DetailData::Avatar(a) => {
      vec![text(&a.image_url), text(&a.video_url), text(&a.metadata)]
    }
    DetailData::Birthday(b) => {
      vec![opt_text(encode_opt_dt(b.date)), text(&b.calendar_id)]
    }
    DetailData::DisplayLabel(d) => vec![
      required_text(&d.label),
      text(&d.group),
      match d.group_sort_order {
        Some(v) => Value::Integer(v),
        None => Value::Null,
      },
    ],
    DetailData::EmailAddress(address) => vec![
      required_text(address),
      Value::Text(fold_case(address)),
    ],
    DetailData::Family(f) => vec![
      text(&f.spouse),
      opt_text(encode_string_list(&f.children)?),
    ],
    DetailData::Favorite(favorite) => vec![Value::Integer(*favorite as i64)],
    DetailData::Gender(gender) => {
      vec![Value::Text(gender.to_int().to_string())]
    }
    DetailData::GeoLocation(g) => vec![
      text(&g.label),
      real(g.latitude),
      real(g.longitude),
      real(g.accuracy),
      real(g.altitude),
      real(g.altitude_accuracy),
      real(g.heading),
      real(g.speed),
      opt_text(encode_opt_dt(g.timestamp)),
    ],
    DetailData::GlobalPresence(p) | DetailData::Presence(p) => vec![
      Value::Integer(p.state.to_int() as i64),
      opt_text(encode_opt_dt(p.timestamp)),
      text(&p.nickname),
      text(&p.custom_message),
      text(&p.state_text),
      text(&p.state_image_url),
    ],
    DetailData::Guid(guid) => vec![required_text(guid)],
    DetailData::Hobby(hobby) => vec![required_text(hobby)],
    DetailData::Name(n) => vec![
      text(&n.first),
      opt_text(fold_case_opt(n.first.as_deref())),
      text(&n.last),
      opt_text(fold_case_opt(n.last.as_deref())),
      text(&n.middle),
      text(&n.prefix),
      text(&n.suffix),
      text(&n.custom_label),
    ],
    DetailData::Nickname(nickname) => {
      vec![required_text(nickname), Value::Text(fold_case(nickname))]
    }
    DetailData::Note(note) => vec![required_text(note)],
    DetailData::OnlineAccount(a) => vec![
      required_text(&a.account_uri),
      Value::Text(fold_case(&a.account_uri)),
      numeric_text(a.protocol),
      text(&a.service_provider),
      opt_text(encode_string_list(&a.capabilities)?),
      opt_text(encode_int_list(&a.sub_types)),
      text(&a.account_path),
      text(&a.account_icon_path),
      flag(a.enabled),
      text(&a.account_display_name),
      text(&a.service_provider_display_name),
    ],
    DetailData::Organization(o) => vec![
      text(&o.name),
      text(&o.role),
      text(&o.title),
      text(&o.location),
      text(&o.department),
      text(&o.logo_url),
      text(&o.assistant_name),
    ],
    DetailData::PhoneNumber(p) => vec![
      required_text(&p.number),
      opt_text(encode_int_list(&p.sub_types)),
      Value::Text(normalize_phone_number(&p.number)),
    ],
    DetailData::Ringtone(r) => {
      vec![text(&r.audio), text(&r.video), text(&r.vibration)]
    }
    DetailData::SyncTarget(target) => vec![required_text(target)],
    DetailData::Tag(tag) => vec![required_text(tag)],
    DetailData::Url(u) => {
      vec![required_text(&u.url), numeric_text(u.sub_type)]
    }
    DetailData::OriginMetadata(m) => {
      vec![text(&m.id), text(&m.group_id), flag(m.enabled)]
    }
    DetailData::ExtendedDetail(x) => vec![
      required_text(&x.name),
      Value::Text(serde_json::to_string(&x.data)?),
    ],
    DetailData::Deactivated => Vec::new(),
  })
}

// ─── Row values → DetailData ─────────────────────────────────────────────────

/// Decode the value columns of a per-type row back into a [`DetailData`].
/// `offset` is the index of the first value column in `row`.
pub(crate) fn read_data(
  kind: DetailKind,
  row: &Row<'_>,
  offset: usize,
) -> Result<DetailData> {
  let o = offset;
  Ok(match kind {
    DetailKind::Address => DetailData::Address(AddressData {
      street:          row.get(o)?,
      post_office_box: row.get(o + 1)?,
      region:          row.get(o + 2)?,
      locality:        row.get(o + 3)?,
      post_code:       row.get(o + 4)?,
      country:         row.get(o + 5)?,
      sub_types:       decode_int_list(row.get(o + 6)?),
    }),
    DetailKind::Anniversary => DetailData::Anniversary(AnniversaryData {
      original_date: decode_opt_dt(row.get(o)?)?,
      calendar_id:   row.get(o + 1)?,
      sub_type:      parse_numeric_text(row.get(o + 2)?),
      event:         row.get(o + 3)?,
    }),
    DetailKind::Avatar => DetailData::Avatar(AvatarData {
      image_url: row.get(o)?,
      video_url: row.get(o + 1)?,
      metadata:  row.get(o + 2)?,
    }),
    DetailKind::Birthday => DetailData::Birthday(BirthdayData {
      date:        decode_opt_dt(row.get(o)?)?,
      calendar_id: row.get(o + 1)?,
    }),
    DetailKind::DisplayLabel => DetailData::DisplayLabel(DisplayLabelData {
      label:            row.get::<_, Option<String>>(o)?.unwrap_or_default(),
      group:            row.get(o + 1)?,
      group_sort_order: row.get(o + 2)?,
    }),
    DetailKind::EmailAddress => {
      DetailData::EmailAddress(row.get::<_, Option<String>>(o)?.unwrap_or_default())
    }
    DetailKind::Family => DetailData::Family(FamilyData {
      spouse:   row.get(o)?,
      children: decode_string_list(row.get(o + 1)?)?,
    }),
    DetailKind::Favorite => {
      DetailData::Favorite(row.get::<_, Option<bool>>(o)?.unwrap_or(false))
    }
    DetailKind::Gender => DetailData::Gender(
      parse_numeric_text(row.get(o)?)
        .map(Gender::from_int)
        .unwrap_or_default(),
    ),
    DetailKind::GeoLocation => DetailData::GeoLocation(GeoLocationData {
      label:             row.get(o)?,
      latitude:          row.get(o + 1)?,
      longitude:         row.get(o + 2)?,
      accuracy:          row.get(o + 3)?,
      altitude:          row.get(o + 4)?,
      altitude_accuracy: row.get(o + 5)?,
      heading:           row.get(o + 6)?,
      speed:             row.get(o + 7)?,
      timestamp:         decode_opt_dt(row.get(o + 8)?)?,
    }),
    DetailKind::GlobalPresence | DetailKind::Presence => {
      let presence = PresenceData {
        state:           PresenceState::from_int(
          row.get::<_, Option<i64>>(o)?.unwrap_or(0) as i32,
        ),
        timestamp:       decode_opt_dt(row.get(o + 1)?)?,
        nickname:        row.get(o + 2)?,
        custom_message:  row.get(o + 3)?,
        state_text:      row.get(o + 4)?,
        state_image_url: row.get(o + 5)?,
      };
      if kind == DetailKind::GlobalPresence {
        DetailData::GlobalPresence(presence)
      } else {
        DetailData::Presence(presence)
      }
    }
    DetailKind::Guid => {
      DetailData::Guid(row.get::<_, Option<String>>(o)?.unwrap_or_default())
    }
    DetailKind::Hobby => {
      DetailData::Hobby(row.get::<_, Option<String>>(o)?.unwrap_or_default())
    }
    DetailKind::Name => DetailData::Name(NameData {
      first:        row.get(o)?,
      last:         row.get(o + 2)?,
      middle:       row.get(o + 4)?,
      prefix:       row.get(o + 5)?,
      suffix:       row.get(o + 6)?,
      custom_label: row.get(o + 7)?,
    }),
    DetailKind::Nickname => {
      DetailData::Nickname(row.get::<_, Option<String>>(o)?.unwrap_or_default())
    }
    DetailKind::Note => {
      DetailData::Note(row.get::<_, Option<String>>(o)?.unwrap_or_default())
    }
    DetailKind::OnlineAccount => DetailData::OnlineAccount(OnlineAccountData {
      account_uri:                   row
        .get::<_, Option<String>>(o)?
        .unwrap_or_default(),
      protocol:                      parse_numeric_text(row.get(o + 2)?),
      service_provider:              row.get(o + 3)?,
      capabilities:                  decode_string_list(row.get(o + 4)?)?,
      sub_types:                     decode_int_list(row.get(o + 5)?),
      account_path:                  row.get(o + 6)?,
      account_icon_path:             row.get(o + 7)?,
      enabled:                       row.get(o + 8)?,
      account_display_name:          row.get(o + 9)?,
      service_provider_display_name: row.get(o + 10)?,
    }),
    DetailKind::Organization => DetailData::Organization(OrganizationData {
      name:           row.get(o)?,
      role:           row.get(o + 1)?,
      title:          row.get(o + 2)?,
      location:       row.get(o + 3)?,
      department:     row.get(o + 4)?,
      logo_url:       row.get(o + 5)?,
      assistant_name: row.get(o + 6)?,
    }),
    DetailKind::PhoneNumber => DetailData::PhoneNumber(PhoneNumberData {
      number:     row.get::<_, Option<String>>(o)?.unwrap_or_default(),
      sub_types:  decode_int_list(row.get(o + 1)?),
      normalized: row.get(o + 2)?,
    }),
    DetailKind::Ringtone => DetailData::Ringtone(RingtoneData {
      audio:     row.get(o)?,
      video:     row.get(o + 1)?,
      vibration: row.get(o + 2)?,
    }),
    DetailKind::SyncTarget => DetailData::SyncTarget(
      row.get::<_, Option<String>>(o)?.unwrap_or_default(),
    ),
    DetailKind::Tag => {
      DetailData::Tag(row.get::<_, Option<String>>(o)?.unwrap_or_default())
    }
    DetailKind::Url => DetailData::Url(UrlData {
      url:      row.get::<_, Option<String>>(o)?.unwrap_or_default(),
      sub_type: parse_numeric_text(row.get(o + 1)?),
    }),
    DetailKind::OriginMetadata => {
      DetailData::OriginMetadata(OriginMetadataData {
        id:       row.get(o)?,
        group_id: row.get(o + 1)?,
        enabled:  row.get(o + 2)?,
      })
    }
    DetailKind::ExtendedDetail => {
      let name: Option<String> = row.get(o)?;
      let raw: Option<String> = row.get(o + 1)?;
      DetailData::ExtendedDetail(ExtendedDetailData {
        name: name.unwrap_or_default(),
        data: match raw {
          Some(raw) => serde_json::from_str(&raw)?,
          None => serde_json::Value::Null,
        },
      })
    }
    DetailKind::Deactivated => {
      return Err(Error::Schema("Deactivated has no table".into()));
    }
  })
}

fn parse_numeric_text(s: Option<String>) -> Option<i32> {
  s.as_deref().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_tabled_kind_has_columns_and_sql() {
    for kind in DetailKind::ALL {
      if kind == DetailKind::Deactivated {
        assert!(table_for(kind).is_none());
        continue;
      }
      assert!(table_for(kind).is_some(), "{kind:?}");
      assert!(!value_columns(kind).is_empty(), "{kind:?}");
      let sql = insert_sql(kind).unwrap();
      assert!(sql.contains(table_for(kind).unwrap()));
    }
  }

  #[test]
  fn bind_values_match_column_counts() {
    let samples = [
      DetailData::EmailAddress("A@Example.com".into()),
      DetailData::PhoneNumber(PhoneNumberData {
        number: "+1 555 0100".into(),
        ..Default::default()
      }),
      DetailData::Name(NameData {
        first: Some("Ada".into()),
        last: Some("Lovelace".into()),
        ..Default::default()
      }),
      DetailData::Favorite(true),
      DetailData::Gender(Gender::Female),
    ];
    for data in samples {
      let values = bind_values(&data).unwrap();
      assert_eq!(values.len(), value_columns(data.kind()).len(), "{data:?}");
    }
  }

  #[test]
  fn phone_binding_normalises() {
    let values = bind_values(&DetailData::PhoneNumber(PhoneNumberData {
      number: "+1 (555) 010-0199".into(),
      ..Default::default()
    }))
    .unwrap();
    assert_eq!(values[2], Value::Text("+15550100199".into()));
  }

  #[test]
  fn email_binding_folds_case() {
    let values =
      bind_values(&DetailData::EmailAddress("A@Example.com".into())).unwrap();
    assert_eq!(values[1], Value::Text("a@example.com".into()));
  }
}
