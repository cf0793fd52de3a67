//! Translate a filter tree and sort orders into a single parameterised SQL
//! statement: a WHERE fragment with bindings, sort joins, and an ORDER BY.
//!
//! Large id filters (over [`MAX_INLINE_IDS`] bound parameters) spill to a
//! transient temp table; oversize collection filters are refused. Filters
//! referencing overlay data (presence, modification time) flag the need for
//! the transient temp tables so the reader populates them first.

use kindred_core::{
  detail::DetailKind,
  filter::{
    BlankPolicy, ChangeLogEvent, DetailFilter, DetailRangeFilter, Field,
    Filter, FilterValue, MatchFlags, RangeFlags, RelationshipRole, SortDirection,
    SortOrder,
  },
  flags::StatusFlags,
  phone::normalize_phone_number,
};
use rusqlite::{types::Value, Connection};

use crate::{
  db::{create_transient_id_table, DbCtx},
  encode::{encode_dt, fold_case},
  tables,
  Error, Result,
};

/// Ids above this count cannot be bound inline.
pub(crate) const MAX_INLINE_IDS: usize = 800;

fn unsupported() -> Error { Error::Engine(kindred_core::Error::Unspecified) }

// ─── Compiled output ─────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct CompiledWhere {
  /// WHERE fragment without the keyword; empty matches everything.
  pub fragment:        String,
  pub bindings:        Vec<Value>,
  pub needs_timestamp: bool,
  pub needs_presence:  bool,
  // Facts about the filter used to suppress default visibility constraints.
  pub references_self:       bool,
  pub has_id_filter:         bool,
  pub has_collection_filter: bool,
  pub tests_deactivated:     bool,
  pub tests_deleted:         bool,
}

pub(crate) struct CompiledOrder {
  pub order_by:        String,
  /// Detail tables that must be LEFT JOINed for sort expressions.
  pub joins:           Vec<&'static str>,
  pub needs_timestamp: bool,
  pub needs_presence:  bool,
}

impl CompiledWhere {
  fn merge_flags(&mut self, other: &CompiledWhere) {
    self.needs_timestamp |= other.needs_timestamp;
    self.needs_presence |= other.needs_presence;
    self.references_self |= other.references_self;
    self.has_id_filter |= other.has_id_filter;
    self.has_collection_filter |= other.has_collection_filter;
    self.tests_deactivated |= other.tests_deactivated;
    self.tests_deleted |= other.tests_deleted;
  }
}

/// Wrap the compiled user filter with the default visibility constraints,
/// each suppressed when the filter already speaks to it.
pub(crate) fn apply_default_constraints(compiled: &CompiledWhere) -> String {
  let mut clauses: Vec<String> = Vec::new();
  if !compiled.fragment.is_empty() {
    clauses.push(format!("({})", compiled.fragment));
  }
  if !compiled.references_self {
    clauses.push("Contacts.contactId > 2".to_owned());
  }
  if !compiled.has_collection_filter && !compiled.has_id_filter {
    clauses.push("Contacts.collectionId = 1".to_owned());
  }
  if !compiled.tests_deactivated {
    clauses.push("Contacts.isDeactivated = 0".to_owned());
  }
  if !compiled.tests_deleted {
    clauses.push("Contacts.changeFlags < 4".to_owned());
  }
  clauses.join(" AND ")
}

// ─── Field information ───────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum FieldType {
  Text,
  /// Text compared and sorted with locale awareness.
  LocalizedText,
  /// Enum stored as numeric text.
  NumericText,
  /// `;`-joined numeric text list; equality means containment.
  SubTypes,
  Integer,
  Boolean,
  Real,
  Date,
}

struct FieldInfo {
  column:       &'static str,
  lower_column: Option<&'static str>,
  field_type:   FieldType,
}

fn field_info(field: Field) -> Result<FieldInfo> {
  use Field::*;
  use FieldType::*;
  let (column, lower_column, field_type) = match field {
    AddressStreet => ("street", None, LocalizedText),
    AddressPostOfficeBox => ("postOfficeBox", None, Text),
    AddressRegion => ("region", None, LocalizedText),
    AddressLocality => ("locality", None, LocalizedText),
    AddressPostCode => ("postCode", None, Text),
    AddressCountry => ("country", None, LocalizedText),
    AddressSubTypes => ("subTypes", None, SubTypes),
    AnniversaryDate => ("originalDateTime", None, Date),
    AnniversaryCalendarId => ("calendarId", None, Text),
    AnniversarySubType => ("subType", None, NumericText),
    AnniversaryEvent => ("event", None, Text),
    AvatarImageUrl => ("imageUrl", None, Text),
    AvatarVideoUrl => ("videoUrl", None, Text),
    AvatarMetadata => ("avatarMetadata", None, Text),
    BirthdayDate => ("birthday", None, Date),
    BirthdayCalendarId => ("calendarId", None, Text),
    DisplayLabel => ("displayLabel", None, LocalizedText),
    DisplayLabelGroup => ("displayLabelGroup", None, Text),
    DisplayLabelGroupSortOrder => {
      ("displayLabelGroupSortOrder", None, Integer)
    }
    EmailAddress => ("emailAddress", Some("lowerEmailAddress"), Text),
    FamilySpouse => ("spouse", None, Text),
    FamilyChildren => ("children", None, Text),
    Favorite => ("isFavorite", None, Boolean),
    Gender => ("gender", None, NumericText),
    GeoLabel => ("label", None, Text),
    GeoLatitude => ("latitude", None, Real),
    GeoLongitude => ("longitude", None, Real),
    GeoAccuracy => ("accuracy", None, Real),
    GeoAltitude => ("altitude", None, Real),
    GeoTimestamp => ("timestamp", None, Date),
    GlobalPresenceState => ("presenceState", None, Integer),
    GlobalPresenceNickname => ("nickname", None, Text),
    GlobalPresenceCustomMessage => ("customMessage", None, Text),
    Guid => ("guid", None, Text),
    Hobby => ("hobby", None, Text),
    NameFirst => ("firstName", Some("lowerFirstName"), LocalizedText),
    NameLast => ("lastName", Some("lowerLastName"), LocalizedText),
    NameMiddle => ("middleName", None, LocalizedText),
    NamePrefix => ("prefix", None, LocalizedText),
    NameSuffix => ("suffix", None, LocalizedText),
    NameCustomLabel => ("customLabel", None, LocalizedText),
    Nickname => ("nickname", Some("lowerNickname"), LocalizedText),
    Note => ("note", None, Text),
    OnlineAccountUri => ("accountUri", Some("lowerAccountUri"), Text),
    OnlineAccountProtocol => ("protocol", None, NumericText),
    OnlineAccountServiceProvider => ("serviceProvider", None, Text),
    OnlineAccountSubTypes => ("subTypes", None, SubTypes),
    OrganizationName => ("name", None, LocalizedText),
    OrganizationRole => ("role", None, Text),
    OrganizationTitle => ("title", None, Text),
    OrganizationLocation => ("location", None, Text),
    OrganizationDepartment => ("department", None, Text),
    PhoneNumber => ("phoneNumber", None, Text),
    PhoneSubTypes => ("subTypes", None, SubTypes),
    PresenceState => ("presenceState", None, Integer),
    PresenceNickname => ("nickname", None, Text),
    PresenceCustomMessage => ("customMessage", None, Text),
    PresenceTimestamp => ("timestamp", None, Date),
    RingtoneAudio => ("audioRingtone", None, Text),
    RingtoneVideo => ("videoRingtone", None, Text),
    SyncTarget => ("syncTarget", None, Text),
    Tag => ("tag", None, Text),
    Url => ("url", None, Text),
    UrlSubType => ("subTypes", None, NumericText),
    OriginMetadataId => ("id", None, Text),
    OriginMetadataGroupId => ("groupId", None, Text),
    OriginMetadataEnabled => ("enabled", None, Boolean),
    ExtendedDetailName => ("name", None, Text),
    TimestampCreated => ("created", None, Date),
    TimestampModified => ("modified", None, Date),
    ContactType => ("type", None, Integer),
    StatusFlags => return Err(unsupported()),
  };
  Ok(FieldInfo { column, lower_column, field_type })
}

// ─── Filter compilation ──────────────────────────────────────────────────────

pub(crate) fn compile_filter(
  conn: &Connection,
  ctx: &DbCtx,
  filter: &Filter,
) -> Result<CompiledWhere> {
  let compiled = compile_node(conn, ctx, filter)?;
  ctx.trace_filter(&compiled.fragment);
  Ok(compiled)
}

fn compile_node(
  conn: &Connection,
  ctx: &DbCtx,
  filter: &Filter,
) -> Result<CompiledWhere> {
  match filter {
    Filter::Default => Ok(CompiledWhere::default()),
    Filter::DetailExists(kind) => compile_detail_exists(*kind),
    Filter::Detail(detail) => compile_detail(detail),
    Filter::DetailRange(range) => compile_range(range),
    Filter::Ids(ids) => compile_ids(conn, ids),
    Filter::Collections(ids) => compile_collections(ids),
    Filter::ChangeLog { since, event } => compile_changelog(*since, *event),
    Filter::Relationship { rel_type, contact_id, role } => {
      Ok(compile_relationship(rel_type.as_ref(), *contact_id, *role))
    }
    Filter::Union(children) => {
      let mut out = CompiledWhere::default();
      let mut fragments = Vec::new();
      for child in children {
        let compiled = compile_node(conn, ctx, child)?;
        out.merge_flags(&compiled);
        if !compiled.fragment.is_empty() {
          fragments.push(format!("({})", compiled.fragment));
          out.bindings.extend(compiled.bindings);
        }
      }
      out.fragment = fragments.join(" OR ");
      Ok(out)
    }
    Filter::Intersection(children) => {
      let mut out = CompiledWhere::default();
      let mut fragments = Vec::new();
      for child in children {
        // A Default child is permissive; it contributes nothing.
        if matches!(child, Filter::Default) {
          continue;
        }
        let compiled = compile_node(conn, ctx, child)?;
        out.merge_flags(&compiled);
        if !compiled.fragment.is_empty() {
          fragments.push(format!("({})", compiled.fragment));
          out.bindings.extend(compiled.bindings);
        }
      }
      out.fragment = fragments.join(" AND ");
      Ok(out)
    }
  }
}

fn compile_detail_exists(kind: DetailKind) -> Result<CompiledWhere> {
  if kind == DetailKind::Deactivated {
    return Ok(CompiledWhere {
      fragment: "Contacts.isDeactivated = 1".to_owned(),
      tests_deactivated: true,
      ..Default::default()
    });
  }
  let table = tables::table_for(kind).ok_or_else(unsupported)?;
  Ok(CompiledWhere {
    fragment: format!(
      "EXISTS (SELECT 1 FROM {table} WHERE {table}.contactId = Contacts.contactId)"
    ),
    ..Default::default()
  })
}

fn compile_detail(filter: &DetailFilter) -> Result<CompiledWhere> {
  if filter.match_flags.contains(MatchFlags::KEYPAD_COLLATION) {
    return Err(unsupported());
  }
  if filter.field == Field::StatusFlags {
    return compile_status_flags(filter);
  }

  let info = field_info(filter.field)?;
  let mut out = CompiledWhere::default();

  // Contact-row pseudo-details compare against Contacts columns directly.
  if filter.field.kind().is_none() {
    let expr = match filter.field {
      Field::TimestampModified => {
        out.needs_timestamp = true;
        "COALESCE(temp.Timestamps.modified, Contacts.modified)".to_owned()
      }
      _ => format!("Contacts.{}", info.column),
    };
    let (pred, bindings) = comparison(&expr, None, &info, filter)?;
    out.fragment = pred;
    out.bindings = bindings;
    return Ok(out);
  }

  let kind = filter.field.kind().ok_or_else(unsupported)?;
  let table = tables::table_for(kind).ok_or_else(unsupported)?;

  // Phone-number matching has a dedicated flag and column.
  if filter.match_flags.contains(MatchFlags::PHONE_NUMBER)
    && filter.field == Field::PhoneNumber
  {
    return compile_phone(table, filter);
  }

  let column_expr = format!("{table}.{}", info.column);
  let lower_expr = info.lower_column.map(|c| format!("{table}.{c}"));
  let (pred, bindings) =
    comparison(&column_expr, lower_expr.as_deref(), &info, filter)?;

  out.fragment = format!(
    "Contacts.contactId IN (SELECT {table}.contactId FROM {table} WHERE {pred})"
  );
  out.bindings = bindings;
  Ok(out)
}

/// Build `<expr> <op> ?` for a detail filter, honouring match flags.
fn comparison(
  column: &str,
  lower_column: Option<&str>,
  info: &FieldInfo,
  filter: &DetailFilter,
) -> Result<(String, Vec<Value>)> {
  let Some(value) = &filter.value else {
    // Presence-of-value test.
    return Ok((format!("{column} IS NOT NULL"), Vec::new()));
  };

  match info.field_type {
    FieldType::Text | FieldType::LocalizedText => {
      let FilterValue::Text(text) = value else {
        return Err(unsupported());
      };
      text_comparison(column, lower_column, text, filter.match_flags)
    }
    FieldType::NumericText => {
      let FilterValue::Integer(int) = value else {
        return Err(unsupported());
      };
      Ok((
        format!("{column} = ?"),
        vec![Value::Text(int.to_string())],
      ))
    }
    FieldType::SubTypes => {
      let FilterValue::Integer(int) = value else {
        return Err(unsupported());
      };
      Ok((
        format!("(';' || COALESCE({column}, '') || ';') LIKE ?"),
        vec![Value::Text(format!("%;{int};%"))],
      ))
    }
    FieldType::Integer => {
      let FilterValue::Integer(int) = value else {
        return Err(unsupported());
      };
      Ok((format!("{column} = ?"), vec![Value::Integer(*int)]))
    }
    FieldType::Boolean => {
      let FilterValue::Boolean(b) = value else {
        return Err(unsupported());
      };
      Ok((format!("{column} = ?"), vec![Value::Integer(*b as i64)]))
    }
    FieldType::Real => {
      let FilterValue::Real(r) = value else {
        return Err(unsupported());
      };
      Ok((format!("{column} = ?"), vec![Value::Real(*r)]))
    }
    FieldType::Date => {
      let FilterValue::Date(dt) = value else {
        return Err(unsupported());
      };
      Ok((format!("{column} = ?"), vec![Value::Text(encode_dt(*dt))]))
    }
  }
}

/// GLOB metacharacters are escaped so bound values match literally.
fn escape_glob(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  for ch in text.chars() {
    match ch {
      '*' | '?' | '[' | ']' => {
        out.push('[');
        out.push(ch);
        out.push(']');
      }
      _ => out.push(ch),
    }
  }
  out
}

fn text_comparison(
  column: &str,
  lower_column: Option<&str>,
  text: &str,
  flags: MatchFlags,
) -> Result<(String, Vec<Value>)> {
  let case_sensitive = flags.contains(MatchFlags::CASE_SENSITIVE);
  let shape = flags.glob_shape();

  // Case-insensitive matching prefers the precomputed lowercased sibling
  // column; otherwise the column is wrapped in lower().
  let (expr, needle) = if case_sensitive {
    (column.to_owned(), text.to_owned())
  } else if let Some(lower) = lower_column {
    (lower.to_owned(), fold_case(text))
  } else {
    (format!("lower({column})"), fold_case(text))
  };

  if shape.contains(MatchFlags::STARTS_WITH) {
    Ok((
      format!("{expr} GLOB ?"),
      vec![Value::Text(format!("{}*", escape_glob(&needle)))],
    ))
  } else if shape.contains(MatchFlags::CONTAINS) {
    Ok((
      format!("{expr} GLOB ?"),
      vec![Value::Text(format!("*{}*", escape_glob(&needle)))],
    ))
  } else if shape.contains(MatchFlags::ENDS_WITH) {
    Ok((
      format!("{expr} GLOB ?"),
      vec![Value::Text(format!("*{}", escape_glob(&needle)))],
    ))
  } else if needle.is_empty() {
    Ok((format!("COALESCE({expr}, '') = ''"), Vec::new()))
  } else {
    Ok((format!("{expr} = ?"), vec![Value::Text(needle)]))
  }
}

/// Strip dialling punctuation from a column expression at query time.
fn stripped_phone_expr(column: &str) -> String {
  let mut expr = format!("COALESCE({column}, '')");
  for ch in ["+", "-", " ", "#", "(", ")"] {
    expr = format!("replace({expr}, '{ch}', '')");
  }
  expr
}

fn compile_phone(table: &str, filter: &DetailFilter) -> Result<CompiledWhere> {
  let Some(FilterValue::Text(text)) = &filter.value else {
    return Err(unsupported());
  };

  let shape = filter.match_flags.glob_shape();
  let (pred, bindings) = if shape.is_empty() {
    // Equality semantics: compare normalised forms. An unparseable bound
    // value is a compile failure.
    let normalized = normalize_phone_number(text);
    if normalized.is_empty() {
      return Err(unsupported());
    }
    (
      format!("{table}.normalizedNumber = ?"),
      vec![Value::Text(normalized)],
    )
  } else {
    let expr = stripped_phone_expr(&format!("{table}.phoneNumber"));
    let stripped: String = text
      .chars()
      .filter(|c| !matches!(c, '+' | '-' | ' ' | '#' | '(' | ')'))
      .collect();
    let escaped = escape_glob(&stripped);
    let pattern = if shape.contains(MatchFlags::STARTS_WITH) {
      format!("{escaped}*")
    } else if shape.contains(MatchFlags::ENDS_WITH) {
      format!("*{escaped}")
    } else {
      format!("*{escaped}*")
    };
    (format!("{expr} GLOB ?"), vec![Value::Text(pattern)])
  };

  Ok(CompiledWhere {
    fragment: format!(
      "Contacts.contactId IN (SELECT {table}.contactId FROM {table} WHERE {pred})"
    ),
    bindings,
    ..Default::default()
  })
}

fn compile_status_flags(filter: &DetailFilter) -> Result<CompiledWhere> {
  let Some(FilterValue::Integer(bits)) = &filter.value else {
    return Err(unsupported());
  };
  let wanted = StatusFlags::from_bits_truncate(*bits as u32);

  let mut out = CompiledWhere::default();
  let mut clauses: Vec<String> = Vec::new();

  if wanted.contains(StatusFlags::HAS_PHONE_NUMBER) {
    clauses.push("Contacts.hasPhoneNumber = 1".to_owned());
  }
  if wanted.contains(StatusFlags::HAS_EMAIL_ADDRESS) {
    clauses.push("Contacts.hasEmailAddress = 1".to_owned());
  }
  if wanted.contains(StatusFlags::HAS_ONLINE_ACCOUNT) {
    clauses.push("Contacts.hasOnlineAccount = 1".to_owned());
  }
  if wanted.contains(StatusFlags::IS_ONLINE) {
    out.needs_presence = true;
    clauses.push(
      "COALESCE(temp.GlobalPresenceStates.isOnline, Contacts.isOnline) = 1"
        .to_owned(),
    );
  }
  if wanted.contains(StatusFlags::IS_DEACTIVATED) {
    out.tests_deactivated = true;
    clauses.push("Contacts.isDeactivated = 1".to_owned());
  }
  if wanted.contains(StatusFlags::IS_ADDED) {
    clauses.push("(Contacts.changeFlags & 1) != 0".to_owned());
  }
  if wanted.contains(StatusFlags::IS_MODIFIED) {
    clauses.push("(Contacts.changeFlags & 2) != 0".to_owned());
  }
  if wanted.contains(StatusFlags::IS_DELETED) {
    out.tests_deleted = true;
    clauses.push("(Contacts.changeFlags & 4) != 0".to_owned());
  }

  if clauses.is_empty() {
    return Err(unsupported());
  }
  out.fragment = clauses.join(" AND ");
  Ok(out)
}

fn compile_range(range: &DetailRangeFilter) -> Result<CompiledWhere> {
  let info = field_info(range.field)?;
  let mut out = CompiledWhere::default();

  let column_expr = if let Some(kind) = range.field.kind() {
    let table = tables::table_for(kind).ok_or_else(unsupported)?;
    format!("{table}.{}", info.column)
  } else if range.field == Field::TimestampModified {
    out.needs_timestamp = true;
    "COALESCE(temp.Timestamps.modified, Contacts.modified)".to_owned()
  } else {
    format!("Contacts.{}", info.column)
  };

  let mut clauses = Vec::new();
  let mut bindings = Vec::new();
  if let Some(min) = &range.min {
    let op = if range.flags.contains(RangeFlags::EXCLUDE_LOWER) {
      ">"
    } else {
      ">="
    };
    clauses.push(format!("{column_expr} {op} ?"));
    bindings.push(range_value(min));
  }
  if let Some(max) = &range.max {
    let op = if range.flags.contains(RangeFlags::INCLUDE_UPPER) {
      "<="
    } else {
      "<"
    };
    clauses.push(format!("{column_expr} {op} ?"));
    bindings.push(range_value(max));
  }
  if clauses.is_empty() {
    clauses.push(format!("{column_expr} IS NOT NULL"));
  }

  let pred = clauses.join(" AND ");
  match range.field.kind() {
    Some(kind) => {
      let table = tables::table_for(kind).ok_or_else(unsupported)?;
      out.fragment = format!(
        "Contacts.contactId IN (SELECT {table}.contactId FROM {table} WHERE {pred})"
      );
    }
    None => out.fragment = pred,
  }
  out.bindings = bindings;
  Ok(out)
}

fn range_value(value: &FilterValue) -> Value {
  match value {
    FilterValue::Text(s) => Value::Text(s.clone()),
    FilterValue::Integer(i) => Value::Integer(*i),
    FilterValue::Real(r) => Value::Real(*r),
    FilterValue::Boolean(b) => Value::Integer(*b as i64),
    FilterValue::Date(dt) => Value::Text(encode_dt(*dt)),
  }
}

fn compile_ids(conn: &Connection, ids: &[i64]) -> Result<CompiledWhere> {
  let mut out = CompiledWhere {
    has_id_filter: true,
    references_self: ids.iter().any(|id| *id <= 2),
    ..Default::default()
  };

  if ids.len() <= MAX_INLINE_IDS {
    let placeholders = vec!["?"; ids.len()].join(", ");
    out.fragment = format!("Contacts.contactId IN ({placeholders})");
    out.bindings = ids.iter().map(|id| Value::Integer(*id)).collect();
  } else {
    let table = create_transient_id_table(conn, "filterIds", ids)?;
    out.fragment =
      format!("Contacts.contactId IN (SELECT contactId FROM {table})");
  }
  Ok(out)
}

fn compile_collections(ids: &[i64]) -> Result<CompiledWhere> {
  if ids.len() > MAX_INLINE_IDS {
    return Err(unsupported());
  }
  let placeholders = vec!["?"; ids.len()].join(", ");
  Ok(CompiledWhere {
    fragment: format!("Contacts.collectionId IN ({placeholders})"),
    bindings: ids.iter().map(|id| Value::Integer(*id)).collect(),
    has_collection_filter: true,
    ..Default::default()
  })
}

fn compile_changelog(
  since: chrono::DateTime<chrono::Utc>,
  event: ChangeLogEvent,
) -> Result<CompiledWhere> {
  let mut out = CompiledWhere::default();
  match event {
    ChangeLogEvent::Added => {
      out.fragment = "Contacts.created >= ?".to_owned();
    }
    ChangeLogEvent::Changed => {
      out.needs_timestamp = true;
      out.fragment =
        "COALESCE(temp.Timestamps.modified, Contacts.modified) >= ?".to_owned();
    }
    // Removed contacts are answered from the tombstone path
    // (read_deleted_contact_ids), not from a live-contact query.
    ChangeLogEvent::Removed => return Err(unsupported()),
  }
  out.bindings.push(Value::Text(encode_dt(since)));
  Ok(out)
}

fn compile_relationship(
  rel_type: Option<&kindred_core::relationship::RelationshipType>,
  contact_id: Option<i64>,
  role: RelationshipRole,
) -> CompiledWhere {
  let mut out = CompiledWhere::default();

  let subquery = |selected: &str, other: &str| {
    let mut sql = format!(
      "SELECT Relationships.{selected} FROM Relationships
       INNER JOIN Contacts AS Related ON Related.contactId = Relationships.{other}
       WHERE Related.changeFlags < 4"
    );
    if rel_type.is_some() {
      sql.push_str(" AND Relationships.type = ?");
    }
    if contact_id.is_some() {
      sql.push_str(&format!(" AND Relationships.{other} = ?"));
    }
    sql
  };

  let push_bindings = |out: &mut CompiledWhere| {
    if let Some(t) = rel_type {
      out.bindings.push(Value::Text(t.as_str().to_owned()));
    }
    if let Some(id) = contact_id {
      out.bindings.push(Value::Integer(id));
    }
  };

  match role {
    RelationshipRole::First => {
      out.fragment = format!(
        "Contacts.contactId IN ({})",
        subquery("firstId", "secondId")
      );
      push_bindings(&mut out);
    }
    RelationshipRole::Second => {
      out.fragment = format!(
        "Contacts.contactId IN ({})",
        subquery("secondId", "firstId")
      );
      push_bindings(&mut out);
    }
    RelationshipRole::Either => {
      out.fragment = format!(
        "(Contacts.contactId IN ({}) OR Contacts.contactId IN ({}))",
        subquery("firstId", "secondId"),
        subquery("secondId", "firstId")
      );
      push_bindings(&mut out);
      push_bindings(&mut out);
    }
  }
  out
}

// ─── Sort compilation ────────────────────────────────────────────────────────

pub(crate) fn compile_sort(
  ctx: &DbCtx,
  orders: &[SortOrder],
) -> Result<CompiledOrder> {
  let mut terms: Vec<String> = Vec::new();
  let mut joins: Vec<&'static str> = Vec::new();
  let mut needs_timestamp = false;
  let mut needs_presence = false;

  for order in orders {
    let info = field_info(order.field)?;
    let direction = match order.direction {
      SortDirection::Ascending => "ASC",
      SortDirection::Descending => "DESC",
    };

    let expr = match order.field {
      Field::TimestampModified => {
        needs_timestamp = true;
        "COALESCE(temp.Timestamps.modified, Contacts.modified)".to_owned()
      }
      Field::TimestampCreated | Field::ContactType | Field::StatusFlags => {
        format!("Contacts.{}", info.column)
      }
      Field::GlobalPresenceState => {
        needs_presence = true;
        if !joins.contains(&"GlobalPresences") {
          joins.push("GlobalPresences");
        }
        "COALESCE(temp.GlobalPresenceStates.presenceState, GlobalPresences.presenceState)"
          .to_owned()
      }
      _ => {
        let kind = order.field.kind().ok_or_else(unsupported)?;
        let table = tables::table_for(kind).ok_or_else(unsupported)?;
        if !joins.contains(&table) {
          joins.push(table);
        }
        format!("{table}.{}", info.column)
      }
    };

    let textual = matches!(
      info.field_type,
      FieldType::Text | FieldType::LocalizedText | FieldType::NumericText
    );

    if textual {
      let blank_rank = match order.blank_policy {
        BlankPolicy::BlanksFirst => {
          format!("CASE WHEN COALESCE({expr}, '') = '' THEN 0 ELSE 1 END")
        }
        BlankPolicy::BlanksLast => {
          format!("CASE WHEN COALESCE({expr}, '') = '' THEN 1 ELSE 0 END")
        }
      };
      terms.push(format!("{blank_rank} ASC"));

      let collation = if info.field_type == FieldType::LocalizedText
        && ctx.cfg.has_collation
      {
        "localeCollation"
      } else if order.case_sensitive {
        "RTRIM"
      } else {
        "NOCASE"
      };
      terms.push(format!("{expr} COLLATE {collation} {direction}"));
    } else {
      terms.push(format!("{expr} {direction}"));
    }
  }

  // Deterministic results regardless of the caller's sort.
  terms.push("Contacts.contactId ASC".to_owned());

  Ok(CompiledOrder {
    order_by: terms.join(", "),
    joins,
    needs_timestamp,
    needs_presence,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn glob_escaping() {
    assert_eq!(escape_glob("a*b?c"), "a[*]b[?]c");
    assert_eq!(escape_glob("plain"), "plain");
  }

  #[test]
  fn stripped_phone_expression_nests_replaces() {
    let expr = stripped_phone_expr("PhoneNumbers.phoneNumber");
    assert!(expr.starts_with("replace("));
    assert!(expr.contains("COALESCE(PhoneNumbers.phoneNumber, '')"));
    // One replace per stripped character.
    assert_eq!(expr.matches("replace(").count(), 6);
  }

  #[test]
  fn default_constraints_for_unrestricted_filter() {
    let compiled = CompiledWhere::default();
    let clause = apply_default_constraints(&compiled);
    assert!(clause.contains("Contacts.contactId > 2"));
    assert!(clause.contains("Contacts.collectionId = 1"));
    assert!(clause.contains("Contacts.isDeactivated = 0"));
    assert!(clause.contains("Contacts.changeFlags < 4"));
  }

  #[test]
  fn deleted_test_suppresses_tombstone_constraint() {
    let compiled = CompiledWhere {
      fragment: "(Contacts.changeFlags & 4) != 0".to_owned(),
      tests_deleted: true,
      ..Default::default()
    };
    let clause = apply_default_constraints(&compiled);
    assert!(!clause.contains("changeFlags < 4"));
    assert!(clause.contains("(Contacts.changeFlags & 4) != 0"));
  }
}
