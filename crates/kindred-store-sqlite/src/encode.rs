//! Encoding helpers between domain types and the plain-text representations
//! stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings. String sequences (linked detail URIs,
//! capabilities, children) are compact JSON arrays. Contexts and sub-types
//! are `;`-joined numeric text, so that filters can compare them without
//! JSON parsing.

use chrono::{DateTime, Utc};
use kindred_core::detail::Context;

use crate::{Error, Result};

// ─── Timestamps ──────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

pub fn encode_opt_dt(dt: Option<DateTime<Utc>>) -> Option<String> {
  dt.map(encode_dt)
}

pub fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

// ─── String sequences ────────────────────────────────────────────────────────

pub fn encode_string_list(values: &[String]) -> Result<Option<String>> {
  if values.is_empty() {
    return Ok(None);
  }
  Ok(Some(serde_json::to_string(values)?))
}

pub fn decode_string_list(s: Option<String>) -> Result<Vec<String>> {
  match s {
    Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
    _ => Ok(Vec::new()),
  }
}

// ─── Numeric sequences ───────────────────────────────────────────────────────

/// `;`-joined integers represented as text, e.g. `"0;2"`.
pub fn encode_int_list(values: &[i32]) -> Option<String> {
  if values.is_empty() {
    return None;
  }
  Some(
    values
      .iter()
      .map(|v| v.to_string())
      .collect::<Vec<_>>()
      .join(";"),
  )
}

pub fn decode_int_list(s: Option<String>) -> Vec<i32> {
  s.as_deref()
    .unwrap_or("")
    .split(';')
    .filter_map(|part| part.parse().ok())
    .collect()
}

// ─── Contexts ────────────────────────────────────────────────────────────────

pub fn encode_contexts(contexts: &[Context]) -> Option<String> {
  encode_int_list(&contexts.iter().map(|c| c.to_int()).collect::<Vec<_>>())
}

pub fn decode_contexts(s: Option<String>) -> Vec<Context> {
  decode_int_list(s).into_iter().filter_map(Context::from_int).collect()
}

// ─── Case folding ────────────────────────────────────────────────────────────

/// The lowercased form stored in the precomputed sibling columns
/// (`lowerFirstName`, `lowerEmailAddress`, …).
pub fn fold_case(s: &str) -> String { s.to_lowercase() }

pub fn fold_case_opt(s: Option<&str>) -> Option<String> {
  s.map(fold_case)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone as _;

  use super::*;

  #[test]
  fn datetime_round_trip() {
    let dt = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
    assert_eq!(decode_dt(&encode_dt(dt)).unwrap(), dt);
    assert!(decode_dt("not a date").is_err());
  }

  #[test]
  fn int_list_round_trip() {
    assert_eq!(encode_int_list(&[]), None);
    let encoded = encode_int_list(&[0, 2, 7]).unwrap();
    assert_eq!(encoded, "0;2;7");
    assert_eq!(decode_int_list(Some(encoded)), vec![0, 2, 7]);
    assert_eq!(decode_int_list(None), Vec::<i32>::new());
  }

  #[test]
  fn contexts_round_trip() {
    let contexts = vec![Context::Home, Context::Work];
    let encoded = encode_contexts(&contexts);
    assert_eq!(decode_contexts(encoded), contexts);
  }
}
