//! The out-of-band key/value store: scoped blobs for sync-adapter
//! bookkeeping that the engine neither interprets nor indexes.
//!
//! Keys are stored as `scope:key`. Large values are deflate-compressed when
//! a Shannon-entropy probe suggests the bytes will actually shrink; the
//! `compressed` column tags how to restore them.

use std::{
  collections::BTreeMap,
  io::{Read as _, Write as _},
};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use rusqlite::{types::Value, Connection};

use crate::{Error, Result};

/// Values below this size are never worth compressing.
const BYTES_COMPRESSION_THRESHOLD: usize = 512;
const STRING_COMPRESSION_THRESHOLD: usize = 256;

/// Entropy (0..1) above which byte payloads are assumed incompressible.
const ENTROPY_CEILING: f64 = 0.85;

const COMPRESSED_NONE: i64 = 0;
const COMPRESSED_BYTES: i64 = 1;
const COMPRESSED_STRING: i64 = 2;

/// An OOB value; the engine preserves the bytes/string distinction across
/// the compression boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobValue {
  Bytes(Vec<u8>),
  Text(String),
}

// ─── Entropy & compression ───────────────────────────────────────────────────

/// Shannon entropy of `sample`, normalised to 0..1 (low → repetitive,
/// high → dense).
pub(crate) fn entropy(sample: &[u8]) -> f64 {
  if sample.is_empty() {
    return 0.0;
  }
  let mut counts = [0u32; 256];
  for byte in sample {
    counts[*byte as usize] += 1;
  }
  let total = sample.len() as f64;
  let mut entropy = 0.0;
  for count in counts {
    if count > 0 {
      let p = f64::from(count) / total;
      entropy -= p * p.log2();
    }
  }
  entropy / 8.0
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
  let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
  encoder
    .write_all(bytes)
    .and_then(|()| encoder.finish())
    .map_err(|e| Error::Compression(format!("oob compression failed: {e}")))
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
  let mut decoder = ZlibDecoder::new(bytes);
  let mut out = Vec::new();
  decoder
    .read_to_end(&mut out)
    .map_err(|e| Error::Compression(format!("oob decompression failed: {e}")))?;
  Ok(out)
}

/// Decide storage form: `(stored column value, compression tag)`.
/// Uncompressed text stays a TEXT column value and uncompressed bytes a
/// BLOB, so the bytes/string distinction survives without a tag; compressed
/// payloads are always BLOBs and carry the distinction in the tag.
fn encode_value(value: &OobValue) -> Result<(Value, i64)> {
  match value {
    OobValue::Bytes(bytes) => {
      if bytes.len() > BYTES_COMPRESSION_THRESHOLD {
        // Probe a mid-payload window; headers are unrepresentative.
        let sample = &bytes[256..512.min(bytes.len())];
        if entropy(sample) < ENTROPY_CEILING {
          return Ok((Value::Blob(deflate(bytes)?), COMPRESSED_BYTES));
        }
      }
      Ok((Value::Blob(bytes.clone()), COMPRESSED_NONE))
    }
    OobValue::Text(text) => {
      if text.chars().count() > STRING_COMPRESSION_THRESHOLD {
        Ok((Value::Blob(deflate(text.as_bytes())?), COMPRESSED_STRING))
      } else {
        Ok((Value::Text(text.clone()), COMPRESSED_NONE))
      }
    }
  }
}

fn decode_value(stored: Value, compressed: i64) -> Result<OobValue> {
  match compressed {
    COMPRESSED_BYTES => match stored {
      Value::Blob(blob) => Ok(OobValue::Bytes(inflate(&blob)?)),
      other => Err(Error::Compression(format!(
        "oob compressed bytes stored as {}",
        other.data_type()
      ))),
    },
    COMPRESSED_STRING => match stored {
      Value::Blob(blob) => {
        let bytes = inflate(&blob)?;
        String::from_utf8(bytes)
          .map(OobValue::Text)
          .map_err(|e| Error::Compression(format!("oob utf-8: {e}")))
      }
      other => Err(Error::Compression(format!(
        "oob compressed string stored as {}",
        other.data_type()
      ))),
    },
    // Uncompressed: the column's storage class carries the distinction.
    _ => match stored {
      Value::Text(text) => Ok(OobValue::Text(text)),
      Value::Blob(blob) => Ok(OobValue::Bytes(blob)),
      Value::Null => Ok(OobValue::Bytes(Vec::new())),
      other => Err(Error::Compression(format!(
        "oob value stored as {}",
        other.data_type()
      ))),
    },
  }
}

// ─── Operations ──────────────────────────────────────────────────────────────

fn scoped(scope: &str, key: &str) -> String { format!("{scope}:{key}") }

pub(crate) fn store_oob(
  conn: &Connection,
  scope: &str,
  values: &BTreeMap<String, OobValue>,
) -> Result<()> {
  let mut stmt = conn.prepare(
    "INSERT OR REPLACE INTO OOB (name, value, compressed) VALUES (?1, ?2, ?3)",
  )?;
  for (key, value) in values {
    let (stored, compressed) = encode_value(value)?;
    stmt.execute(rusqlite::params![scoped(scope, key), stored, compressed])?;
  }
  Ok(())
}

/// Fetch values by key list, or the whole scope when `keys` is `None`.
pub(crate) fn fetch_oob(
  conn: &Connection,
  scope: &str,
  keys: Option<&[String]>,
) -> Result<BTreeMap<String, OobValue>> {
  let mut out = BTreeMap::new();
  match keys {
    Some(keys) => {
      let mut stmt = conn
        .prepare("SELECT value, compressed FROM OOB WHERE name = ?1")?;
      for key in keys {
        use rusqlite::OptionalExtension as _;
        let row: Option<(Value, i64)> = stmt
          .query_row([scoped(scope, key)], |r| Ok((r.get(0)?, r.get(1)?)))
          .optional()?;
        if let Some((stored, compressed)) = row {
          out.insert(key.clone(), decode_value(stored, compressed)?);
        }
      }
    }
    None => {
      let prefix = format!("{scope}:");
      let mut stmt = conn.prepare(
        "SELECT name, value, compressed FROM OOB WHERE name LIKE ?1",
      )?;
      let rows = stmt
        .query_map([format!("{prefix}%")], |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Value>(1)?,
            row.get::<_, i64>(2)?,
          ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      for (name, stored, compressed) in rows {
        let Some(key) = name.strip_prefix(&prefix) else { continue };
        out.insert(key.to_owned(), decode_value(stored, compressed)?);
      }
    }
  }
  Ok(out)
}

pub(crate) fn fetch_oob_keys(
  conn: &Connection,
  scope: &str,
) -> Result<Vec<String>> {
  let prefix = format!("{scope}:");
  let mut stmt =
    conn.prepare("SELECT name FROM OOB WHERE name LIKE ?1 ORDER BY name")?;
  let rows = stmt
    .query_map([format!("{prefix}%")], |row| row.get::<_, String>(0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(
    rows
      .into_iter()
      .filter_map(|name| name.strip_prefix(&prefix).map(str::to_owned))
      .collect(),
  )
}

/// Remove values by key list, or the whole scope when `keys` is `None`.
pub(crate) fn remove_oob(
  conn: &Connection,
  scope: &str,
  keys: Option<&[String]>,
) -> Result<()> {
  match keys {
    Some(keys) => {
      let mut stmt = conn.prepare("DELETE FROM OOB WHERE name = ?1")?;
      for key in keys {
        stmt.execute([scoped(scope, key)])?;
      }
    }
    None => {
      conn.execute("DELETE FROM OOB WHERE name LIKE ?1", [format!("{scope}:%")])?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn entropy_bounds() {
    assert_eq!(entropy(&[]), 0.0);
    assert_eq!(entropy(&[7u8; 256]), 0.0);

    // One of each byte value: maximal entropy.
    let uniform: Vec<u8> = (0..=255u8).collect();
    assert!(entropy(&uniform) > 0.99);
  }

  #[test]
  fn repetitive_bytes_compress() {
    let value = OobValue::Bytes(vec![42u8; 4096]);
    let (stored, tag) = encode_value(&value).unwrap();
    assert_eq!(tag, COMPRESSED_BYTES);
    match &stored {
      Value::Blob(blob) => assert!(blob.len() < 4096),
      other => panic!("expected blob storage, got {other:?}"),
    }
    assert_eq!(decode_value(stored, tag).unwrap(), value);
  }

  #[test]
  fn dense_bytes_stay_raw() {
    // Pseudo-random (xorshift) payload defeats the entropy gate.
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let bytes: Vec<u8> = (0..4096)
      .map(|_| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state & 0xff) as u8
      })
      .collect();
    let (_, tag) = encode_value(&OobValue::Bytes(bytes)).unwrap();
    assert_eq!(tag, COMPRESSED_NONE);
  }

  #[test]
  fn long_strings_compress_and_round_trip() {
    let text = "state ".repeat(100);
    let value = OobValue::Text(text);
    let (stored, tag) = encode_value(&value).unwrap();
    assert_eq!(tag, COMPRESSED_STRING);
    assert_eq!(decode_value(stored, tag).unwrap(), value);
  }

  #[test]
  fn short_strings_stay_raw() {
    let value = OobValue::Text("cursor=12".into());
    let (stored, tag) = encode_value(&value).unwrap();
    assert_eq!(tag, COMPRESSED_NONE);
    assert!(matches!(stored, Value::Text(_)));
    assert_eq!(decode_value(stored, tag).unwrap(), value);
  }

  #[test]
  fn short_utf8_bytes_stay_bytes() {
    // Valid UTF-8 content must not turn a bytes value into a string; the
    // storage class keeps the variants apart.
    let value = OobValue::Bytes(b"anchor".to_vec());
    let (stored, tag) = encode_value(&value).unwrap();
    assert_eq!(tag, COMPRESSED_NONE);
    assert!(matches!(stored, Value::Blob(_)));
    assert_eq!(decode_value(stored, tag).unwrap(), value);
  }
}
