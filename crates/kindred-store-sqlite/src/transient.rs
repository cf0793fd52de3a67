//! The transient overlay store: fast-changing details (presence, and the
//! modification timestamp such writes imply) kept out of the durable store.
//!
//! The overlay is a named side database living in the runtime tmpfs, so it
//! is memory-resident, attachable by any process that knows the store name,
//! and internally serialised by SQLite's own locking. Presence churn from
//! IM events therefore never dirties the durable file. Readers join the
//! overlay into queries by snapshotting it into per-connection temp tables.

use std::{
  path::{Path, PathBuf},
  sync::Mutex,
};

use chrono::{DateTime, Utc};
use kindred_core::detail::Detail;
use rusqlite::{Connection, OptionalExtension as _};

use crate::{
  encode::{decode_dt, encode_dt},
  Result,
};

/// One overlay row: the contact's transient modification timestamp plus the
/// details that superseded their durable counterparts.
#[derive(Debug, Clone)]
pub struct TransientEntry {
  pub contact_id: i64,
  pub modified:   DateTime<Utc>,
  pub details:    Vec<Detail>,
}

pub struct TransientStore {
  conn: Mutex<Connection>,
  path: PathBuf,
}

/// The tmpfs directory the overlay lives in.
fn runtime_dir() -> PathBuf {
  let shm = Path::new("/dev/shm");
  if shm.is_dir() {
    return shm.to_path_buf();
  }
  if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
    let dir = PathBuf::from(dir);
    if dir.is_dir() {
      return dir;
    }
  }
  std::env::temp_dir()
}

impl TransientStore {
  /// Open (or create) the overlay store named `name`. Any process using the
  /// same name attaches to the same overlay.
  pub fn open(name: &str) -> Result<Self> {
    let path = runtime_dir().join(format!("{name}.transient"));
    let conn = Connection::open(&path)?;
    // Durability is explicitly not wanted here.
    conn.execute_batch(
      "PRAGMA journal_mode = MEMORY;
       PRAGMA synchronous = OFF;
       CREATE TABLE IF NOT EXISTS TransientDetails (
         contactId INTEGER PRIMARY KEY,
         modified TEXT NOT NULL,
         details TEXT NOT NULL);",
    )?;
    Ok(Self { conn: Mutex::new(conn), path })
  }

  pub fn path(&self) -> &Path { &self.path }

  fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
    f(&guard)
  }

  pub fn contains(&self, contact_id: i64) -> Result<bool> {
    self.with_conn(|conn| {
      let found: Option<i64> = conn
        .query_row(
          "SELECT contactId FROM TransientDetails WHERE contactId = ?1",
          [contact_id],
          |row| row.get(0),
        )
        .optional()?;
      Ok(found.is_some())
    })
  }

  pub fn contact_details(
    &self,
    contact_id: i64,
  ) -> Result<Option<(DateTime<Utc>, Vec<Detail>)>> {
    self.with_conn(|conn| {
      let row: Option<(String, String)> = conn
        .query_row(
          "SELECT modified, details FROM TransientDetails WHERE contactId = ?1",
          [contact_id],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
      match row {
        Some((modified, details)) => Ok(Some((
          decode_dt(&modified)?,
          serde_json::from_str(&details)?,
        ))),
        None => Ok(None),
      }
    })
  }

  /// Replace the overlay entry for `contact_id`.
  pub fn set_contact_details(
    &self,
    contact_id: i64,
    modified: DateTime<Utc>,
    details: &[Detail],
  ) -> Result<()> {
    let payload = serde_json::to_string(details)?;
    self.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO TransientDetails (contactId, modified, details)
         VALUES (?1, ?2, ?3)",
        rusqlite::params![contact_id, encode_dt(modified), payload],
      )?;
      Ok(())
    })
  }

  /// Drop the overlay entry; called before any durable write to the contact
  /// and when the contact is deleted or physically removed.
  pub fn remove(&self, contact_id: i64) -> Result<()> {
    self.with_conn(|conn| {
      conn.execute(
        "DELETE FROM TransientDetails WHERE contactId = ?1",
        [contact_id],
      )?;
      Ok(())
    })
  }

  pub fn remove_many(&self, contact_ids: &[i64]) -> Result<()> {
    self.with_conn(|conn| {
      let mut stmt =
        conn.prepare("DELETE FROM TransientDetails WHERE contactId = ?1")?;
      for id in contact_ids {
        stmt.execute([id])?;
      }
      Ok(())
    })
  }

  /// The current overlay contents, used to repopulate the per-connection
  /// temp tables before a read that needs overlay data.
  pub fn snapshot(&self) -> Result<Vec<TransientEntry>> {
    self.with_conn(|conn| {
      let mut stmt = conn.prepare(
        "SELECT contactId, modified, details FROM TransientDetails",
      )?;
      let rows = stmt
        .query_map([], |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
          ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

      let mut entries = Vec::with_capacity(rows.len());
      for (contact_id, modified, details) in rows {
        entries.push(TransientEntry {
          contact_id,
          modified: decode_dt(&modified)?,
          details: serde_json::from_str(&details)?,
        });
      }
      Ok(entries)
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone as _;
  use kindred_core::detail::{DetailData, PresenceData, PresenceState};

  use super::*;

  fn presence_detail(state: PresenceState) -> Detail {
    Detail::new(DetailData::GlobalPresence(PresenceData {
      state,
      ..Default::default()
    }))
  }

  fn unique_store() -> TransientStore {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    TransientStore::open(&format!(
      "kindred-test-{}-{}",
      std::process::id(),
      COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
    .unwrap()
  }

  #[test]
  fn set_and_snapshot() {
    let store = unique_store();
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

    store
      .set_contact_details(9, ts, &[presence_detail(PresenceState::Busy)])
      .unwrap();

    assert!(store.contains(9).unwrap());
    let (modified, details) = store.contact_details(9).unwrap().unwrap();
    assert_eq!(modified, ts);
    assert_eq!(details.len(), 1);

    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].contact_id, 9);

    store.remove(9).unwrap();
    assert!(!store.contains(9).unwrap());
    let _ = std::fs::remove_file(store.path());
  }
}
