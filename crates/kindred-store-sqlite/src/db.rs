//! Shared engine context, write-transaction guard, temp-table helpers, and
//! the schema-preparation path run at open.

use std::{
  collections::BTreeMap,
  sync::Arc,
};

use chrono::Utc;
use kindred_core::label::{
  known_group_sort_values, DefaultGroupGenerator, DisplayLabelGroupGenerator,
};
use rusqlite::Connection;

use crate::{
  encode::encode_dt,
  mutex::ProcessMutex,
  notify::Notifier,
  schema::{
    self, StepTransform, CURRENT_SCHEMA_VERSION, UPGRADE_STEPS,
  },
  transient::TransientStore,
  Error, Result,
};

/// DbSettings key recording which locale the stored display-label groups
/// were generated for.
const SETTING_GROUP_LOCALE: &str = "displayLabelLocale";

// ─── Configuration ───────────────────────────────────────────────────────────

/// Engine configuration resolved once at open.
pub(crate) struct EngineConfig {
  /// Aggregation runs only for the privileged database.
  pub aggregating:   bool,
  pub locale:        String,
  /// Whether `localeCollation` was registered on the connection.
  pub has_collation: bool,
  pub debug_sql:     bool,
  pub debug_filters: bool,
  /// Locale-applicable generators, descending priority, terminal default
  /// generator last.
  pub generators:    Vec<Box<dyn DisplayLabelGroupGenerator>>,
  /// Stable sort values for all known display-label groups.
  pub known_groups:  BTreeMap<String, i64>,
}

impl EngineConfig {
  pub fn generator_refs(&self) -> Vec<&dyn DisplayLabelGroupGenerator> {
    self.generators.iter().map(|g| g.as_ref()).collect()
  }
}

/// The effective locale, from the usual environment chain.
pub(crate) fn current_locale() -> String {
  for var in ["LC_ALL", "LC_COLLATE", "LANG"] {
    if let Ok(value) = std::env::var(var)
      && !value.is_empty()
    {
      return value;
    }
  }
  "C".to_owned()
}

pub(crate) fn is_c_locale(locale: &str) -> bool {
  matches!(locale, "C" | "POSIX") || locale.starts_with("C.")
}

/// Sort and filter caller-supplied generators for `locale`: preferred ones
/// first, then by descending priority, default fallback appended.
pub(crate) fn arrange_generators(
  mut generators: Vec<Box<dyn DisplayLabelGroupGenerator>>,
  locale: &str,
) -> Vec<Box<dyn DisplayLabelGroupGenerator>> {
  generators.retain(|g| g.valid_for_locale(locale));
  generators.sort_by(|a, b| {
    b.preferred_for_locale(locale)
      .cmp(&a.preferred_for_locale(locale))
      .then(b.priority().cmp(&a.priority()))
  });
  generators.push(Box::new(DefaultGroupGenerator));
  generators
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Everything an engine operation needs besides the connection itself.
/// Cloned into each `tokio_rusqlite` call closure.
#[derive(Clone)]
pub(crate) struct DbCtx {
  pub mutex:     Arc<ProcessMutex>,
  pub transient: Arc<TransientStore>,
  pub notifier:  Arc<Notifier>,
  pub cfg:       Arc<EngineConfig>,
}

impl DbCtx {
  pub fn trace_sql(&self, sql: &str, binding_count: usize) {
    if self.cfg.debug_sql {
      tracing::debug!(target: "kindred::sql", %sql, binding_count, "executing");
    }
  }

  pub fn trace_filter(&self, fragment: &str) {
    if self.cfg.debug_filters {
      tracing::debug!(target: "kindred::filters", %fragment, "compiled");
    }
  }
}

// ─── Write transactions ──────────────────────────────────────────────────────

/// Scoped write capability: the cross-process write semaphore plus an
/// IMMEDIATE transaction. Dropping without commit rolls back and clears the
/// pending-notification accumulator.
pub(crate) struct WriteTx<'a> {
  conn:   &'a Connection,
  ctx:    &'a DbCtx,
  active: bool,
}

impl<'a> WriteTx<'a> {
  pub fn begin(conn: &'a Connection, ctx: &'a DbCtx) -> Result<Self> {
    ctx.mutex.lock()?;
    if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
      let _ = ctx.mutex.unlock();
      return Err(e.into());
    }
    Ok(Self { conn, ctx, active: true })
  }

  pub fn commit(mut self) -> Result<()> {
    self.conn.execute_batch("COMMIT")?;
    self.active = false;
    self.ctx.mutex.unlock()?;
    self.ctx.notifier.flush();
    Ok(())
  }
}

impl Drop for WriteTx<'_> {
  fn drop(&mut self) {
    if self.active {
      if let Err(e) = self.conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %e, "rollback failed");
      }
      let _ = self.ctx.mutex.unlock();
      self.ctx.notifier.clear();
    }
  }
}

// ─── Temp tables ─────────────────────────────────────────────────────────────

/// Create `temp.<base>_transient<n>` holding `ids` and return its name.
/// Multiple id tables for the same base may coexist within one operation.
pub(crate) fn create_transient_id_table(
  conn: &Connection,
  base: &str,
  ids: &[i64],
) -> Result<String> {
  let existing: i64 = conn.query_row(
    "SELECT COUNT(*) FROM sqlite_temp_master
     WHERE type = 'table' AND name LIKE ?1",
    [format!("{base}_transient%")],
    |row| row.get(0),
  )?;
  let name = format!("{base}_transient{existing}");

  conn.execute_batch(&format!(
    "CREATE TABLE temp.{name} (contactId INTEGER)"
  ))?;
  let mut stmt =
    conn.prepare(&format!("INSERT INTO temp.{name} (contactId) VALUES (?1)"))?;
  for id in ids {
    stmt.execute([id])?;
  }
  Ok(format!("temp.{name}"))
}

/// Drop all transient id tables created for `base`.
pub(crate) fn drop_transient_id_tables(
  conn: &Connection,
  base: &str,
) -> Result<()> {
  let names: Vec<String> = {
    let mut stmt = conn.prepare(
      "SELECT name FROM sqlite_temp_master
       WHERE type = 'table' AND name LIKE ?1",
    )?;
    stmt
      .query_map([format!("{base}_transient%")], |row| row.get(0))?
      .collect::<rusqlite::Result<_>>()?
  };
  for name in names {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS temp.{name}"))?;
  }
  Ok(())
}

/// (Re)create the single-column value table used by aggregation matching.
pub(crate) fn fill_temp_values_table(
  conn: &Connection,
  table: &str,
  values: &[String],
) -> Result<()> {
  conn.execute_batch(&format!(
    "CREATE TABLE IF NOT EXISTS temp.{table} (value TEXT);
     DELETE FROM temp.{table};"
  ))?;
  let mut stmt =
    conn.prepare(&format!("INSERT INTO temp.{table} (value) VALUES (?1)"))?;
  for value in values {
    stmt.execute([value])?;
  }
  Ok(())
}

/// Repopulate the overlay temp tables from the current transient snapshot.
/// Run before any query whose compiled form references overlay data.
pub(crate) fn populate_overlay_tables(
  conn: &Connection,
  ctx: &DbCtx,
  timestamps: bool,
  presence: bool,
) -> Result<()> {
  if !timestamps && !presence {
    return Ok(());
  }

  conn.execute_batch(
    "CREATE TABLE IF NOT EXISTS temp.Timestamps (
       contactId INTEGER PRIMARY KEY,
       modified TEXT);
     CREATE TABLE IF NOT EXISTS temp.GlobalPresenceStates (
       contactId INTEGER PRIMARY KEY,
       presenceState INTEGER,
       isOnline BOOL);
     DELETE FROM temp.Timestamps;
     DELETE FROM temp.GlobalPresenceStates;",
  )?;

  let snapshot = ctx.transient.snapshot()?;
  let mut ts_stmt = conn.prepare(
    "INSERT OR REPLACE INTO temp.Timestamps (contactId, modified) VALUES (?1, ?2)",
  )?;
  let mut presence_stmt = conn.prepare(
    "INSERT OR REPLACE INTO temp.GlobalPresenceStates
       (contactId, presenceState, isOnline) VALUES (?1, ?2, ?3)",
  )?;

  for entry in snapshot {
    if timestamps {
      ts_stmt
        .execute(rusqlite::params![entry.contact_id, encode_dt(entry.modified)])?;
    }
    if presence {
      for detail in &entry.details {
        if let kindred_core::detail::DetailData::GlobalPresence(p) = &detail.data
        {
          let online = matches!(
            p.state,
            kindred_core::detail::PresenceState::Available
              | kindred_core::detail::PresenceState::Busy
              | kindred_core::detail::PresenceState::Away
              | kindred_core::detail::PresenceState::ExtendedAway
          );
          presence_stmt.execute(rusqlite::params![
            entry.contact_id,
            p.state.to_int(),
            online
          ])?;
        }
      }
    }
  }
  Ok(())
}

// ─── Collation & preparation ─────────────────────────────────────────────────

/// Register the locale-sensitive collation when the locale calls for one.
/// Falls back to byte order (no registration) on failure.
pub(crate) fn register_collation(conn: &Connection, locale: &str) -> bool {
  if is_c_locale(locale) {
    return false;
  }
  let result = conn.create_collation("localeCollation", |a: &str, b: &str| {
    a.to_lowercase().cmp(&b.to_lowercase())
  });
  match result {
    Ok(()) => true,
    Err(e) => {
      tracing::warn!(error = %e, %locale, "collation registration failed");
      false
    }
  }
}

/// Create or upgrade the schema. Only the initial owner migrates; later
/// attachers merely verify the version is not older than expected.
pub(crate) fn prepare_database(
  conn: &Connection,
  mutex: &ProcessMutex,
  notifier: &Notifier,
  cfg: &EngineConfig,
) -> Result<()> {
  if !schema::schema_exists(conn)? {
    mutex.lock()?;
    let result = (|| {
      conn.execute_batch("BEGIN IMMEDIATE")?;
      match schema::create_schema(conn, &encode_dt(Utc::now()))
        .and_then(|()| schema::set_setting(conn, SETTING_GROUP_LOCALE, &cfg.locale))
      {
        Ok(()) => {
          conn.execute_batch("COMMIT")?;
          Ok(())
        }
        Err(e) => {
          let _ = conn.execute_batch("ROLLBACK");
          Err(e)
        }
      }
    })();
    mutex.unlock()?;
    return result;
  }

  schema::check_tables(conn)?;

  let version = schema::schema_version(conn)?;
  if version > CURRENT_SCHEMA_VERSION {
    tracing::warn!(
      version,
      expected = CURRENT_SCHEMA_VERSION,
      "database schema is newer than this engine; proceeding"
    );
    return Ok(());
  }

  if version < CURRENT_SCHEMA_VERSION {
    if !mutex.is_initial_process() {
      // Another process owns the upgrade; it holds the write lock while
      // migrating, so the version is settled once we can take it.
      return Ok(());
    }
    upgrade_database(conn, mutex, cfg)?;
  }

  // Locale change invalidates stored group sort orders.
  let stored_locale = schema::get_setting(conn, SETTING_GROUP_LOCALE)?;
  if stored_locale.as_deref() != Some(cfg.locale.as_str()) {
    mutex.lock()?;
    let result = (|| {
      conn.execute_batch("BEGIN IMMEDIATE")?;
      match run_transform(conn, cfg, StepTransform::RegenerateDisplayLabelGroups)
        .and_then(|()| schema::set_setting(conn, SETTING_GROUP_LOCALE, &cfg.locale))
      {
        Ok(()) => {
          conn.execute_batch("COMMIT")?;
          Ok(())
        }
        Err(e) => {
          let _ = conn.execute_batch("ROLLBACK");
          Err(e)
        }
      }
    })();
    mutex.unlock()?;
    result?;
    notifier.note_display_label_groups_changed();
    notifier.flush();
  }

  Ok(())
}

fn upgrade_database(
  conn: &Connection,
  mutex: &ProcessMutex,
  cfg: &EngineConfig,
) -> Result<()> {
  mutex.lock()?;
  let result = (|| {
    let mut version = schema::schema_version(conn)?;
    while version < CURRENT_SCHEMA_VERSION {
      let step = UPGRADE_STEPS
        .iter()
        .find(|s| s.from_version == version)
        .ok_or_else(|| {
          Error::Schema(format!("no upgrade step from version {version}"))
        })?;

      conn.execute_batch("BEGIN IMMEDIATE")?;
      let step_result = (|| {
        for transform in step.transforms {
          run_transform(conn, cfg, *transform)?;
        }
        for statement in step.statements {
          conn.execute_batch(statement)?;
        }
        Ok::<(), Error>(())
      })();
      match step_result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
          let _ = conn.execute_batch("ROLLBACK");
          return Err(e);
        }
      }

      let new_version = schema::schema_version(conn)?;
      if new_version <= version {
        return Err(Error::Schema(format!(
          "upgrade step from version {version} did not advance the schema"
        )));
      }
      version = new_version;
    }
    Ok(())
  })();
  mutex.unlock()?;
  result
}

/// Pre-step data transforms. These rewrite stored rows in place; the step's
/// DDL statements run afterwards.
pub(crate) fn run_transform(
  conn: &Connection,
  cfg: &EngineConfig,
  transform: StepTransform,
) -> Result<()> {
  match transform {
    StepTransform::RenormalizePhoneNumbers => {
      let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(
          "SELECT detailId, phoneNumber FROM PhoneNumbers WHERE phoneNumber IS NOT NULL",
        )?;
        stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<_>>()?
      };
      let mut update = conn.prepare(
        "UPDATE PhoneNumbers SET normalizedNumber = ?2 WHERE detailId = ?1",
      )?;
      for (detail_id, number) in rows {
        let normalized = kindred_core::phone::normalize_phone_number(&number);
        update.execute(rusqlite::params![detail_id, normalized])?;
      }
      Ok(())
    }
    StepTransform::RegenerateDisplayLabelGroups => {
      let generators = cfg.generator_refs();
      let known = known_group_sort_values(&generators, &cfg.locale);
      let rows: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(
          "SELECT detailId, COALESCE(displayLabel, '') FROM DisplayLabels",
        )?;
        stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<rusqlite::Result<_>>()?
      };
      let mut update = conn.prepare(
        "UPDATE DisplayLabels
         SET displayLabelGroup = ?2, displayLabelGroupSortOrder = ?3
         WHERE detailId = ?1",
      )?;
      for (detail_id, label) in rows {
        let group =
          kindred_core::label::group_for_text(&generators, &cfg.locale, &label);
        let sort = kindred_core::label::group_sort_value(&group, &known);
        update.execute(rusqlite::params![detail_id, group, sort])?;
      }
      Ok(())
    }
  }
}
