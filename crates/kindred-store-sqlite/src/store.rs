//! [`ContactsStore`] — the public, async surface of the engine.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on the connection's
//! dedicated thread without blocking the async runtime; in-process
//! operations are linearised by that single thread, while cross-process
//! write serialisation is provided by the semaphore-backed
//! [`crate::mutex::ProcessMutex`]. Internal failures are logged and lowered
//! into the caller-visible [`kindred_core::Error`] taxonomy here.

use std::{
  collections::BTreeMap,
  path::PathBuf,
  sync::Arc,
};

use chrono::{DateTime, Utc};
use kindred_core::{
  collection::{Collection, CollectionChanges, IdentitySlot},
  contact::Contact,
  detail::{Detail, DetailKind},
  error::ErrorMap,
  filter::{Field, FetchHint, Filter, SortOrder},
  label::{known_group_sort_values, DisplayLabelGroupGenerator},
  relationship::{Relationship, RelationshipType},
};
use tokio::sync::broadcast;

use crate::{
  db::{
    arrange_generators, current_locale, prepare_database, register_collation,
    DbCtx, EngineConfig, WriteTx,
  },
  mutex::ProcessMutex,
  notify::{ChangeNotification, Notifier},
  oob::{self, OobValue},
  reader::{self, ContactChanges, DEFAULT_BATCH_SIZE},
  schema::SETUP_PRAGMAS,
  sync::{self, ConflictPolicy, SyncFetchResult},
  transient::TransientStore,
  writer, Error,
};

type CoreResult<T> = Result<T, kindred_core::Error>;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Open-time configuration.
pub struct StoreConfig {
  /// Writable data directory. The database lives in a `privileged`
  /// subdirectory when one can be created; otherwise it falls back to the
  /// directory itself, with aggregation disabled.
  pub data_dir:   PathBuf,
  /// Database file name stem.
  pub name:       String,
  /// Appends a test suffix to the file name, keeping test databases apart
  /// from production ones.
  pub test_mode:  bool,
  /// Locale-specific display-label-group generators. The default A–Z
  /// generator is always appended as the terminal fallback.
  pub generators: Vec<Box<dyn DisplayLabelGroupGenerator>>,
}

impl StoreConfig {
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir:   data_dir.into(),
      name:       "contacts".to_owned(),
      test_mode:  false,
      generators: Vec::new(),
    }
  }
}

fn path_hash(path: &std::path::Path) -> u32 {
  let mut hash: u32 = 0x811c_9dc5;
  for byte in path.as_os_str().as_encoded_bytes() {
    hash ^= u32::from(*byte);
    hash = hash.wrapping_mul(0x0100_0193);
  }
  hash
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A contacts store backed by a single SQLite file.
///
/// Cloning is cheap — the connection and engine context are
/// reference-counted.
#[derive(Clone)]
pub struct ContactsStore {
  conn: tokio_rusqlite::Connection,
  ctx:  DbCtx,
}

impl ContactsStore {
  /// Open (or create) the store described by `config`, running schema
  /// initialisation or migration when this process is the initial owner.
  pub async fn open(config: StoreConfig) -> CoreResult<Self> {
    Self::open_inner(config)
      .await
      .map_err(|e| e.into_taxonomy("open"))
  }

  async fn open_inner(config: StoreConfig) -> Result<Self, Error> {
    // Prefer the privileged subdirectory; aggregation is active only there.
    let privileged_dir = config.data_dir.join("privileged");
    let (db_dir, aggregating) = match std::fs::create_dir_all(&privileged_dir)
    {
      Ok(()) => (privileged_dir, true),
      Err(_) => {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
          Error::Schema(format!("cannot create data directory: {e}"))
        })?;
        (config.data_dir.clone(), false)
      }
    };

    let file_name = if config.test_mode {
      format!("{}_test.db", config.name)
    } else {
      format!("{}.db", config.name)
    };
    let db_path = db_dir.join(file_name);

    let locale = current_locale();
    let generators = arrange_generators(config.generators, &locale);
    let known_groups = {
      let refs: Vec<&dyn DisplayLabelGroupGenerator> =
        generators.iter().map(|g| g.as_ref()).collect();
      known_group_sort_values(&refs, &locale)
    };

    let mutex = Arc::new(ProcessMutex::new(&db_path)?);
    let transient = Arc::new(TransientStore::open(&format!(
      "{}-{:08x}",
      config.name,
      path_hash(&db_path)
    ))?);
    let notifier = Arc::new(Notifier::new());

    let conn = tokio_rusqlite::Connection::open(db_path.clone()).await?;

    // Per-connection setup and collation registration happen on the
    // connection thread.
    let collation_locale = locale.clone();
    let has_collation: bool = conn
      .call(move |c| {
        c.execute_batch(SETUP_PRAGMAS)?;
        Ok(register_collation(c, &collation_locale))
      })
      .await?;

    let cfg = Arc::new(EngineConfig {
      aggregating,
      locale,
      has_collation,
      debug_sql: std::env::var("KINDRED_DEBUG_SQL")
        .is_ok_and(|v| !v.is_empty()),
      debug_filters: std::env::var("KINDRED_DEBUG_FILTERS")
        .is_ok_and(|v| !v.is_empty()),
      generators,
      known_groups,
    });

    let ctx = DbCtx { mutex, transient, notifier, cfg };

    let prepare_ctx = ctx.clone();
    conn
      .call(move |c| {
        Ok(prepare_database(
          c,
          &prepare_ctx.mutex,
          &prepare_ctx.notifier,
          &prepare_ctx.cfg,
        ))
      })
      .await??;

    Ok(Self { conn, ctx })
  }

  /// Whether this connection runs the aggregation engine (privileged
  /// database only).
  pub fn is_aggregating(&self) -> bool { self.ctx.cfg.aggregating }

  /// Subscribe to post-commit change notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
    self.ctx.notifier.subscribe()
  }

  /// Run `PRAGMA optimize` and close the connection.
  pub async fn close(self) -> CoreResult<()> {
    let result: Result<(), Error> = async {
      self
        .conn
        .call(|c| {
          c.execute_batch("PRAGMA optimize")?;
          Ok(())
        })
        .await?;
      Ok(())
    }
    .await;
    result.map_err(|e| e.into_taxonomy("close"))
  }

  async fn call<T, F>(&self, operation: &str, f: F) -> CoreResult<T>
  where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection, &DbCtx) -> Result<T, Error>
      + Send
      + 'static,
  {
    let ctx = self.ctx.clone();
    let result: Result<T, Error> = match self
      .conn
      .call(move |conn| Ok(f(conn, &ctx)))
      .await
    {
      Ok(inner) => inner,
      Err(e) => Err(Error::from(e)),
    };
    result.map_err(|e| e.into_taxonomy(operation))
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Contacts matching `filter` in `orders` order, honouring the hint.
  pub async fn read_contacts(
    &self,
    filter: Filter,
    orders: Vec<SortOrder>,
    hint: FetchHint,
  ) -> CoreResult<Vec<Contact>> {
    self
      .call("read_contacts", move |conn, ctx| {
        let mut out = Vec::new();
        reader::read_contacts(
          conn,
          ctx,
          &filter,
          &orders,
          &hint,
          DEFAULT_BATCH_SIZE,
          &mut |batch| out.extend(batch),
        )?;
        Ok(out)
      })
      .await
  }

  /// As [`read_contacts`](Self::read_contacts), but delivering results in
  /// batches through `on_batch` as they are assembled.
  pub async fn read_contacts_streamed<F>(
    &self,
    filter: Filter,
    orders: Vec<SortOrder>,
    hint: FetchHint,
    batch_size: usize,
    mut on_batch: F,
  ) -> CoreResult<()>
  where
    F: FnMut(Vec<Contact>) + Send + 'static,
  {
    self
      .call("read_contacts", move |conn, ctx| {
        reader::read_contacts(
          conn,
          ctx,
          &filter,
          &orders,
          &hint,
          batch_size,
          &mut on_batch,
        )
      })
      .await
  }

  /// Matching contact ids only.
  pub async fn read_contact_ids(
    &self,
    filter: Filter,
    orders: Vec<SortOrder>,
  ) -> CoreResult<Vec<i64>> {
    self
      .call("read_contact_ids", move |conn, ctx| {
        reader::query_contact_ids(conn, ctx, &filter, &orders)
      })
      .await
  }

  /// Contacts in the same order as `ids`; missing ids produce empty
  /// placeholder contacts and a `DoesNotExist` entry in the error map.
  /// With `relax_constraints`, detail access constraints are not applied
  /// (an editable view).
  pub async fn read_contacts_by_id(
    &self,
    ids: Vec<i64>,
    hint: FetchHint,
    relax_constraints: bool,
  ) -> CoreResult<(Vec<Contact>, ErrorMap)> {
    self
      .call("read_contacts_by_id", move |conn, ctx| {
        reader::read_contacts_by_id(conn, ctx, &ids, &hint, relax_constraints)
      })
      .await
  }

  /// Tombstoned contact ids; only change-log-since, collection, and
  /// sync-target filters are supported.
  pub async fn read_deleted_contact_ids(
    &self,
    filter: Filter,
  ) -> CoreResult<Vec<i64>> {
    self
      .call("read_deleted_contact_ids", move |conn, _ctx| {
        reader::read_deleted_contact_ids(conn, &filter)
      })
      .await
  }

  /// Relationships matching any combination of type and participants.
  pub async fn read_relationships(
    &self,
    rel_type: Option<RelationshipType>,
    first_id: Option<i64>,
    second_id: Option<i64>,
  ) -> CoreResult<Vec<Relationship>> {
    self
      .call("read_relationships", move |conn, _ctx| {
        reader::read_relationships(conn, rel_type.as_ref(), first_id, second_id)
      })
      .await
  }

  /// Unique detail values of an append-unique kind; fields not listed in
  /// `fields` are returned as nulls.
  pub async fn read_details(
    &self,
    kind: DetailKind,
    fields: Vec<Field>,
    filter: Filter,
    orders: Vec<SortOrder>,
    hint: FetchHint,
  ) -> CoreResult<Vec<Detail>> {
    self
      .call("read_details", move |conn, ctx| {
        reader::read_details(conn, ctx, kind, &fields, &filter, &orders, &hint)
      })
      .await
  }

  /// All collections (including tombstoned ones).
  pub async fn read_collections(&self) -> CoreResult<Vec<Collection>> {
    self
      .call("read_collections", move |conn, _ctx| {
        reader::read_collections(conn, None, None)
      })
      .await
  }

  /// Collections partitioned by change flags, optionally restricted to an
  /// account and application.
  pub async fn fetch_collections(
    &self,
    account_id: Option<i64>,
    application_name: Option<String>,
  ) -> CoreResult<CollectionChanges> {
    self
      .call("fetch_collections", move |conn, _ctx| {
        reader::fetch_collection_changes(
          conn,
          account_id,
          application_name.as_deref(),
        )
      })
      .await
  }

  /// Contacts of one collection partitioned by change flags; change flags
  /// are always kept so the adapter can observe and later clear them.
  pub async fn fetch_contacts_in_collection(
    &self,
    collection_id: i64,
    hint: FetchHint,
  ) -> CoreResult<ContactChanges> {
    self
      .call("fetch_contacts_in_collection", move |conn, ctx| {
        reader::fetch_contacts_in_collection(conn, ctx, collection_id, &hint)
      })
      .await
  }

  // ── Writes ────────────────────────────────────────────────────────────

  /// Create or update contacts. The batch must target one collection; on
  /// failure the whole batch rolls back and the per-index map reports the
  /// failing entries.
  pub async fn save_contacts(
    &self,
    mut contacts: Vec<Contact>,
    mask: Vec<DetailKind>,
  ) -> (CoreResult<Vec<Contact>>, ErrorMap) {
    let result = self
      .call("save_contacts", move |conn, ctx| {
        let mut errors = ErrorMap::new();
        match writer::save_contacts(conn, ctx, &mut contacts, &mask, &mut errors)
        {
          Ok(()) => Ok((contacts, errors)),
          Err(e) => Err(match e {
            Error::Engine(engine) => Error::Engine(engine_with_map(engine, &errors)),
            other => other,
          }),
        }
      })
      .await;
    match result {
      Ok((contacts, errors)) => (Ok(contacts), errors),
      Err(e) => (Err(e), ErrorMap::new()),
    }
  }

  /// Tombstone non-aggregate contacts.
  pub async fn remove_contacts(
    &self,
    ids: Vec<i64>,
  ) -> (CoreResult<()>, ErrorMap) {
    self.batch_call("remove_contacts", move |conn, ctx, errors| {
      writer::remove_contacts(conn, ctx, &ids, errors)
    })
    .await
  }

  /// Insert relationships; duplicates are silently idempotent.
  pub async fn save_relationships(
    &self,
    relationships: Vec<Relationship>,
  ) -> (CoreResult<()>, ErrorMap) {
    self.batch_call("save_relationships", move |conn, ctx, errors| {
      writer::save_relationships(conn, ctx, &relationships, errors)
    })
    .await
  }

  /// Remove relationships, regenerating aggregates as needed.
  pub async fn remove_relationships(
    &self,
    relationships: Vec<Relationship>,
  ) -> (CoreResult<()>, ErrorMap) {
    self.batch_call("remove_relationships", move |conn, ctx, errors| {
      writer::remove_relationships(conn, ctx, &relationships, errors)
    })
    .await
  }

  /// Create or update collections; the aggregate collection is protected.
  pub async fn save_collections(
    &self,
    mut collections: Vec<Collection>,
  ) -> (CoreResult<Vec<Collection>>, ErrorMap) {
    let result = self
      .call("save_collections", move |conn, ctx| {
        let mut errors = ErrorMap::new();
        writer::save_collections(conn, ctx, &mut collections, &mut errors)?;
        Ok((collections, errors))
      })
      .await;
    match result {
      Ok((collections, errors)) => (Ok(collections), errors),
      Err(e) => (Err(e), ErrorMap::new()),
    }
  }

  /// Remove collections; cascades to their contacts (physically when
  /// `clear_change_flags` is set, as tombstones otherwise).
  pub async fn remove_collections(
    &self,
    ids: Vec<i64>,
    clear_change_flags: bool,
  ) -> (CoreResult<()>, ErrorMap) {
    self.batch_call("remove_collections", move |conn, ctx, errors| {
      writer::remove_collections(conn, ctx, &ids, clear_change_flags, errors)
    })
    .await
  }

  async fn batch_call<F>(
    &self,
    operation: &str,
    f: F,
  ) -> (CoreResult<()>, ErrorMap)
  where
    F: FnOnce(
        &rusqlite::Connection,
        &DbCtx,
        &mut ErrorMap,
      ) -> Result<(), Error>
      + Send
      + 'static,
  {
    let result = self
      .call(operation, move |conn, ctx| {
        let mut errors = ErrorMap::new();
        f(conn, ctx, &mut errors)?;
        Ok(errors)
      })
      .await;
    match result {
      Ok(errors) => {
        let worst = kindred_core::error::worst_of(&errors);
        (worst.map_or(Ok(()), Err), errors)
      }
      Err(e) => (Err(e), ErrorMap::new()),
    }
  }

  // ── Identities ────────────────────────────────────────────────────────

  pub async fn identity(&self, slot: IdentitySlot) -> CoreResult<Option<i64>> {
    self
      .call("identity", move |conn, _ctx| writer::identity(conn, slot))
      .await
  }

  /// Write an identity slot; the self-contact slot is read-only.
  pub async fn set_identity(
    &self,
    slot: IdentitySlot,
    contact_id: i64,
  ) -> CoreResult<()> {
    self
      .call("set_identity", move |conn, _ctx| {
        writer::set_identity(conn, slot, contact_id)
      })
      .await
  }

  // ── Sync ──────────────────────────────────────────────────────────────

  /// Deltas of `collection_id` since `since`, as partial aggregate views.
  pub async fn sync_fetch(
    &self,
    collection_id: i64,
    since: Option<DateTime<Utc>>,
    exported_ids: Vec<i64>,
  ) -> CoreResult<SyncFetchResult> {
    self
      .call("sync_fetch", move |conn, ctx| {
        sync::sync_fetch(conn, ctx, collection_id, since, &exported_ids)
      })
      .await
  }

  /// Apply remote deltas under `policy`. Returns, per pair, the aggregate
  /// id created or reused.
  pub async fn sync_update(
    &self,
    collection_id: i64,
    policy: ConflictPolicy,
    pairs: Vec<(Option<Contact>, Option<Contact>)>,
  ) -> CoreResult<Vec<Option<i64>>> {
    self
      .call("sync_update", move |conn, ctx| {
        sync::sync_update(conn, ctx, collection_id, policy, &pairs)
      })
      .await
  }

  /// Clear the change flags of a collection and its contacts after the
  /// adapter uploaded them; tombstoned rows are physically removed.
  pub async fn clear_change_flags(&self, collection_id: i64) -> CoreResult<()> {
    self
      .call("clear_change_flags", move |conn, ctx| {
        writer::clear_change_flags(conn, ctx, collection_id)
      })
      .await
  }

  // ── OOB ───────────────────────────────────────────────────────────────

  pub async fn store_oob(
    &self,
    scope: String,
    values: BTreeMap<String, OobValue>,
  ) -> CoreResult<()> {
    self
      .call("store_oob", move |conn, ctx| {
        let tx = WriteTx::begin(conn, ctx)?;
        oob::store_oob(conn, &scope, &values)?;
        tx.commit()
      })
      .await
  }

  pub async fn fetch_oob(
    &self,
    scope: String,
    keys: Option<Vec<String>>,
  ) -> CoreResult<BTreeMap<String, OobValue>> {
    self
      .call("fetch_oob", move |conn, _ctx| {
        oob::fetch_oob(conn, &scope, keys.as_deref())
      })
      .await
  }

  pub async fn fetch_oob_keys(&self, scope: String) -> CoreResult<Vec<String>> {
    self
      .call("fetch_oob_keys", move |conn, _ctx| {
        oob::fetch_oob_keys(conn, &scope)
      })
      .await
  }

  pub async fn remove_oob(
    &self,
    scope: String,
    keys: Option<Vec<String>>,
  ) -> CoreResult<()> {
    self
      .call("remove_oob", move |conn, ctx| {
        let tx = WriteTx::begin(conn, ctx)?;
        oob::remove_oob(conn, &scope, keys.as_deref())?;
        tx.commit()
      })
      .await
  }
}

/// Fold the per-index map into the operation's returned error, preferring
/// the worst entry recorded.
fn engine_with_map(
  error: kindred_core::Error,
  errors: &ErrorMap,
) -> kindred_core::Error {
  kindred_core::error::worst_of(errors).unwrap_or(error)
}
