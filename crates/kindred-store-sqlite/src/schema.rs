//! SQL schema, built-in rows, and the versioned upgrade pipeline.
//!
//! The schema version is a single monotonic integer stored via
//! `PRAGMA user_version`. A fresh database is created at
//! [`CURRENT_SCHEMA_VERSION`] and seeded with the reserved collections, the
//! self contacts, and the self-aggregates-self relationship. Existing
//! databases are upgraded step by step; each step is an ordered statement
//! list plus an optional pre-step data transform, and only the initial
//! owner process runs the pipeline.

use kindred_core::{
  collection::IdentitySlot,
  contact::{
    AGGREGATE_COLLECTION_ID, LOCAL_COLLECTION_ID, LOCAL_SELF_CONTACT_ID,
    SELF_CONTACT_ID,
  },
};
use rusqlite::Connection;

use crate::{Error, Result};

pub const CURRENT_SCHEMA_VERSION: i64 = 2;

// ─── Per-connection setup ────────────────────────────────────────────────────

/// Executed on every connection. `encoding` only takes effect on a freshly
/// created file; it is a no-op afterwards.
pub const SETUP_PRAGMAS: &str = "
PRAGMA encoding = \"UTF-16\";
PRAGMA temp_store = MEMORY;
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
";

// ─── Schema DDL ──────────────────────────────────────────────────────────────

pub const CREATE_SCHEMA: &str = "
CREATE TABLE Collections (
    collectionId INTEGER PRIMARY KEY ASC AUTOINCREMENT,
    aggregable BOOL DEFAULT 1,
    name TEXT,
    description TEXT,
    color TEXT,
    secondaryColor TEXT,
    image TEXT,
    applicationName TEXT,
    accountId INTEGER DEFAULT 0,
    remotePath TEXT,
    changeFlags INTEGER DEFAULT 0,
    recordUnhandledChangeFlags BOOL DEFAULT 0);

CREATE TABLE CollectionsMetadata (
    collectionId INTEGER REFERENCES Collections (collectionId),
    key TEXT,
    value BLOB,
    PRIMARY KEY (collectionId, key));

CREATE TABLE Contacts (
    contactId INTEGER PRIMARY KEY ASC AUTOINCREMENT,
    collectionId INTEGER REFERENCES Collections (collectionId),
    created DATETIME,
    modified DATETIME,
    deleted DATETIME,
    hasPhoneNumber BOOL DEFAULT 0,
    hasEmailAddress BOOL DEFAULT 0,
    hasOnlineAccount BOOL DEFAULT 0,
    isOnline BOOL DEFAULT 0,
    isDeactivated BOOL DEFAULT 0,
    changeFlags INTEGER DEFAULT 0,
    unhandledChangeFlags INTEGER DEFAULT 0,
    type INTEGER DEFAULT 0);

CREATE TABLE Details (
    detailId INTEGER PRIMARY KEY ASC AUTOINCREMENT,
    contactId INTEGER REFERENCES Contacts (contactId),
    detail TEXT,
    detailUri TEXT,
    linkedDetailUris TEXT,
    contexts TEXT,
    accessConstraints INTEGER DEFAULT 0,
    provenance TEXT,
    modifiable BOOL DEFAULT 1,
    nonexportable BOOL DEFAULT 0,
    changeFlags INTEGER DEFAULT 0,
    unhandledChangeFlags INTEGER DEFAULT 0);

CREATE INDEX DetailsRemoveIndex ON Details(contactId, detail);
CREATE INDEX DetailsChangeFlagsIndex ON Details(changeFlags);
CREATE INDEX DetailsContactIdIndex ON Details(contactId);

CREATE TABLE Addresses (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    street TEXT,
    postOfficeBox TEXT,
    region TEXT,
    locality TEXT,
    postCode TEXT,
    country TEXT,
    subTypes TEXT);

CREATE TABLE Anniversaries (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    originalDateTime DATETIME,
    calendarId TEXT,
    subType TEXT,
    event TEXT);

CREATE TABLE Avatars (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    imageUrl TEXT,
    videoUrl TEXT,
    avatarMetadata TEXT);

CREATE TABLE Birthdays (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    birthday DATETIME,
    calendarId TEXT);

CREATE TABLE DisplayLabels (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY UNIQUE,
    displayLabel TEXT,
    displayLabelGroup TEXT,
    displayLabelGroupSortOrder INTEGER);

CREATE TABLE EmailAddresses (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    emailAddress TEXT,
    lowerEmailAddress TEXT);

CREATE TABLE Families (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    spouse TEXT,
    children TEXT);

CREATE TABLE Favorites (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY UNIQUE,
    isFavorite BOOL);

CREATE TABLE Genders (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY UNIQUE,
    gender TEXT);

CREATE TABLE GeoLocations (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    label TEXT,
    latitude REAL,
    longitude REAL,
    accuracy REAL,
    altitude REAL,
    altitudeAccuracy REAL,
    heading REAL,
    speed REAL,
    timestamp DATETIME);

CREATE TABLE GlobalPresences (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    presenceState INTEGER,
    timestamp DATETIME,
    nickname TEXT,
    customMessage TEXT,
    presenceStateText TEXT,
    presenceStateImageUrl TEXT);

CREATE TABLE Guids (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    guid TEXT);

CREATE TABLE Hobbies (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    hobby TEXT);

CREATE TABLE Names (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY UNIQUE,
    firstName TEXT,
    lowerFirstName TEXT,
    lastName TEXT,
    lowerLastName TEXT,
    middleName TEXT,
    prefix TEXT,
    suffix TEXT,
    customLabel TEXT);

CREATE TABLE Nicknames (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    nickname TEXT,
    lowerNickname TEXT);

CREATE TABLE Notes (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    note TEXT);

CREATE TABLE OnlineAccounts (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    accountUri TEXT,
    lowerAccountUri TEXT,
    protocol TEXT,
    serviceProvider TEXT,
    capabilities TEXT,
    subTypes TEXT,
    accountPath TEXT,
    accountIconPath TEXT,
    enabled BOOL,
    accountDisplayName TEXT,
    serviceProviderDisplayName TEXT);

CREATE TABLE Organizations (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    name TEXT,
    role TEXT,
    title TEXT,
    location TEXT,
    department TEXT,
    logoUrl TEXT,
    assistantName TEXT);

CREATE TABLE PhoneNumbers (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    phoneNumber TEXT,
    subTypes TEXT,
    normalizedNumber TEXT);

CREATE TABLE Presences (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    presenceState INTEGER,
    timestamp DATETIME,
    nickname TEXT,
    customMessage TEXT,
    presenceStateText TEXT,
    presenceStateImageUrl TEXT);

CREATE TABLE Ringtones (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    audioRingtone TEXT,
    videoRingtone TEXT,
    vibrationRingtone TEXT);

CREATE TABLE SyncTargets (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY UNIQUE,
    syncTarget TEXT);

CREATE TABLE Tags (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    tag TEXT);

CREATE TABLE Urls (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    url TEXT,
    subTypes TEXT);

CREATE TABLE OriginMetadata (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    id TEXT,
    groupId TEXT,
    enabled BOOL);

CREATE TABLE ExtendedDetails (
    detailId INTEGER PRIMARY KEY ASC REFERENCES Details (detailId),
    contactId INTEGER KEY,
    name TEXT,
    data BLOB);

CREATE TABLE Identities (
    identity INTEGER PRIMARY KEY,
    contactId INTEGER KEY);

CREATE TABLE Relationships (
    firstId INTEGER NOT NULL,
    secondId INTEGER NOT NULL,
    type TEXT,
    PRIMARY KEY (firstId, secondId, type));

CREATE TABLE DeletedContacts (
    contactId INTEGER PRIMARY KEY,
    collectionId INTEGER NOT NULL,
    deleted DATETIME);

CREATE TABLE OOB (
    name TEXT PRIMARY KEY,
    value BLOB,
    compressed INTEGER DEFAULT 0);

CREATE TABLE DbSettings (
    name TEXT PRIMARY KEY,
    value TEXT);

CREATE TRIGGER RemoveContactDetails
BEFORE DELETE
ON Contacts
BEGIN
  INSERT OR REPLACE INTO DeletedContacts (contactId, collectionId, deleted)
    VALUES (old.contactId, old.collectionId, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'));
  DELETE FROM Addresses WHERE contactId = old.contactId;
  DELETE FROM Anniversaries WHERE contactId = old.contactId;
  DELETE FROM Avatars WHERE contactId = old.contactId;
  DELETE FROM Birthdays WHERE contactId = old.contactId;
  DELETE FROM DisplayLabels WHERE contactId = old.contactId;
  DELETE FROM EmailAddresses WHERE contactId = old.contactId;
  DELETE FROM Families WHERE contactId = old.contactId;
  DELETE FROM Favorites WHERE contactId = old.contactId;
  DELETE FROM Genders WHERE contactId = old.contactId;
  DELETE FROM GeoLocations WHERE contactId = old.contactId;
  DELETE FROM GlobalPresences WHERE contactId = old.contactId;
  DELETE FROM Guids WHERE contactId = old.contactId;
  DELETE FROM Hobbies WHERE contactId = old.contactId;
  DELETE FROM Names WHERE contactId = old.contactId;
  DELETE FROM Nicknames WHERE contactId = old.contactId;
  DELETE FROM Notes WHERE contactId = old.contactId;
  DELETE FROM OnlineAccounts WHERE contactId = old.contactId;
  DELETE FROM Organizations WHERE contactId = old.contactId;
  DELETE FROM PhoneNumbers WHERE contactId = old.contactId;
  DELETE FROM Presences WHERE contactId = old.contactId;
  DELETE FROM Ringtones WHERE contactId = old.contactId;
  DELETE FROM SyncTargets WHERE contactId = old.contactId;
  DELETE FROM Tags WHERE contactId = old.contactId;
  DELETE FROM Urls WHERE contactId = old.contactId;
  DELETE FROM OriginMetadata WHERE contactId = old.contactId;
  DELETE FROM ExtendedDetails WHERE contactId = old.contactId;
  DELETE FROM Details WHERE contactId = old.contactId;
  DELETE FROM Identities WHERE contactId = old.contactId;
  DELETE FROM Relationships WHERE firstId = old.contactId OR secondId = old.contactId;
END;
";

// ─── Upgrade pipeline ────────────────────────────────────────────────────────

/// Data transforms that must run before a step's statements. Kept as an
/// enum (rather than function pointers) so steps can reach engine context
/// when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransform {
  /// Re-run `normalize_phone_number` over every stored phone number.
  RenormalizePhoneNumbers,
  /// Recompute display-label groups and their sort orders.
  RegenerateDisplayLabelGroups,
}

pub struct UpgradeStep {
  pub from_version: i64,
  pub statements:   &'static [&'static str],
  pub transforms:   &'static [StepTransform],
}

/// Ordered upgrade steps for databases created by earlier releases.
/// Version 1 predates the precomputed display-label-group sort order and
/// stored phone numbers normalised by a buggier routine. The group sort
/// orders themselves are backfilled by the locale check that runs after
/// migration (version-1 databases never recorded a group locale).
pub const UPGRADE_STEPS: &[UpgradeStep] = &[UpgradeStep {
  from_version: 1,
  statements:   &[
    "ALTER TABLE DisplayLabels ADD COLUMN displayLabelGroupSortOrder INTEGER",
    "PRAGMA user_version = 2",
  ],
  transforms:   &[StepTransform::RenormalizePhoneNumbers],
}];

// ─── Helpers ─────────────────────────────────────────────────────────────────

pub fn schema_version(conn: &Connection) -> Result<i64> {
  Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

pub fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
  conn.execute_batch(&format!("PRAGMA user_version = {version}"))?;
  Ok(())
}

/// True when the database file already carries a contacts schema.
pub fn schema_exists(conn: &Connection) -> Result<bool> {
  let count: i64 = conn.query_row(
    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'Contacts'",
    [],
    |row| row.get(0),
  )?;
  Ok(count > 0)
}

/// Probe the essential tables; a database claiming a valid version but
/// missing tables is corrupt and not tolerated.
pub fn check_tables(conn: &Connection) -> Result<()> {
  for table in ["Collections", "Contacts", "Details", "Relationships", "OOB"] {
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
      [table],
      |row| row.get(0),
    )?;
    if count == 0 {
      return Err(Error::Schema(format!("missing table {table}")));
    }
  }
  Ok(())
}

/// Create the full schema and the built-in rows in a fresh database.
pub fn create_schema(conn: &Connection, now: &str) -> Result<()> {
  conn.execute_batch(CREATE_SCHEMA)?;

  conn.execute(
    "INSERT INTO Collections (collectionId, aggregable, name) VALUES (?1, 0, 'Aggregate')",
    [AGGREGATE_COLLECTION_ID],
  )?;
  conn.execute(
    "INSERT INTO Collections (collectionId, aggregable, name) VALUES (?1, 1, 'Local')",
    [LOCAL_COLLECTION_ID],
  )?;

  conn.execute(
    "INSERT INTO Contacts (contactId, collectionId, created, modified) VALUES (?1, ?2, ?3, ?3)",
    rusqlite::params![LOCAL_SELF_CONTACT_ID, LOCAL_COLLECTION_ID, now],
  )?;
  conn.execute(
    "INSERT INTO Contacts (contactId, collectionId, created, modified) VALUES (?1, ?2, ?3, ?3)",
    rusqlite::params![SELF_CONTACT_ID, AGGREGATE_COLLECTION_ID, now],
  )?;

  conn.execute(
    "INSERT INTO Relationships (firstId, secondId, type) VALUES (?1, ?2, 'Aggregates')",
    [SELF_CONTACT_ID, LOCAL_SELF_CONTACT_ID],
  )?;

  conn.execute(
    "INSERT INTO Identities (identity, contactId) VALUES (?1, ?2)",
    [IdentitySlot::SelfContactId.to_int(), SELF_CONTACT_ID],
  )?;

  set_schema_version(conn, CURRENT_SCHEMA_VERSION)?;
  Ok(())
}

// ─── DbSettings ──────────────────────────────────────────────────────────────

pub fn get_setting(conn: &Connection, name: &str) -> Result<Option<String>> {
  use rusqlite::OptionalExtension as _;
  Ok(
    conn
      .query_row("SELECT value FROM DbSettings WHERE name = ?1", [name], |row| {
        row.get(0)
      })
      .optional()?,
  )
}

pub fn set_setting(conn: &Connection, name: &str, value: &str) -> Result<()> {
  conn.execute(
    "INSERT OR REPLACE INTO DbSettings (name, value) VALUES (?1, ?2)",
    [name, value],
  )?;
  Ok(())
}
