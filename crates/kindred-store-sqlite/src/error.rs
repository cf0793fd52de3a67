//! Error type for `kindred-store-sqlite`.
//!
//! Internal engine code works in terms of this error; the public surface
//! lowers it into the caller-visible taxonomy
//! ([`kindred_core::Error`]), logging diagnostics for anything that maps to
//! `Unspecified`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("connection error: {0}")]
  Connection(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("cross-process semaphore error: {0}")]
  Semaphore(String),

  #[error("schema error: {0}")]
  Schema(String),

  #[error("compression error: {0}")]
  Compression(String),

  /// A failure already classified into the caller-visible taxonomy.
  #[error("{0}")]
  Engine(kindred_core::Error),
}

impl Error {
  /// Lower into the caller-visible taxonomy, logging anything that does not
  /// already carry a classification.
  pub fn into_taxonomy(self, operation: &str) -> kindred_core::Error {
    match self {
      Self::Engine(e) => e,
      other => {
        tracing::warn!(%operation, error = %other, "operation failed");
        kindred_core::Error::Unspecified
      }
    }
  }
}

impl From<kindred_core::Error> for Error {
  fn from(e: kindred_core::Error) -> Self { Self::Engine(e) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
