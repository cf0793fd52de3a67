//! SQLite engine for the Kindred contacts store.
//!
//! A single embedded database holds contacts partitioned into collections;
//! this crate supplies the aggregation engine, change tracking and sync
//! reconciliation, the filter-to-SQL compiler, cross-process write
//! serialisation, the transient presence overlay, and the out-of-band
//! key/value side store. All database access is wrapped in
//! [`tokio_rusqlite`] so it runs off the async runtime's threads.

mod aggregate;
mod compile;
mod db;
mod encode;
mod mutex;
mod oob;
mod reader;
mod schema;
mod store;
mod sync;
mod tables;
mod transient;
mod writer;

pub mod error;
pub mod notify;

pub use error::{Error, Result};
pub use notify::ChangeNotification;
pub use oob::OobValue;
pub use reader::ContactChanges;
pub use store::{ContactsStore, StoreConfig};
pub use sync::{ConflictPolicy, SyncFetchResult};

#[cfg(test)]
mod tests;
