//! Storage layer
//!
//! The durable store is the confirmed source of truth. It is reached only
//! through the `DurableStore` trait; the concrete backend is picked once, at
//! construction, from `Config::backend`.
//!
//! ## Contract
//!
//! - Ids are assigned by the store on first insert and never reused
//! - Every mutation takes the next value of one store-wide revision counter
//! - `put`/`delete` are compare-and-swap on the record's revision
//! - URLs are unique among live (non-tombstoned) records
//! - Deletes leave a tombstone until `purge` removes it
//!
//! ## Backends
//!
//! - **file**: one JSON document plus timestamped backups (`FileStore`)
//! - **sqlite**: rusqlite with the bundled engine (`SqliteStore`)

pub mod error;
pub mod file;
pub mod schema;
pub mod sqlite;
mod table;

use std::sync::Arc;

use crate::config::{Backend, Config};
use crate::models::{Bookmark, BookmarkId, Revision};

pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sqlite::SqliteStore;
pub use table::BookmarkTable;

/// Transactional persistence backend
///
/// Implementations synchronize internally; one handle is shared by every
/// caller in the process.
pub trait DurableStore: Send + Sync {
    /// Short backend name for logs and status output
    fn backend(&self) -> &'static str;

    /// Record by id (tombstones included)
    fn get(&self, id: BookmarkId) -> StoreResult<Bookmark>;

    /// Live record with exactly this URL
    fn get_by_url(&self, url: &str) -> StoreResult<Bookmark>;

    /// Insert or compare-and-swap update
    ///
    /// A bookmark with a provisional id and `expected == 0` is an insert and
    /// receives a store id. Otherwise the stored revision must equal
    /// `expected`; on mismatch (or if the record is a tombstone) the call
    /// fails with `Conflict` carrying the current record. Returns the stored
    /// record with its new revision.
    fn put(&self, bookmark: &Bookmark, expected: Revision) -> StoreResult<Bookmark>;

    /// Compare-and-swap tombstone; returns the tombstone with its new revision
    fn delete(&self, id: BookmarkId, expected: Revision) -> StoreResult<Bookmark>;

    /// All records with revision greater than `since`, ascending by revision
    fn list(&self, since: Revision) -> StoreResult<Vec<Bookmark>>;

    /// Highest revision handed out so far
    fn head_revision(&self) -> StoreResult<Revision>;

    /// Physically remove tombstones; refuses live records
    fn purge(&self, ids: &[BookmarkId]) -> StoreResult<usize>;
}

/// Open the durable store selected by the configuration
pub fn open_store(config: &Config) -> StoreResult<Arc<dyn DurableStore>> {
    let store: Arc<dyn DurableStore> = match config.backend {
        Backend::File => Arc::new(FileStore::open(config)?),
        Backend::Sqlite => Arc::new(SqliteStore::open(config)?),
    };
    Ok(store)
}
