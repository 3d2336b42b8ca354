//! Linkstash Core Library
//!
//! This crate provides the core functionality for linkstash, a bookmark
//! store that keeps a local cache consistent with a durable backing store.
//!
//! # Architecture
//!
//! - **Durable store**: source of truth, compare-and-swap writes on a
//!   store-wide revision counter (JSON document or SQLite)
//! - **Local cache**: in-memory mirror plus a journal of local operations
//!   the store has not confirmed yet
//! - **Merge engine**: pulls store changes, pushes journaled ones, resolves
//!   conflicts and reports every resolution
//!
//! Writes are staged locally and never wait for the store; syncs run on
//! demand or from a background task.
//!
//! # Quick Start
//!
//! ```text
//! let stash = Stash::open()?;
//!
//! // Add a bookmark
//! stash.add(Candidate::new("https://example.com").with_tags(["rust"]), AddOptions::default())?;
//!
//! // Query bookmarks (served from the cache)
//! let bookmarks = stash.list_by_tag("rust");
//!
//! // Push to the store
//! let report = stash.reconcile()?;
//! ```
//!
//! # Modules
//!
//! - `stash`: Unified interface (main entry point)
//! - `models`: Bookmark records, candidates and edits
//! - `storage`: Durable store trait and backends
//! - `cache`: Local cache and sync journal
//! - `merge`: Reconciliation and compaction
//! - `sync`: Session coordination, retries, background task
//! - `fuzzy`: Near-duplicate detection
//! - `enrich`: Metadata enrichment seam
//! - `import`: Text and JSON link import
//! - `config`: Application configuration

pub mod cache;
pub mod config;
pub mod enrich;
pub mod fuzzy;
pub mod import;
pub mod merge;
pub mod models;
pub mod stash;
pub mod storage;
pub mod sync;

pub use cache::{CacheError, LocalCache, OpKind, RecoveryReport, StageOp};
pub use config::{Backend, Config};
pub use enrich::{EnrichError, EnrichReport, EnrichStatus, Enricher, Enrichment};
pub use fuzzy::Match;
pub use import::{ImportFormat, Importer, JsonImporter, TextImporter};
pub use merge::{CancelToken, CompactionReport, ConflictRecord, MergeReport};
pub use models::{Bookmark, BookmarkEdit, BookmarkId, Candidate, Revision};
pub use stash::{AddOptions, AddOutcome, Analysis, ImportSummary, Stash};
pub use storage::{DurableStore, StoreError};
pub use sync::{SessionOutcome, SyncCoordinator, SyncPhase};
