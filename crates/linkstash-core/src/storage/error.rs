//! Storage error handling
//!
//! Typed errors for durable store operations, classified by how a caller
//! recovers from them:
//!
//! - `NotFound`, `Conflict`, `DuplicateUrl`: outcomes the merge engine resolves
//! - `Transient`: retried with backoff by the sync coordinator
//! - everything else: fatal, surfaced immediately with the journal left intact

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::{Bookmark, BookmarkId, Revision};

/// Errors that can occur during durable store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record for the given id or URL
    #[error("No bookmark found for {key}")]
    NotFound { key: String },

    /// Revision mismatch on a compare-and-swap write
    #[error("Revision conflict on bookmark {}: expected revision {expected}, store has {}", .current.id, .current.revision)]
    Conflict {
        expected: Revision,
        current: Box<Bookmark>,
    },

    /// Insert would duplicate the URL of a live record
    #[error("URL '{url}' already stored as bookmark {existing}")]
    DuplicateUrl { url: String, existing: BookmarkId },

    /// The record is not acceptable to the store
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Temporary failure (lock timeout, busy database, interrupted I/O)
    #[error("Store temporarily unavailable: {details}")]
    Transient { details: String },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Store document cannot be parsed
    #[error("Store document at '{path}' is corrupted: {details}")]
    Corrupt { path: PathBuf, details: String },

    /// Atomic write failed during rename
    #[error("Atomic write failed: could not rename '{from}' to '{to}': {source}")]
    AtomicWriteFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Other I/O failure with path context
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full,
    /// interrupted, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                StoreError::Transient {
                    details: format!("{}: {}", path.display(), error),
                }
            }
            _ if is_disk_full_error(&error) => StoreError::DiskFull {
                path,
                source: error,
            },
            _ => StoreError::Io {
                path,
                source: error,
            },
        }
    }

    /// Lock or call timeout
    pub fn timeout(what: &str, after: Duration) -> Self {
        StoreError::Transient {
            details: format!("timed out after {}ms waiting for {}", after.as_millis(), what),
        }
    }

    pub fn not_found_id(id: BookmarkId) -> Self {
        StoreError::NotFound {
            key: format!("id {}", id),
        }
    }

    pub fn not_found_url(url: &str) -> Self {
        StoreError::NotFound {
            key: format!("url {}", url),
        }
    }

    /// Whether the sync coordinator should retry after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transient { .. } => true,
            StoreError::Database(e) => is_busy(e),
            _ => false,
        }
    }

    /// Whether this error must abort the current operation
    ///
    /// Record-level outcomes (not found, conflict, duplicate URL, invalid
    /// record) and retryable errors are not fatal.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
            && !matches!(
                self,
                StoreError::NotFound { .. }
                    | StoreError::Conflict { .. }
                    | StoreError::DuplicateUrl { .. }
                    | StoreError::InvalidRecord(_)
            )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::DiskFull { .. } => Some("Free up disk space and try again."),
            StoreError::PermissionDenied { .. } => {
                Some("Check file and directory permissions. You may need to run with different permissions or change ownership.")
            }
            StoreError::Corrupt { .. } => {
                Some("Timestamped backups are kept in the data directory under 'backups/'. Restore the newest good copy.")
            }
            StoreError::Transient { .. } => {
                Some("Another process may be holding the store. Pending changes stay in the journal and will be retried.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Check if a SQLite error is a busy/locked condition
fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
