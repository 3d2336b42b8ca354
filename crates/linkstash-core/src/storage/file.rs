//! File-backed durable store
//!
//! Keeps the whole store as one JSON document keyed by id. Every call takes
//! an exclusive lock file so separate processes (CLI, REPL, background sync)
//! see each other's writes, and every rewrite is atomic (write to temp
//! file, then rename). Before a rewrite the previous document is copied to
//! a timestamped backup.
//!
//! Files (under `Config::data_dir`):
//! - `store.json` - The store document
//! - `store.lock` - Held for the duration of each call
//! - `backups/store-<timestamp>.json` - Copies taken before each rewrite

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{Bookmark, BookmarkId, Revision};
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::table::BookmarkTable;
use crate::storage::DurableStore;

/// A lock file older than this is left over from a crashed process
const STALE_LOCK_AGE: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the lock file
const LOCK_POLL: Duration = Duration::from_millis(10);

/// On-disk location of a file store
#[derive(Debug, Clone)]
struct Location {
    path: PathBuf,
    lock_path: PathBuf,
    backup_dir: PathBuf,
    lock_timeout: Duration,
    backup_retention: usize,
}

/// Durable store backed by a single JSON document
///
/// `FileStore::new()` keeps the table in memory only.
pub struct FileStore {
    location: Option<Location>,
    table: Mutex<BookmarkTable>,
}

impl FileStore {
    /// In-memory store (nothing touches disk)
    pub fn new() -> Self {
        Self {
            location: None,
            table: Mutex::new(BookmarkTable::default()),
        }
    }

    /// Store at the locations given by the configuration
    pub fn open(config: &Config) -> StoreResult<Self> {
        let path = config.store_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::from_io(e, parent.to_path_buf()))?;
        }

        let store = Self {
            location: Some(Location {
                lock_path: config.store_lock_path(),
                backup_dir: config.backup_dir(),
                lock_timeout: config.store_timeout(),
                backup_retention: config.backup_retention,
                path,
            }),
            table: Mutex::new(BookmarkTable::default()),
        };

        // Surface a corrupt document at open rather than on first use
        store.read(|_| Ok(()))?;
        Ok(store)
    }

    /// Path of the store document, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.location.as_ref().map(|l| l.path.as_path())
    }

    /// Run a read-only operation against the current table
    fn read<T>(&self, f: impl FnOnce(&BookmarkTable) -> StoreResult<T>) -> StoreResult<T> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ref location) = self.location else {
            return f(&table);
        };

        let _lock = LockFile::acquire(&location.lock_path, location.lock_timeout)?;
        *table = load_table(&location.path)?;
        f(&table)
    }

    /// Run a mutating operation; the table is persisted only if it succeeds
    fn write<T>(&self, f: impl FnOnce(&mut BookmarkTable) -> StoreResult<T>) -> StoreResult<T> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ref location) = self.location else {
            let mut scratch = table.clone();
            let value = f(&mut scratch)?;
            *table = scratch;
            return Ok(value);
        };

        let _lock = LockFile::acquire(&location.lock_path, location.lock_timeout)?;
        let mut scratch = load_table(&location.path)?;
        let value = f(&mut scratch)?;

        backup_document(location)?;
        let bytes = serde_json::to_vec_pretty(&scratch)?;
        atomic_write(&location.path, &bytes)?;
        *table = scratch;
        Ok(value)
    }

    /// List backup files, oldest first
    pub fn backups(&self) -> StoreResult<Vec<PathBuf>> {
        match self.location {
            Some(ref location) => list_backups(&location.backup_dir),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DurableStore for FileStore {
    fn backend(&self) -> &'static str {
        if self.location.is_some() {
            "file"
        } else {
            "memory"
        }
    }

    fn get(&self, id: BookmarkId) -> StoreResult<Bookmark> {
        self.read(|table| table.get(id))
    }

    fn get_by_url(&self, url: &str) -> StoreResult<Bookmark> {
        self.read(|table| table.get_by_url(url))
    }

    fn put(&self, bookmark: &Bookmark, expected: Revision) -> StoreResult<Bookmark> {
        self.write(|table| table.put(bookmark, expected, Utc::now()))
    }

    fn delete(&self, id: BookmarkId, expected: Revision) -> StoreResult<Bookmark> {
        self.write(|table| table.delete(id, expected, Utc::now()))
    }

    fn list(&self, since: Revision) -> StoreResult<Vec<Bookmark>> {
        self.read(|table| Ok(table.list(since)))
    }

    fn head_revision(&self) -> StoreResult<Revision> {
        self.read(|table| Ok(table.head_revision))
    }

    fn purge(&self, ids: &[BookmarkId]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.write(|table| table.purge(ids))
    }
}

/// Exclusive lock file, removed on drop
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: &Path, timeout: Duration) -> StoreResult<Self> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(path) {
                        warn!("Removing stale store lock {:?}", path);
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(StoreError::timeout("store lock", timeout));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(StoreError::from_io(e, path.to_path_buf())),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Load the table from disk; a missing document is an empty store
fn load_table(path: &Path) -> StoreResult<BookmarkTable> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BookmarkTable::default()),
        Err(e) => return Err(StoreError::from_io(e, path.to_path_buf())),
    };

    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        details: e.to_string(),
    })
}

/// Copy the current document to a timestamped backup and prune old copies
fn backup_document(location: &Location) -> StoreResult<()> {
    if !location.path.exists() || location.backup_retention == 0 {
        return Ok(());
    }

    fs::create_dir_all(&location.backup_dir)
        .map_err(|e| StoreError::from_io(e, location.backup_dir.clone()))?;

    let name = format!("store-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
    let backup_path = location.backup_dir.join(name);
    fs::copy(&location.path, &backup_path).map_err(|e| StoreError::from_io(e, backup_path.clone()))?;
    debug!("Backed up store document to {:?}", backup_path);

    let backups = list_backups(&location.backup_dir)?;
    let excess = backups.len().saturating_sub(location.backup_retention);
    for old in backups.iter().take(excess) {
        if let Err(e) = fs::remove_file(old) {
            warn!("Failed to remove old backup {:?}: {}", old, e);
        }
    }

    Ok(())
}

fn list_backups(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::from_io(e, dir.to_path_buf())),
    };

    let mut backups: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("store-") && n.ends_with(".json"))
        })
        .collect();
    // Timestamped names sort chronologically
    backups.sort();
    Ok(backups)
}

/// Write data to a file atomically
///
/// 1. Write to a temporary file in the same directory
/// 2. Sync the file to disk
/// 3. Rename the temp file to the target path
///
/// This ensures the target file is never left in a partially-written state.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::from_io(e, parent.to_path_buf()))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file =
        File::create(&temp_path).map_err(|e| StoreError::from_io(e, temp_path.clone()))?;
    file.write_all(data)
        .map_err(|e| StoreError::from_io(e, temp_path.clone()))?;
    file.sync_all()
        .map_err(|e| StoreError::from_io(e, temp_path.clone()))?;

    fs::rename(&temp_path, path).map_err(|source| StoreError::AtomicWriteFailed {
        from: temp_path.clone(),
        to: path.to_path_buf(),
        source,
    })?;

    Ok(())
}
