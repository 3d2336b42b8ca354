//! Append-only sync journal
//!
//! One JSON object per line, appended and fsynced before a staged write is
//! acknowledged. Each line names the operation kind, a snapshot of the
//! bookmark as the caller wanted it, and the local sequence number.
//! `snapshot.revision` is the store revision the edit was made against.
//!
//! Lines that cannot be parsed are moved to a side file for manual
//! inspection and reported; they never stop the rest of the journal loading.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::models::Bookmark;
use crate::storage::StoreError;

/// Errors that can occur during journal operations
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("journal serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl JournalError {
    fn io(path: &Path, source: io::Error) -> Self {
        JournalError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<JournalError> for StoreError {
    fn from(error: JournalError) -> Self {
        match error {
            JournalError::Io { path, source } => StoreError::from_io(source, path),
            JournalError::Json(e) => StoreError::Serialization(e),
        }
    }
}

/// Kind of a pending local operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Insert => write!(f, "insert"),
            OpKind::Update => write!(f, "update"),
            OpKind::Delete => write!(f, "delete"),
        }
    }
}

/// One journaled operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub kind: OpKind,
    pub snapshot: Bookmark,
    /// Insert explicitly confirmed despite near-duplicates
    #[serde(default)]
    pub confirmed: bool,
}

/// A journal line that could not be parsed
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptEntry {
    /// 1-based line number in the journal file
    pub line: usize,
    pub content: String,
    pub reason: String,
}

impl fmt::Display for CorruptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "journal line {}: {}", self.line, self.reason)
    }
}

/// Result of loading a journal from disk
#[derive(Debug, Default)]
pub struct JournalLoad {
    pub entries: Vec<JournalEntry>,
    pub corrupt: Vec<CorruptEntry>,
}

/// The journal file, or nothing for an in-memory cache
pub struct Journal {
    path: Option<PathBuf>,
    rejected_path: Option<PathBuf>,
    file: Option<File>,
}

impl Journal {
    /// Journal that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            rejected_path: None,
            file: None,
        }
    }

    /// Open (or create) the journal at `path`
    ///
    /// Corrupt lines are appended to `rejected_path` and dropped from the
    /// journal file.
    pub fn open(path: &Path, rejected_path: &Path) -> Result<(Self, JournalLoad), JournalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| JournalError::io(parent, e))?;
        }

        let load = if path.exists() {
            read_entries(path)?
        } else {
            JournalLoad::default()
        };

        let mut journal = Self {
            path: Some(path.to_path_buf()),
            rejected_path: Some(rejected_path.to_path_buf()),
            file: None,
        };

        if !load.corrupt.is_empty() {
            journal.reject(&load.corrupt)?;
            journal.rewrite(&load.entries)?;
        }
        journal.file = Some(open_append(path)?);

        Ok((journal, load))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one entry and sync it to disk
    ///
    /// Reopens the file if a failed rewrite left no handle behind.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let mut file = match self.file.take() {
            Some(file) => file,
            None => open_append(path)?,
        };

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json).map_err(|e| JournalError::io(path, e))?;
        file.sync_all().map_err(|e| JournalError::io(path, e))?;
        self.file = Some(file);
        Ok(())
    }

    /// Replace the journal contents atomically
    pub fn rewrite(&mut self, entries: &[JournalEntry]) -> Result<(), JournalError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let tmp_path = path.with_extension("jsonl.tmp");
        let mut tmp_file = File::create(&tmp_path).map_err(|e| JournalError::io(&tmp_path, e))?;
        for entry in entries {
            let json = serde_json::to_string(entry)?;
            writeln!(tmp_file, "{}", json).map_err(|e| JournalError::io(&tmp_path, e))?;
        }
        tmp_file
            .sync_all()
            .map_err(|e| JournalError::io(&tmp_path, e))?;

        // Drop the append handle before the rename replaces the file
        self.file = None;
        fs::rename(&tmp_path, &path).map_err(|e| JournalError::io(&path, e))?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.file = Some(open_append(&path)?);
        Ok(())
    }

    /// Set corrupt lines aside for manual inspection
    fn reject(&self, corrupt: &[CorruptEntry]) -> Result<(), JournalError> {
        let Some(ref rejected_path) = self.rejected_path else {
            return Ok(());
        };

        let mut file = open_append(rejected_path)?;
        for entry in corrupt {
            warn!("Setting aside corrupt {}", entry);
            writeln!(file, "{}", entry.content).map_err(|e| JournalError::io(rejected_path, e))?;
        }
        file.sync_all()
            .map_err(|e| JournalError::io(rejected_path, e))?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, JournalError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| JournalError::io(path, e))
}

/// Read all entries in sequence order, separating out unparseable lines
fn read_entries(path: &Path) -> Result<JournalLoad, JournalError> {
    let file = File::open(path).map_err(|e| JournalError::io(path, e))?;
    let reader = BufReader::new(file);
    let mut load = JournalLoad::default();

    for (index, line) in reader.split(b'\n').enumerate() {
        let bytes = line.map_err(|e| JournalError::io(path, e))?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        if content.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<JournalEntry>(&content) {
            Ok(entry) => load.entries.push(entry),
            Err(e) => load.corrupt.push(CorruptEntry {
                line: index + 1,
                content,
                reason: e.to_string(),
            }),
        }
    }

    load.entries.sort_by_key(|e| e.seq);
    Ok(load)
}
