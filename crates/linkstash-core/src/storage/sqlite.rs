//! SQLite-backed durable store
//!
//! ## Tables
//!
//! - `bookmarks` - Records, tombstones included
//! - `bookmark_tags` - Tag set per bookmark
//! - `store_meta` - Schema version and the store-wide revision counter
//!
//! Writes run in `BEGIN IMMEDIATE` transactions, so the revision check and
//! the increment happen under the database write lock. The connection's
//! busy timeout is the per-call timeout; a busy or locked database surfaces
//! as `StoreError::Transient`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::config::Config;
use crate::models::{validate_url, Bookmark, BookmarkId, Revision};
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::schema::{init_schema, needs_init};
use crate::storage::DurableStore;

const SELECT_BOOKMARK: &str = "SELECT id, url, label, description, revision, deleted, created_at, updated_at FROM bookmarks";

/// Durable store backed by an embedded SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database at the configured location
    pub fn open(config: &Config) -> StoreResult<Self> {
        let path = config.sqlite_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(&path).map_err(classify)?;
        conn.busy_timeout(config.store_timeout())?;
        Self::prepare(conn, Some(path))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::prepare(Connection::open_in_memory()?, None)
    }

    fn prepare(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        if needs_init(&conn) {
            init_schema(&conn).map_err(classify)?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn).map_err(classify_store)
    }

    /// Run `f` in an immediate transaction; commits only on success
    fn write<T>(&self, f: impl FnOnce(&Transaction) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result: StoreResult<T> = (|| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })();
        result.map_err(classify_store)
    }
}

impl DurableStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, id: BookmarkId) -> StoreResult<Bookmark> {
        self.read(|conn| load(conn, id)?.ok_or_else(|| StoreError::not_found_id(id)))
    }

    fn get_by_url(&self, url: &str) -> StoreResult<Bookmark> {
        self.read(|conn| {
            live_by_url(conn, url)?
                .map(|id| load(conn, id))
                .transpose()?
                .flatten()
                .ok_or_else(|| StoreError::not_found_url(url))
        })
    }

    fn put(&self, bookmark: &Bookmark, expected: Revision) -> StoreResult<Bookmark> {
        validate_url(&bookmark.url).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        if bookmark.deleted {
            return Err(StoreError::InvalidRecord(format!(
                "bookmark {} is a tombstone; use delete",
                bookmark.id
            )));
        }

        self.write(|tx| {
            let now = Utc::now();

            if bookmark.id.is_provisional() {
                if expected != 0 {
                    return Err(StoreError::InvalidRecord(format!(
                        "insert of {} must expect revision 0, got {}",
                        bookmark.url, expected
                    )));
                }
                if let Some(existing) = live_by_url(tx, &bookmark.url)? {
                    return Err(StoreError::DuplicateUrl {
                        url: bookmark.url.clone(),
                        existing,
                    });
                }

                let revision = next_revision(tx)?;
                tx.execute(
                    "INSERT INTO bookmarks (url, label, description, revision, deleted, created_at, updated_at)
                     VALUES (?, ?, ?, ?, 0, ?, ?)",
                    params![
                        bookmark.url,
                        bookmark.label,
                        bookmark.description,
                        revision as i64,
                        now.timestamp_millis(),
                        now.timestamp_millis(),
                    ],
                )?;
                let id = BookmarkId(tx.last_insert_rowid());
                replace_tags(tx, id, &bookmark.tags)?;
                return load(tx, id)?.ok_or_else(|| StoreError::not_found_id(id));
            }

            let current = load(tx, bookmark.id)?.ok_or_else(|| StoreError::not_found_id(bookmark.id))?;
            if current.deleted || current.revision != expected {
                return Err(StoreError::Conflict {
                    expected,
                    current: Box::new(current),
                });
            }
            if let Some(other) = live_by_url(tx, &bookmark.url)? {
                if other != bookmark.id {
                    return Err(StoreError::DuplicateUrl {
                        url: bookmark.url.clone(),
                        existing: other,
                    });
                }
            }

            let revision = next_revision(tx)?;
            tx.execute(
                "UPDATE bookmarks SET url = ?, label = ?, description = ?, revision = ?, updated_at = ? WHERE id = ?",
                params![
                    bookmark.url,
                    bookmark.label,
                    bookmark.description,
                    revision as i64,
                    now.timestamp_millis(),
                    bookmark.id.get(),
                ],
            )?;
            replace_tags(tx, bookmark.id, &bookmark.tags)?;
            load(tx, bookmark.id)?.ok_or_else(|| StoreError::not_found_id(bookmark.id))
        })
    }

    fn delete(&self, id: BookmarkId, expected: Revision) -> StoreResult<Bookmark> {
        self.write(|tx| {
            let current = load(tx, id)?.ok_or_else(|| StoreError::not_found_id(id))?;
            if current.deleted || current.revision != expected {
                return Err(StoreError::Conflict {
                    expected,
                    current: Box::new(current),
                });
            }

            let revision = next_revision(tx)?;
            tx.execute(
                "UPDATE bookmarks SET deleted = 1, revision = ?, updated_at = ? WHERE id = ?",
                params![revision as i64, Utc::now().timestamp_millis(), id.get()],
            )?;
            load(tx, id)?.ok_or_else(|| StoreError::not_found_id(id))
        })
    }

    fn list(&self, since: Revision) -> StoreResult<Vec<Bookmark>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("{} WHERE revision > ? ORDER BY revision ASC", SELECT_BOOKMARK))?;
            let rows = stmt.query_map(params![since as i64], read_row)?;

            let mut bookmarks = Vec::new();
            for row in rows {
                let mut bookmark = row?;
                bookmark.tags = load_tags(conn, bookmark.id)?;
                bookmarks.push(bookmark);
            }
            Ok(bookmarks)
        })
    }

    fn head_revision(&self) -> StoreResult<Revision> {
        self.read(head_revision)
    }

    fn purge(&self, ids: &[BookmarkId]) -> StoreResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.write(|tx| {
            for id in ids {
                let live: Option<bool> = tx
                    .query_row(
                        "SELECT deleted = 0 FROM bookmarks WHERE id = ?",
                        params![id.get()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if live == Some(true) {
                    return Err(StoreError::InvalidRecord(format!(
                        "refusing to purge live bookmark {}",
                        id
                    )));
                }
            }

            let mut purged = 0;
            for id in ids {
                tx.execute("DELETE FROM bookmark_tags WHERE bookmark_id = ?", params![id.get()])?;
                purged += tx.execute("DELETE FROM bookmarks WHERE id = ?", params![id.get()])?;
            }
            Ok(purged)
        })
    }
}

// ==================== Helpers ====================

/// Map a busy or locked database to a transient error
fn classify(error: rusqlite::Error) -> StoreError {
    classify_store(StoreError::Database(error))
}

fn classify_store(error: StoreError) -> StoreError {
    match error {
        StoreError::Database(ref e) if error.is_retryable() => StoreError::Transient {
            details: e.to_string(),
        },
        other => other,
    }
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<Bookmark> {
    let revision: i64 = row.get(4)?;
    let created_at: i64 = row.get(6)?;
    let updated_at: i64 = row.get(7)?;
    Ok(Bookmark {
        id: BookmarkId(row.get(0)?),
        url: row.get(1)?,
        label: row.get(2)?,
        description: row.get(3)?,
        tags: BTreeSet::new(),
        revision: revision as Revision,
        deleted: row.get(5)?,
        created_at: timestamp(created_at),
        updated_at: timestamp(updated_at),
    })
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn load(conn: &Connection, id: BookmarkId) -> StoreResult<Option<Bookmark>> {
    let bookmark = conn
        .query_row(
            &format!("{} WHERE id = ?", SELECT_BOOKMARK),
            params![id.get()],
            read_row,
        )
        .optional()?;

    match bookmark {
        Some(mut bookmark) => {
            bookmark.tags = load_tags(conn, id)?;
            Ok(Some(bookmark))
        }
        None => Ok(None),
    }
}

fn load_tags(conn: &Connection, id: BookmarkId) -> StoreResult<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM bookmark_tags WHERE bookmark_id = ?")?;
    let tags = stmt
        .query_map(params![id.get()], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;
    Ok(tags)
}

fn live_by_url(conn: &Connection, url: &str) -> StoreResult<Option<BookmarkId>> {
    let id = conn
        .query_row(
            "SELECT id FROM bookmarks WHERE url = ? AND deleted = 0",
            params![url],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(id.map(BookmarkId))
}

fn replace_tags(tx: &Transaction, id: BookmarkId, tags: &BTreeSet<String>) -> StoreResult<()> {
    tx.execute("DELETE FROM bookmark_tags WHERE bookmark_id = ?", params![id.get()])?;
    let mut stmt = tx.prepare("INSERT INTO bookmark_tags (bookmark_id, tag) VALUES (?, ?)")?;
    for tag in tags {
        stmt.execute(params![id.get(), tag])?;
    }
    Ok(())
}

fn head_revision(conn: &Connection) -> StoreResult<Revision> {
    let value: String = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'head_revision'",
        [],
        |row| row.get(0),
    )?;
    value.parse().map_err(|_| StoreError::InvalidRecord(format!("bad head_revision '{}'", value)))
}

fn next_revision(tx: &Transaction) -> StoreResult<Revision> {
    let next = head_revision(tx)? + 1;
    tx.execute(
        "UPDATE store_meta SET value = ? WHERE key = 'head_revision'",
        params![next.to_string()],
    )?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn draft(url: &str) -> Bookmark {
        let mut bookmark = Bookmark::new(BookmarkId::provisional(1), url);
        bookmark.add_tag("rust");
        bookmark
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stored = store.put(&draft("https://rust-lang.org"), 0).unwrap();

        assert_eq!(stored.id, BookmarkId(1));
        assert_eq!(stored.revision, 1);
        assert!(stored.tags.contains("rust"));

        let by_url = store.get_by_url("https://rust-lang.org").unwrap();
        assert_eq!(by_url, stored);
    }

    #[test]
    fn test_compare_and_swap() {
        let store = SqliteStore::open_in_memory().unwrap();
        let stored = store.put(&draft("https://a.com"), 0).unwrap();

        let mut edit = stored.clone();
        edit.label = "A".to_string();
        edit.tags.clear();
        let updated = store.put(&edit, stored.revision).unwrap();
        assert_eq!(updated.revision, 2);
        assert!(updated.tags.is_empty());

        match store.put(&edit, stored.revision) {
            Err(StoreError::Conflict { current, .. }) => assert_eq!(current.revision, 2),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_url_carries_existing_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.put(&draft("https://a.com"), 0).unwrap();

        match store.put(&draft("https://a.com"), 0) {
            Err(StoreError::DuplicateUrl { existing, .. }) => assert_eq!(existing, a.id),
            other => panic!("expected DuplicateUrl, got {other:?}"),
        }

        let b = store.put(&draft("https://b.com"), 0).unwrap();
        let mut b_edit = b.clone();
        b_edit.url = a.url.clone();
        assert!(matches!(
            store.put(&b_edit, b.revision),
            Err(StoreError::DuplicateUrl { .. })
        ));
    }

    #[test]
    fn test_tombstones_and_purge() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.put(&draft("https://a.com"), 0).unwrap();
        let tomb = store.delete(a.id, a.revision).unwrap();
        assert!(tomb.deleted);
        assert_eq!(tomb.revision, 2);

        assert!(matches!(
            store.put(&a, tomb.revision),
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            store.get_by_url("https://a.com"),
            Err(StoreError::NotFound { .. })
        ));

        // The URL may be reused by a new record while the tombstone remains
        let again = store.put(&draft("https://a.com"), 0).unwrap();
        assert!(store.purge(&[again.id]).is_err());
        assert_eq!(store.purge(&[a.id]).unwrap(), 1);
        assert!(matches!(store.get(a.id), Err(StoreError::NotFound { .. })));

        // Ids are never reused
        let c = store.put(&draft("https://c.com"), 0).unwrap();
        assert_eq!(c.id, BookmarkId(3));
    }

    #[test]
    fn test_list_since_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.put(&draft("https://a.com"), 0).unwrap();
        store.put(&draft("https://b.com"), 0).unwrap();
        store.delete(a.id, a.revision).unwrap();

        let all = store.list(0).unwrap();
        assert_eq!(
            all.iter().map(|b| b.revision).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(all[1].deleted);
        assert_eq!(store.list(2).unwrap().len(), 1);
        assert_eq!(store.head_revision().unwrap(), 3);
    }

    #[test]
    fn test_persists_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        };

        {
            let store = SqliteStore::open(&config).unwrap();
            store.put(&draft("https://a.com"), 0).unwrap();
        }

        let store = SqliteStore::open(&config).unwrap();
        assert_eq!(store.head_revision().unwrap(), 1);
        assert_eq!(store.get(BookmarkId(1)).unwrap().url, "https://a.com");
        assert_eq!(store.path(), Some(config.sqlite_path().as_path()));
    }

    #[test]
    fn test_busy_database_is_transient() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            store_timeout_ms: 50,
            ..Config::default()
        };
        let store = SqliteStore::open(&config).unwrap();

        let mut other = Connection::open(config.sqlite_path()).unwrap();
        let tx = other
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .unwrap();

        let err = store.put(&draft("https://a.com"), 0).unwrap_err();
        assert!(matches!(err, StoreError::Transient { .. }));
        assert!(err.is_retryable());

        tx.rollback().unwrap();
        assert!(store.put(&draft("https://a.com"), 0).is_ok());
    }
}
