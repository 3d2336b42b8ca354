//! In-memory bookmark table with compare-and-swap writes
//!
//! This is the serialized form of the file store document and the place
//! where the durable-store rules live for it: store-assigned ids, one
//! store-wide revision counter, unique URLs among live records, and
//! tombstones that can never be revived by a write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{validate_url, Bookmark, BookmarkId, Revision};
use crate::storage::error::{StoreError, StoreResult};

/// All records of a store, keyed by id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookmarkTable {
    /// Highest revision handed out
    #[serde(default)]
    pub head_revision: Revision,
    /// Next id to assign
    #[serde(default = "first_id")]
    pub next_id: i64,
    /// Records, including tombstones
    #[serde(default)]
    pub bookmarks: BTreeMap<BookmarkId, Bookmark>,
}

fn first_id() -> i64 {
    1
}

impl Default for BookmarkTable {
    fn default() -> Self {
        Self {
            head_revision: 0,
            next_id: first_id(),
            bookmarks: BTreeMap::new(),
        }
    }
}

impl BookmarkTable {
    pub fn get(&self, id: BookmarkId) -> StoreResult<Bookmark> {
        self.bookmarks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found_id(id))
    }

    /// Live record with exactly this URL
    pub fn get_by_url(&self, url: &str) -> StoreResult<Bookmark> {
        self.live_by_url(url)
            .cloned()
            .ok_or_else(|| StoreError::not_found_url(url))
    }

    fn live_by_url(&self, url: &str) -> Option<&Bookmark> {
        self.bookmarks
            .values()
            .find(|b| !b.deleted && b.url == url)
    }

    /// Insert (provisional id, expected 0) or compare-and-swap update
    pub fn put(
        &mut self,
        bookmark: &Bookmark,
        expected: Revision,
        now: DateTime<Utc>,
    ) -> StoreResult<Bookmark> {
        validate_url(&bookmark.url).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        if bookmark.deleted {
            return Err(StoreError::InvalidRecord(format!(
                "bookmark {} is a tombstone; use delete",
                bookmark.id
            )));
        }

        if bookmark.id.is_provisional() {
            return self.insert(bookmark, expected, now);
        }

        let current = self.get(bookmark.id)?;
        if current.deleted || current.revision != expected {
            return Err(StoreError::Conflict {
                expected,
                current: Box::new(current),
            });
        }
        if let Some(other) = self.live_by_url(&bookmark.url) {
            if other.id != bookmark.id {
                return Err(StoreError::DuplicateUrl {
                    url: bookmark.url.clone(),
                    existing: other.id,
                });
            }
        }

        self.head_revision += 1;
        let mut stored = bookmark.clone();
        stored.revision = self.head_revision;
        stored.created_at = current.created_at;
        stored.updated_at = now;
        self.bookmarks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn insert(
        &mut self,
        bookmark: &Bookmark,
        expected: Revision,
        now: DateTime<Utc>,
    ) -> StoreResult<Bookmark> {
        if expected != 0 {
            return Err(StoreError::InvalidRecord(format!(
                "insert of {} must expect revision 0, got {}",
                bookmark.url, expected
            )));
        }
        if let Some(existing) = self.live_by_url(&bookmark.url) {
            return Err(StoreError::DuplicateUrl {
                url: bookmark.url.clone(),
                existing: existing.id,
            });
        }

        let id = BookmarkId(self.next_id);
        self.next_id += 1;
        self.head_revision += 1;

        let mut stored = bookmark.clone();
        stored.id = id;
        stored.revision = self.head_revision;
        stored.created_at = now;
        stored.updated_at = now;
        self.bookmarks.insert(id, stored.clone());
        Ok(stored)
    }

    /// Compare-and-swap tombstone
    pub fn delete(
        &mut self,
        id: BookmarkId,
        expected: Revision,
        now: DateTime<Utc>,
    ) -> StoreResult<Bookmark> {
        let current = self.get(id)?;
        if current.deleted || current.revision != expected {
            return Err(StoreError::Conflict {
                expected,
                current: Box::new(current),
            });
        }

        self.head_revision += 1;
        let mut stored = current;
        stored.deleted = true;
        stored.revision = self.head_revision;
        stored.updated_at = now;
        self.bookmarks.insert(id, stored.clone());
        Ok(stored)
    }

    /// Records with revision greater than `since`, ascending by revision
    pub fn list(&self, since: Revision) -> Vec<Bookmark> {
        let mut records: Vec<Bookmark> = self
            .bookmarks
            .values()
            .filter(|b| b.revision > since)
            .cloned()
            .collect();
        records.sort_by_key(|b| b.revision);
        records
    }

    /// Physically remove tombstones; live records are refused
    pub fn purge(&mut self, ids: &[BookmarkId]) -> StoreResult<usize> {
        if let Some(live) = ids
            .iter()
            .filter_map(|id| self.bookmarks.get(id))
            .find(|b| !b.deleted)
        {
            return Err(StoreError::InvalidRecord(format!(
                "refusing to purge live bookmark {}",
                live.id
            )));
        }

        Ok(ids
            .iter()
            .filter(|id| self.bookmarks.remove(id).is_some())
            .count())
    }
}
