//! Local cache
//!
//! An in-memory mirror of the durable store plus the sync journal of local
//! operations the store has not confirmed yet. Callers read and stage
//! against the cache; `stage` journals the operation and applies it to the
//! in-memory view before returning, without touching the store.
//!
//! One `LocalCache` is shared (as `Arc<LocalCache>`) by every caller in the
//! process. The internal lock is held only for in-memory work and journal
//! appends, never across durable store I/O.
//!
//! ## Entry lifecycle
//!
//! - created by a pull from the store or by a staged insert
//! - marked dirty with a pending op by `stage`
//! - made clean again when the merge engine settles the op
//! - removed by compaction once its tombstone is purged

pub mod journal;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fuzzy::DEFAULT_THRESHOLD;
use crate::merge::{self, MergeReport, Outcome};
use crate::models::{validate_url, Bookmark, BookmarkId, Candidate, Revision, ValidationError};
use crate::storage::{DurableStore, StoreError};

pub use journal::{CorruptEntry, Journal, JournalEntry, JournalError, OpKind};

/// Errors raised by local cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("No bookmark {0} in the local cache")]
    NotFound(BookmarkId),

    #[error("Bookmark {0} is deleted")]
    Deleted(BookmarkId),

    #[error("Bookmark {0} is not a pending insert")]
    NotPendingInsert(BookmarkId),

    #[error("Bookmark {0} is being written to the store; try again after the sync")]
    InFlight(BookmarkId),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// A local operation to stage
#[derive(Debug, Clone)]
pub enum StageOp {
    /// Add a new bookmark; `confirmed` means near-duplicates were accepted
    Insert { candidate: Candidate, confirmed: bool },
    /// Replace a bookmark's content
    Update(Bookmark),
    /// Tombstone a bookmark
    Delete(BookmarkId),
}

/// The not-yet-confirmed operation on a cache entry
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOp {
    pub kind: OpKind,
    /// Journal sequence numbers folded into this op, oldest first
    pub seqs: Vec<u64>,
    pub confirmed: bool,
}

/// A cached bookmark and its sync state
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub bookmark: Bookmark,
    pub last_synced_revision: Revision,
    pub pending: Option<PendingOp>,
}

impl CacheEntry {
    fn clean(bookmark: Bookmark) -> Self {
        Self {
            last_synced_revision: bookmark.revision,
            bookmark,
            pending: None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.pending.is_some()
    }
}

/// A dirty entry handed to the merge engine
///
/// The entry stays marked in flight until it is settled or released.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub id: BookmarkId,
    pub kind: OpKind,
    /// Desired state of the record
    pub bookmark: Bookmark,
    /// Store revision the op was made against
    pub base: Revision,
    pub confirmed: bool,
    pub seqs: Vec<u64>,
}

/// Result of replaying the journal at startup
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Per-entry outcomes, in the same shape as a sync pass
    pub replay: MergeReport,
    /// Journal lines that could not be parsed
    pub corrupt: Vec<CorruptEntry>,
    /// Journal entries still pending after the pass
    pub remaining: usize,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.remaining == 0 && self.replay.conflicts.is_empty()
    }
}

struct CacheState {
    entries: BTreeMap<BookmarkId, CacheEntry>,
    watermark: Revision,
    next_seq: u64,
    journal: Journal,
    /// Mirror of the journal file contents, in sequence order
    records: Vec<JournalEntry>,
    in_flight: HashSet<BookmarkId>,
    /// Corrupt lines found at open, reported by the next recovery
    corrupt: Vec<CorruptEntry>,
}

/// In-memory mirror of the durable store with a write-ahead journal
pub struct LocalCache {
    state: Mutex<CacheState>,
    similarity_threshold: f64,
}

impl LocalCache {
    /// Cache without an on-disk journal
    pub fn new() -> Self {
        Self::from_parts(Journal::in_memory(), Vec::new(), Vec::new(), DEFAULT_THRESHOLD)
    }

    /// Cache journaling to the configured data directory
    ///
    /// Entries still in the journal are rebuilt as dirty entries so reads
    /// see them immediately; call `recover` before the first sync.
    pub fn open(config: &Config) -> Result<Self, CacheError> {
        let (journal, load) =
            Journal::open(&config.journal_path(), &config.rejected_journal_path())?;
        if !load.entries.is_empty() {
            info!("Journal holds {} pending operations", load.entries.len());
        }
        Ok(Self::from_parts(
            journal,
            load.entries,
            load.corrupt,
            config.similarity_threshold,
        ))
    }

    fn from_parts(
        journal: Journal,
        records: Vec<JournalEntry>,
        corrupt: Vec<CorruptEntry>,
        similarity_threshold: f64,
    ) -> Self {
        let next_seq = records.iter().map(|r| r.seq).max().unwrap_or(0) + 1;
        let mut state = CacheState {
            entries: BTreeMap::new(),
            watermark: 0,
            next_seq,
            journal,
            records: Vec::new(),
            in_flight: HashSet::new(),
            corrupt,
        };
        state.rebuild(records);

        Self {
            state: Mutex::new(state),
            similarity_threshold,
        }
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==================== Reads ====================

    /// Bookmark by id (tombstones included)
    pub fn read(&self, id: BookmarkId) -> Option<Bookmark> {
        self.lock().entries.get(&id).map(|e| e.bookmark.clone())
    }

    /// Cache entry by id
    pub fn entry(&self, id: BookmarkId) -> Option<CacheEntry> {
        self.lock().entries.get(&id).cloned()
    }

    /// All bookmarks, tombstones included
    pub fn read_all(&self) -> Vec<Bookmark> {
        self.lock()
            .entries
            .values()
            .map(|e| e.bookmark.clone())
            .collect()
    }

    /// All bookmarks that are not deleted
    pub fn read_live(&self) -> Vec<Bookmark> {
        self.lock()
            .entries
            .values()
            .filter(|e| !e.bookmark.deleted)
            .map(|e| e.bookmark.clone())
            .collect()
    }

    /// Entries for deleted bookmarks
    pub fn tombstones(&self) -> Vec<CacheEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.bookmark.deleted)
            .cloned()
            .collect()
    }

    /// Live bookmark with exactly this URL
    pub fn find_by_url(&self, url: &str) -> Option<Bookmark> {
        let url = url.trim();
        self.lock()
            .entries
            .values()
            .find(|e| !e.bookmark.deleted && e.bookmark.url == url)
            .map(|e| e.bookmark.clone())
    }

    /// Highest store revision fully incorporated
    pub fn watermark(&self) -> Revision {
        self.lock().watermark
    }

    /// Journal entries not yet confirmed by the store
    pub fn pending_entries(&self) -> Vec<JournalEntry> {
        self.lock().records.clone()
    }

    /// Entries with a pending op
    pub fn dirty_entries(&self) -> Vec<CacheEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.is_dirty())
            .cloned()
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.lock().records.is_empty()
    }

    // ==================== Local writes ====================

    /// Journal an operation and apply it to the in-memory view
    ///
    /// Returns the bookmark as the cache now sees it. A staged insert gets a
    /// provisional id until the store confirms it.
    pub fn stage(&self, op: StageOp) -> Result<Bookmark, CacheError> {
        let mut state = self.lock();
        match op {
            StageOp::Insert {
                candidate,
                confirmed,
            } => state.stage_insert(&candidate, confirmed),
            StageOp::Update(bookmark) => state.stage_update(bookmark),
            StageOp::Delete(id) => state.stage_delete(id),
        }
    }

    /// Accept a held insert despite its near-duplicates
    pub fn confirm_insert(&self, id: BookmarkId) -> Result<(), CacheError> {
        let mut state = self.lock();
        let seqs = match state.entries.get_mut(&id).and_then(|e| e.pending.as_mut()) {
            Some(pending) if pending.kind == OpKind::Insert => {
                pending.confirmed = true;
                pending.seqs.clone()
            }
            _ => return Err(CacheError::NotPendingInsert(id)),
        };

        for record in state.records.iter_mut().filter(|r| seqs.contains(&r.seq)) {
            record.confirmed = true;
        }
        state.flush()?;
        Ok(())
    }

    /// Fold a held insert into an existing bookmark instead of adding it
    pub fn retarget_insert(
        &self,
        id: BookmarkId,
        target: BookmarkId,
    ) -> Result<Bookmark, CacheError> {
        let mut state = self.lock();
        if state.in_flight.contains(&id) {
            return Err(CacheError::InFlight(id));
        }
        let insert = match state.entries.get(&id) {
            Some(entry) if entry.pending.as_ref().map(|p| p.kind) == Some(OpKind::Insert) => {
                entry.clone()
            }
            _ => return Err(CacheError::NotPendingInsert(id)),
        };
        let mut merged = match state.entries.get(&target) {
            Some(entry) if entry.bookmark.deleted => return Err(CacheError::Deleted(target)),
            Some(entry) => entry.bookmark.clone(),
            None => return Err(CacheError::NotFound(target)),
        };

        state.drop_entry(id)?;
        if !merged.merge_from(&insert.bookmark) {
            return Ok(merged);
        }
        state.stage_update(merged)
    }

    // ==================== Merge engine hooks ====================

    /// Fold store records into the cache
    ///
    /// New ids are inserted and clean entries refreshed; dirty entries are
    /// left for the merge engine. Returns the number of entries changed.
    pub(crate) fn absorb(&self, records: &[Bookmark]) -> usize {
        let mut state = self.lock();
        let mut changed = 0;
        for record in records {
            let replace = match state.entries.get(&record.id) {
                None => true,
                Some(entry) => !entry.is_dirty() && record.revision > entry.last_synced_revision,
            };
            if replace {
                state
                    .entries
                    .insert(record.id, CacheEntry::clean(record.clone()));
                changed += 1;
            }
        }
        changed
    }

    /// Snapshot the dirty entries for a sync pass, in journal order
    pub(crate) fn begin_writes(&self) -> Vec<PendingWrite> {
        let mut state = self.lock();
        let mut writes: Vec<PendingWrite> = state
            .entries
            .values()
            .filter(|e| !state.in_flight.contains(&e.bookmark.id))
            .filter_map(|e| {
                let pending = e.pending.as_ref()?;
                Some(PendingWrite {
                    id: e.bookmark.id,
                    kind: pending.kind,
                    bookmark: e.bookmark.clone(),
                    base: e.last_synced_revision,
                    confirmed: pending.confirmed,
                    seqs: pending.seqs.clone(),
                })
            })
            .collect();
        writes.sort_by_key(|w| w.seqs.first().copied().unwrap_or(0));

        for write in &writes {
            state.in_flight.insert(write.id);
        }
        writes
    }

    /// Give back a write that was not attempted or stays pending
    pub(crate) fn release(&self, id: BookmarkId) {
        self.lock().in_flight.remove(&id);
    }

    /// Record the store's answer to a write
    ///
    /// `stored` is the record as the store now holds it, or `None` if the
    /// record is gone. The journal entries covered by the write are pruned.
    /// Ops staged while the write was in flight stay pending, rebased onto
    /// the stored revision.
    pub(crate) fn settle(
        &self,
        write: &PendingWrite,
        stored: Option<&Bookmark>,
    ) -> Result<(), JournalError> {
        let mut state = self.lock();
        state.in_flight.remove(&write.id);

        let entry = state.entries.remove(&write.id);
        let remaining: Vec<u64> = entry
            .as_ref()
            .and_then(|e| e.pending.as_ref())
            .map(|p| {
                p.seqs
                    .iter()
                    .copied()
                    .filter(|s| !write.seqs.contains(s))
                    .collect()
            })
            .unwrap_or_default();

        let mut prune: HashSet<u64> = write.seqs.iter().copied().collect();
        match (stored, entry) {
            (Some(stored), Some(mut entry)) if !remaining.is_empty() && !stored.deleted => {
                entry.bookmark.id = stored.id;
                entry.bookmark.revision = stored.revision;
                entry.bookmark.created_at = stored.created_at;
                entry.last_synced_revision = stored.revision;
                if let Some(ref mut pending) = entry.pending {
                    pending.seqs = remaining.clone();
                    if pending.kind == OpKind::Insert {
                        pending.kind = OpKind::Update;
                    }
                }
                for record in state.records.iter_mut().filter(|r| remaining.contains(&r.seq)) {
                    record.snapshot.id = stored.id;
                    record.snapshot.revision = stored.revision;
                    if record.kind == OpKind::Insert {
                        record.kind = OpKind::Update;
                    }
                }
                debug!(
                    "Bookmark {} settled at revision {} with {} newer ops pending",
                    stored.id,
                    stored.revision,
                    remaining.len()
                );
                state.entries.insert(stored.id, entry);
            }
            (Some(stored), _) => {
                if !remaining.is_empty() {
                    warn!(
                        "Dropping {} ops staged on bookmark {} after it was deleted",
                        remaining.len(),
                        stored.id
                    );
                }
                prune.extend(remaining);
                state
                    .entries
                    .insert(stored.id, CacheEntry::clean(stored.clone()));
            }
            (None, _) => {
                prune.extend(remaining);
            }
        }

        state.records.retain(|r| !prune.contains(&r.seq));
        state.flush()
    }

    /// Raise the watermark (never lowers it)
    pub(crate) fn advance_watermark(&self, revision: Revision) {
        let mut state = self.lock();
        state.watermark = state.watermark.max(revision);
    }

    /// Forget purged records
    pub(crate) fn remove(&self, ids: &[BookmarkId]) {
        let mut state = self.lock();
        for id in ids {
            state.entries.remove(id);
        }
    }

    // ==================== Recovery ====================

    /// Replay the journal against the durable store
    ///
    /// Entries are applied one at a time in sequence order with the same
    /// conflict handling as a sync pass. An entry that cannot be applied
    /// blocks only the later entries for the same bookmark; everything left
    /// stays journaled and is rebuilt into dirty cache entries. Only a fatal
    /// store error stops the pass, with the journal intact.
    pub fn recover(&self, store: &dyn DurableStore) -> Result<RecoveryReport, StoreError> {
        let (records, corrupt) = {
            let mut state = self.lock();
            (state.records.clone(), std::mem::take(&mut state.corrupt))
        };

        let mut report = RecoveryReport {
            corrupt,
            ..RecoveryReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }
        info!("Replaying {} journal entries", records.len());

        // Provisional id -> store id, for inserts confirmed in this pass
        let mut assigned: HashMap<BookmarkId, BookmarkId> = HashMap::new();
        // Store id -> (journaled base revision, revision this pass produced)
        let mut chained: HashMap<BookmarkId, (Revision, Revision)> = HashMap::new();
        let mut blocked: HashSet<BookmarkId> = HashSet::new();
        let mut known: Option<Vec<Bookmark>> = None;
        let mut settled: Vec<Bookmark> = Vec::new();
        let mut leftovers: Vec<JournalEntry> = Vec::new();

        for mut record in records {
            let journaled_id = record.snapshot.id;
            if journaled_id.is_provisional() && record.kind != OpKind::Insert {
                if let Some(&id) = assigned.get(&journaled_id) {
                    record.snapshot.id = id;
                }
            }
            let id = record.snapshot.id;
            let journaled_base = record.snapshot.revision;
            if let Some(&(base, produced)) = chained.get(&id) {
                if base == journaled_base {
                    record.snapshot.revision = produced;
                }
            }

            let waiting_on_insert = id.is_provisional() && record.kind != OpKind::Insert;
            if waiting_on_insert || blocked.contains(&id) {
                debug!("Journal entry {} for {} waits on an earlier entry", record.seq, id);
                report.replay.blocked.push(id);
                blocked.insert(id);
                leftovers.push(record);
                continue;
            }

            if record.kind == OpKind::Insert && !record.confirmed && known.is_none() {
                known = match store.list(0) {
                    Ok(all) => Some(all.into_iter().filter(|b| !b.deleted).collect()),
                    Err(e) if e.is_fatal() => return self.abort_recovery(e, &settled),
                    Err(e) => {
                        warn!("Could not load store records for duplicate checks: {}", e);
                        None
                    }
                };
            }

            let write = PendingWrite {
                id,
                kind: record.kind,
                bookmark: record.snapshot.clone(),
                base: record.snapshot.revision,
                confirmed: record.confirmed,
                seqs: vec![record.seq],
            };
            let outcome = match known.as_deref() {
                Some(known) => merge::apply_write(store, &write, known, self.similarity_threshold),
                None if record.kind == OpKind::Insert && !record.confirmed => {
                    Ok(Outcome::Deferred("store records unavailable for duplicate check".into()))
                }
                None => merge::apply_write(store, &write, &[], self.similarity_threshold),
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => return self.abort_recovery(e, &settled),
            };

            report.replay.record(&write, &outcome);
            match outcome.settled() {
                Some(stored) => {
                    self.prune(&[record.seq]).map_err(StoreError::from)?;
                    if let Some(stored) = stored {
                        if journaled_id.is_provisional() {
                            assigned.insert(journaled_id, stored.id);
                        }
                        chained.insert(stored.id, (journaled_base, stored.revision));
                        if let Some(ref mut known) = known {
                            known.retain(|b| b.id != stored.id);
                            if !stored.deleted {
                                known.push(stored.clone());
                            }
                        }
                        settled.retain(|b| b.id != stored.id);
                        settled.push(stored.clone());
                    }
                }
                None => {
                    blocked.insert(id);
                    leftovers.push(record);
                }
            }
        }

        report.remaining = leftovers.len();
        let mut state = self.lock();
        state.entries.retain(|_, e| !e.is_dirty());
        for stored in settled {
            state.entries.insert(stored.id, CacheEntry::clean(stored));
        }
        state.rebuild(leftovers);
        state.flush().map_err(StoreError::from)?;

        info!(
            "Recovery applied {} entries, {} remain",
            report.replay.applied + report.replay.already_applied + report.replay.retargeted,
            report.remaining
        );
        Ok(report)
    }

    /// Stop recovery on a fatal error, keeping what was already confirmed
    fn abort_recovery(
        &self,
        error: StoreError,
        settled: &[Bookmark],
    ) -> Result<RecoveryReport, StoreError> {
        warn!("Recovery stopped: {}", error);
        let mut state = self.lock();
        for stored in settled {
            state
                .entries
                .insert(stored.id, CacheEntry::clean(stored.clone()));
        }
        Err(error)
    }

    fn prune(&self, seqs: &[u64]) -> Result<(), JournalError> {
        let mut state = self.lock();
        state.records.retain(|r| !seqs.contains(&r.seq));
        state.flush()
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn append(&mut self, record: JournalEntry) -> Result<(), JournalError> {
        self.journal.append(&record)?;
        self.records.push(record);
        Ok(())
    }

    /// Rewrite the journal from the in-memory records
    fn flush(&mut self) -> Result<(), JournalError> {
        let records = self.records.clone();
        self.journal.rewrite(&records)
    }

    fn stage_insert(
        &mut self,
        candidate: &Candidate,
        confirmed: bool,
    ) -> Result<Bookmark, CacheError> {
        candidate.validate()?;

        let seq = self.take_seq();
        let bookmark = Bookmark::from_candidate(BookmarkId::provisional(seq), candidate);
        self.append(JournalEntry {
            seq,
            kind: OpKind::Insert,
            snapshot: bookmark.clone(),
            confirmed,
        })?;

        debug!("Staged insert {} for {}", bookmark.id, bookmark.url);
        self.entries.insert(
            bookmark.id,
            CacheEntry {
                bookmark: bookmark.clone(),
                last_synced_revision: 0,
                pending: Some(PendingOp {
                    kind: OpKind::Insert,
                    seqs: vec![seq],
                    confirmed,
                }),
            },
        );
        Ok(bookmark)
    }

    fn stage_update(&mut self, mut bookmark: Bookmark) -> Result<Bookmark, CacheError> {
        validate_url(&bookmark.url)?;
        let id = bookmark.id;
        let entry = self.entries.get(&id).ok_or(CacheError::NotFound(id))?;
        if entry.bookmark.deleted {
            return Err(CacheError::Deleted(id));
        }

        bookmark.deleted = false;
        bookmark.url = bookmark.url.trim().to_string();
        bookmark.revision = entry.last_synced_revision;
        bookmark.created_at = entry.bookmark.created_at;
        bookmark.updated_at = Utc::now();
        let (kind, confirmed) = match entry.pending {
            Some(ref p) if p.kind == OpKind::Insert => (OpKind::Insert, p.confirmed),
            Some(ref p) => (OpKind::Update, p.confirmed),
            None => (OpKind::Update, false),
        };

        let seq = self.take_seq();
        self.append(JournalEntry {
            seq,
            kind: OpKind::Update,
            snapshot: bookmark.clone(),
            confirmed,
        })?;

        debug!("Staged update of {}", id);
        self.fold(bookmark.clone(), kind, seq, confirmed);
        Ok(bookmark)
    }

    fn stage_delete(&mut self, id: BookmarkId) -> Result<Bookmark, CacheError> {
        let entry = self.entries.get(&id).ok_or(CacheError::NotFound(id))?;
        if entry.bookmark.deleted {
            return Err(CacheError::Deleted(id));
        }

        let mut tombstone = entry.bookmark.clone();
        tombstone.deleted = true;
        tombstone.revision = entry.last_synced_revision;
        tombstone.updated_at = Utc::now();

        let never_stored = entry.pending.as_ref().map(|p| p.kind) == Some(OpKind::Insert);
        if never_stored && !self.in_flight.contains(&id) {
            debug!("Dropping staged insert {}", id);
            self.drop_entry(id)?;
            return Ok(tombstone);
        }

        let seq = self.take_seq();
        self.append(JournalEntry {
            seq,
            kind: OpKind::Delete,
            snapshot: tombstone.clone(),
            confirmed: false,
        })?;

        debug!("Staged delete of {}", id);
        self.fold(tombstone.clone(), OpKind::Delete, seq, false);
        Ok(tombstone)
    }

    /// Remove an entry and every journal record folded into it
    fn drop_entry(&mut self, id: BookmarkId) -> Result<(), JournalError> {
        if let Some(entry) = self.entries.remove(&id) {
            if let Some(pending) = entry.pending {
                self.records.retain(|r| !pending.seqs.contains(&r.seq));
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Fold a new op into the entry's pending op
    fn fold(&mut self, bookmark: Bookmark, kind: OpKind, seq: u64, confirmed: bool) {
        let id = bookmark.id;
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.bookmark = bookmark;
                match entry.pending {
                    Some(ref mut pending) => {
                        pending.kind = coalesce(pending.kind, kind);
                        pending.seqs.push(seq);
                        pending.confirmed |= confirmed;
                    }
                    None => {
                        entry.pending = Some(PendingOp {
                            kind,
                            seqs: vec![seq],
                            confirmed,
                        });
                    }
                }
            }
            None => {
                self.entries.insert(
                    id,
                    CacheEntry {
                        last_synced_revision: bookmark.revision,
                        bookmark,
                        pending: Some(PendingOp {
                            kind,
                            seqs: vec![seq],
                            confirmed,
                        }),
                    },
                );
            }
        }
    }

    /// Rebuild dirty entries from journal records
    ///
    /// An insert followed by a delete of the same entry is kept: the journal
    /// only holds that pair when the insert was in flight, so it may already
    /// be in the store.
    fn rebuild(&mut self, records: Vec<JournalEntry>) {
        for record in &records {
            if record.kind == OpKind::Insert {
                self.entries.remove(&record.snapshot.id);
            }
            self.fold(record.snapshot.clone(), record.kind, record.seq, record.confirmed);
        }
        self.records = records;
    }
}

/// Kind of the pending op after `next` is staged on top of `current`
fn coalesce(current: OpKind, next: OpKind) -> OpKind {
    match (current, next) {
        (_, OpKind::Delete) => OpKind::Delete,
        (OpKind::Insert, _) => OpKind::Insert,
        (OpKind::Delete, _) => OpKind::Delete,
        (OpKind::Update, _) => OpKind::Update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStore;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir) -> Config {
        Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    fn insert(url: &str) -> StageOp {
        StageOp::Insert {
            candidate: Candidate::new(url),
            confirmed: false,
        }
    }

    #[test]
    fn test_stage_is_read_your_writes() {
        let cache = LocalCache::new();
        let staged = cache.stage(insert("https://example.com")).unwrap();

        assert!(staged.id.is_provisional());
        assert_eq!(cache.read(staged.id).unwrap().url, "https://example.com");
        assert_eq!(cache.find_by_url("https://example.com").unwrap().id, staged.id);
        assert!(cache.is_dirty());
        assert_eq!(cache.pending_entries().len(), 1);
    }

    #[test]
    fn test_stage_rejects_invalid_candidate() {
        let cache = LocalCache::new();
        assert!(matches!(
            cache.stage(insert("not a url")),
            Err(CacheError::Invalid(_))
        ));
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_insert_then_update_stays_insert() {
        let cache = LocalCache::new();
        let mut staged = cache.stage(insert("https://example.com")).unwrap();
        staged.label = "Example".to_string();
        cache.stage(StageOp::Update(staged.clone())).unwrap();

        let entry = cache.entry(staged.id).unwrap();
        let pending = entry.pending.unwrap();
        assert_eq!(pending.kind, OpKind::Insert);
        assert_eq!(pending.seqs.len(), 2);
        assert_eq!(entry.bookmark.label, "Example");
    }

    #[test]
    fn test_insert_then_delete_drops_everything() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let cache = LocalCache::open(&config).unwrap();

        let staged = cache.stage(insert("https://example.com")).unwrap();
        let tomb = cache.stage(StageOp::Delete(staged.id)).unwrap();
        assert!(tomb.deleted);
        assert!(cache.read(staged.id).is_none());
        assert!(!cache.is_dirty());

        let reopened = LocalCache::open(&config).unwrap();
        assert!(reopened.pending_entries().is_empty());
    }

    #[test]
    fn test_update_then_delete_is_delete() {
        let cache = LocalCache::new();
        let mut stored = Bookmark::new(BookmarkId(7), "https://example.com");
        stored.revision = 3;
        cache.absorb(&[stored.clone()]);

        stored.label = "Changed".to_string();
        cache.stage(StageOp::Update(stored.clone())).unwrap();
        cache.stage(StageOp::Delete(stored.id)).unwrap();

        let entry = cache.entry(stored.id).unwrap();
        assert!(entry.bookmark.deleted);
        assert_eq!(entry.last_synced_revision, 3);
        assert_eq!(entry.pending.unwrap().kind, OpKind::Delete);

        // A tombstone cannot be edited or deleted again
        assert!(matches!(
            cache.stage(StageOp::Update(stored.clone())),
            Err(CacheError::Deleted(_))
        ));
        assert!(matches!(
            cache.stage(StageOp::Delete(stored.id)),
            Err(CacheError::Deleted(_))
        ));
    }

    #[test]
    fn test_update_unknown_id() {
        let cache = LocalCache::new();
        let bookmark = Bookmark::new(BookmarkId(99), "https://example.com");
        assert!(matches!(
            cache.stage(StageOp::Update(bookmark)),
            Err(CacheError::NotFound(_))
        ));
    }

    #[test]
    fn test_journal_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let staged = {
            let cache = LocalCache::open(&config).unwrap();
            cache.stage(insert("https://example.com")).unwrap()
        };

        let cache = LocalCache::open(&config).unwrap();
        let entry = cache.entry(staged.id).unwrap();
        assert_eq!(entry.pending.unwrap().kind, OpKind::Insert);

        // Sequence numbers keep counting from the journal
        let next = cache.stage(insert("https://other.com")).unwrap();
        assert_ne!(next.id, staged.id);
    }

    #[test]
    fn test_absorb_leaves_dirty_entries() {
        let cache = LocalCache::new();
        let mut stored = Bookmark::new(BookmarkId(1), "https://example.com");
        stored.revision = 1;
        assert_eq!(cache.absorb(&[stored.clone()]), 1);
        // Same revision again changes nothing
        assert_eq!(cache.absorb(&[stored.clone()]), 0);

        let mut local = stored.clone();
        local.label = "Local".to_string();
        cache.stage(StageOp::Update(local)).unwrap();

        let mut remote = stored.clone();
        remote.revision = 2;
        remote.label = "Remote".to_string();
        assert_eq!(cache.absorb(&[remote]), 0);
        assert_eq!(cache.read(stored.id).unwrap().label, "Local");
    }

    #[test]
    fn test_settle_rebases_ops_staged_in_flight() {
        let store = FileStore::new();
        let cache = LocalCache::new();
        let staged = cache.stage(insert("https://example.com")).unwrap();

        let writes = cache.begin_writes();
        assert_eq!(writes.len(), 1);

        // Staged while the insert is on its way to the store
        let mut newer = staged.clone();
        newer.label = "Newer".to_string();
        cache.stage(StageOp::Update(newer)).unwrap();
        // In-flight inserts are not dropped by a delete
        assert!(cache.begin_writes().is_empty());

        let mut draft = writes[0].bookmark.clone();
        draft.revision = 0;
        let stored = store.put(&draft, 0).unwrap();
        cache.settle(&writes[0], Some(&stored)).unwrap();

        assert!(cache.read(staged.id).is_none());
        let entry = cache.entry(stored.id).unwrap();
        assert_eq!(entry.bookmark.label, "Newer");
        assert_eq!(entry.last_synced_revision, stored.revision);
        assert_eq!(entry.pending.as_ref().unwrap().kind, OpKind::Update);

        let records = cache.pending_entries();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].snapshot.id, stored.id);
        assert_eq!(records[0].snapshot.revision, stored.revision);
    }

    #[test]
    fn test_confirm_and_retarget_insert() {
        let cache = LocalCache::new();
        let mut existing = Bookmark::new(BookmarkId(1), "http://x.com/a/");
        existing.revision = 1;
        cache.absorb(&[existing.clone()]);

        let held = cache
            .stage(StageOp::Insert {
                candidate: Candidate::new("http://x.com/a").with_tags(["reading"]),
                confirmed: false,
            })
            .unwrap();
        cache.confirm_insert(held.id).unwrap();
        assert!(cache.entry(held.id).unwrap().pending.unwrap().confirmed);
        assert!(cache.pending_entries()[0].confirmed);

        let merged = cache.retarget_insert(held.id, existing.id).unwrap();
        assert_eq!(merged.id, existing.id);
        assert!(merged.tags.contains("reading"));
        assert!(cache.read(held.id).is_none());

        let entry = cache.entry(existing.id).unwrap();
        assert_eq!(entry.pending.unwrap().kind, OpKind::Update);
        assert!(matches!(
            cache.confirm_insert(existing.id),
            Err(CacheError::NotPendingInsert(_))
        ));
    }

    #[test]
    fn test_watermark_never_decreases() {
        let cache = LocalCache::new();
        cache.advance_watermark(5);
        cache.advance_watermark(3);
        assert_eq!(cache.watermark(), 5);
    }

    fn seeded(store: &dyn DurableStore, url: &str) -> Bookmark {
        store
            .put(&Bookmark::new(BookmarkId::provisional(1), url), 0)
            .unwrap()
    }

    #[test]
    fn test_recover_applies_staged_delete_once() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let store = FileStore::open(&config).unwrap();
        let stored = seeded(&store, "https://example.com");

        {
            let cache = LocalCache::open(&config).unwrap();
            cache.absorb(&[stored.clone()]);
            cache.stage(StageOp::Delete(stored.id)).unwrap();
            // Dropped before any sync
        }
        let journal = std::fs::read_to_string(config.journal_path()).unwrap();

        let cache = LocalCache::open(&config).unwrap();
        let report = cache.recover(&store).unwrap();
        assert_eq!(report.replay.applied, 1);
        assert_eq!(report.remaining, 0);
        assert!(cache.pending_entries().is_empty());
        assert!(store.get(stored.id).unwrap().deleted);
        let head = store.head_revision().unwrap();

        // Replaying the same journal again changes nothing
        std::fs::write(config.journal_path(), journal).unwrap();
        let cache = LocalCache::open(&config).unwrap();
        let report = cache.recover(&store).unwrap();
        assert_eq!(report.replay.applied, 0);
        assert_eq!(report.replay.already_applied, 1);
        assert_eq!(store.head_revision().unwrap(), head);
        assert!(cache.pending_entries().is_empty());
    }

    #[test]
    fn test_recover_keeps_delete_of_in_flight_insert() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let store = FileStore::open(&config).unwrap();

        {
            let cache = LocalCache::open(&config).unwrap();
            let staged = cache.stage(insert("https://example.com")).unwrap();
            let writes = cache.begin_writes();

            // The insert lands, the user deletes, then the process dies
            let mut draft = writes[0].bookmark.clone();
            draft.revision = 0;
            store.put(&draft, 0).unwrap();
            cache.stage(StageOp::Delete(staged.id)).unwrap();
        }

        let cache = LocalCache::open(&config).unwrap();
        assert_eq!(cache.pending_entries().len(), 2);
        assert!(cache.read_live().is_empty());

        let report = cache.recover(&store).unwrap();
        assert_eq!(report.remaining, 0);
        assert_eq!(report.replay.already_applied, 1);
        assert_eq!(report.replay.applied, 1);

        let stored = store.list(0).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].deleted);
        assert!(cache.read(stored[0].id).unwrap().deleted);
        assert!(cache.read_live().is_empty());
        assert!(cache.pending_entries().is_empty());
    }

    #[test]
    fn test_recover_skips_corrupt_lines() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        let store = FileStore::open(&config).unwrap();

        {
            let cache = LocalCache::open(&config).unwrap();
            cache.stage(insert("https://a.com")).unwrap();
        }
        let mut journal = std::fs::read_to_string(config.journal_path()).unwrap();
        journal.push_str("{\"seq\": 9, \"kind\"\n");
        std::fs::write(config.journal_path(), journal).unwrap();

        let cache = LocalCache::open(&config).unwrap();
        let report = cache.recover(&store).unwrap();
        assert_eq!(report.corrupt.len(), 1);
        assert_eq!(report.replay.applied, 1);
        assert_eq!(report.remaining, 0);
        assert!(!report.is_clean());
        assert!(store.get_by_url("https://a.com").is_ok());
    }
}
