//! Merge engine
//!
//! Reconciles the local cache with the durable store:
//!
//! 1. Pull every store record above the cache watermark
//! 2. Fold pulled records into the cache (new ids, clean entries)
//! 3. Apply each dirty entry with compare-and-swap against its last synced
//!    revision, resolving conflicts
//! 4. Catch up on records written meanwhile and advance the watermark
//!
//! ## Conflict policy
//!
//! - a tombstone beats any non-tombstone edit, whatever the timestamps
//! - otherwise the later `updated_at` wins; a tie goes to the store
//! - a conflicting record already equal to ours means the write was applied
//!   before (replay), not a conflict
//!
//! Every resolved conflict is reported, never dropped silently.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::cache::{LocalCache, OpKind, PendingWrite};
use crate::fuzzy::{find_similar, Match};
use crate::models::{Bookmark, BookmarkId, Revision};
use crate::storage::{DurableStore, StoreError};

/// Cooperative cancellation flag, checked between per-record steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which side's version survived a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Store,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Store => write!(f, "store"),
        }
    }
}

/// Why a conflict was resolved the way it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The side with the later `updated_at` won
    NewerWrite,
    /// Equal timestamps; the store's durable version won
    Tie,
    /// A deletion beat an edit
    Tombstone,
    /// The record was compacted away before the edit arrived
    Purged,
    /// The store refused the record
    Rejected(String),
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::NewerWrite => write!(f, "newer write wins"),
            ConflictReason::Tie => write!(f, "same timestamp, store wins"),
            ConflictReason::Tombstone => write!(f, "deletion wins"),
            ConflictReason::Purged => write!(f, "record no longer exists"),
            ConflictReason::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// A conflict the engine resolved, with both sides for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub id: BookmarkId,
    pub url: String,
    pub kind: OpKind,
    pub winner: Side,
    pub reason: ConflictReason,
    /// What the local op wanted
    pub local: Bookmark,
    /// What the store held when the conflict was detected
    pub store: Option<Bookmark>,
}

impl fmt::Display for ConflictRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bookmark {} ({}): local {} vs store, {} ({})",
            self.id, self.url, self.kind, self.winner, self.reason
        )
    }
}

/// A pending op left for a later pass
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFailure {
    pub id: BookmarkId,
    pub url: String,
    pub kind: OpKind,
    pub error: String,
}

impl fmt::Display for PendingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pending {} of bookmark {} ({}): {}",
            self.kind, self.id, self.url, self.error
        )
    }
}

/// A held insert waiting for the caller to confirm or retarget it
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub id: BookmarkId,
    pub url: String,
    pub matches: Vec<Match>,
}

/// Result of one reconcile pass
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Cache entries added or refreshed from the store
    pub pulled: usize,
    /// Local ops written to the store
    pub applied: usize,
    /// Inserts turned into updates of an existing record
    pub retargeted: usize,
    /// Replays whose effect the store already had
    pub already_applied: usize,
    pub conflicts: Vec<ConflictRecord>,
    /// Ops that hit retryable errors
    pub retryable: Vec<PendingFailure>,
    /// Ops not attempted (cancelled or waiting on another op)
    pub blocked: Vec<BookmarkId>,
    pub needs_confirmation: Vec<ConfirmationRequest>,
    pub cancelled: bool,
    /// Cache watermark after the pass
    pub watermark: Revision,
}

impl MergeReport {
    /// Changes this pass made to either side
    pub fn applied_changes(&self) -> usize {
        self.pulled + self.applied + self.retargeted
    }

    /// Whether some ops must be retried
    pub fn has_failures(&self) -> bool {
        !self.retryable.is_empty()
    }

    /// Whether anything needs a human to look at it
    pub fn needs_attention(&self) -> bool {
        !self.conflicts.is_empty() || !self.needs_confirmation.is_empty() || self.has_failures()
    }

    /// Account for one write's outcome
    pub(crate) fn record(&mut self, write: &PendingWrite, outcome: &Outcome) {
        match outcome {
            Outcome::Applied(_) => self.applied += 1,
            Outcome::AlreadyApplied(_) | Outcome::Vanished => self.already_applied += 1,
            Outcome::Retargeted(_) => self.retargeted += 1,
            Outcome::Resolved { conflict, .. } => {
                warn!("Conflict resolved: {}", conflict);
                self.conflicts.push(conflict.clone());
            }
            Outcome::Held(matches) => self.needs_confirmation.push(ConfirmationRequest {
                id: write.id,
                url: write.bookmark.url.clone(),
                matches: matches.clone(),
            }),
            Outcome::Deferred(error) => {
                warn!("Pending {} of {} deferred: {}", write.kind, write.id, error);
                self.retryable.push(PendingFailure {
                    id: write.id,
                    url: write.bookmark.url.clone(),
                    kind: write.kind,
                    error: error.clone(),
                });
            }
        }
    }
}

/// What happened to one pending write
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    /// The store accepted the write
    Applied(Bookmark),
    /// The store already held the intended result
    AlreadyApplied(Bookmark),
    /// A deleted record is already gone from the store
    Vanished,
    /// An insert was folded into the existing record with the same URL
    Retargeted(Bookmark),
    /// A conflict was resolved; `stored` is the surviving record, if any
    Resolved {
        stored: Option<Bookmark>,
        conflict: ConflictRecord,
    },
    /// An unconfirmed insert has near-duplicates in the store
    Held(Vec<Match>),
    /// Not applied this time; stays pending
    Deferred(String),
}

impl Outcome {
    /// The record the cache should settle on
    ///
    /// `None` means the entry stays pending; `Some(None)` means the record
    /// no longer exists.
    pub(crate) fn settled(&self) -> Option<Option<&Bookmark>> {
        match self {
            Outcome::Applied(stored)
            | Outcome::AlreadyApplied(stored)
            | Outcome::Retargeted(stored) => Some(Some(stored)),
            Outcome::Resolved { stored, .. } => Some(stored.as_ref()),
            Outcome::Vanished => Some(None),
            Outcome::Held(_) | Outcome::Deferred(_) => None,
        }
    }
}

/// Turn a store error into an outcome, or fail the pass if it is fatal
fn defer(error: StoreError) -> Result<Outcome, StoreError> {
    if error.is_fatal() {
        Err(error)
    } else {
        Ok(Outcome::Deferred(error.to_string()))
    }
}

/// Apply one pending write to the store
///
/// `known` are live store records used for the near-duplicate check of
/// unconfirmed inserts. Only fatal store errors are returned as `Err`.
pub(crate) fn apply_write(
    store: &dyn DurableStore,
    write: &PendingWrite,
    known: &[Bookmark],
    threshold: f64,
) -> Result<Outcome, StoreError> {
    if write.id.is_provisional() {
        match write.kind {
            OpKind::Insert => {}
            OpKind::Delete => return apply_delete_of_insert(store, write),
            OpKind::Update => {
                return Ok(Outcome::Deferred(format!(
                    "waiting for insert {} to be confirmed",
                    write.id
                )))
            }
        }
    }

    match write.kind {
        OpKind::Insert => apply_insert(store, write, known, threshold),
        OpKind::Update => apply_update(store, write),
        OpKind::Delete => apply_delete(store, write),
    }
}

fn apply_insert(
    store: &dyn DurableStore,
    write: &PendingWrite,
    known: &[Bookmark],
    threshold: f64,
) -> Result<Outcome, StoreError> {
    let mut draft = write.bookmark.clone();
    draft.revision = 0;

    if !write.confirmed {
        let near: Vec<Match> = find_similar(&draft, known, threshold)
            .into_iter()
            .filter(|m| m.bookmark.url != draft.url)
            .collect();
        if !near.is_empty() {
            debug!("Holding insert of {}: {} near-duplicates", draft.url, near.len());
            return Ok(Outcome::Held(near));
        }
    }

    match store.put(&draft, 0) {
        Ok(stored) => {
            debug!("Inserted {} as {} at revision {}", draft.url, stored.id, stored.revision);
            Ok(Outcome::Applied(stored))
        }
        Err(StoreError::DuplicateUrl { existing, .. }) => retarget_insert(store, write, &draft, existing),
        Err(StoreError::InvalidRecord(reason)) => Ok(Outcome::Resolved {
            stored: None,
            conflict: conflict(write, Side::Store, ConflictReason::Rejected(reason), None),
        }),
        Err(e) => defer(e),
    }
}

/// Convert an insert into an update of the record already holding the URL
fn retarget_insert(
    store: &dyn DurableStore,
    write: &PendingWrite,
    draft: &Bookmark,
    existing: BookmarkId,
) -> Result<Outcome, StoreError> {
    let current = match store.get(existing) {
        Ok(current) => current,
        Err(e) => return defer(e),
    };

    let mut merged = current.clone();
    if !merged.merge_from(draft) {
        // Nothing to add: a replayed insert or an identical re-add
        return Ok(Outcome::AlreadyApplied(current));
    }

    debug!("Retargeting insert of {} onto {}", draft.url, existing);
    match store.put(&merged, current.revision) {
        Ok(stored) => Ok(Outcome::Retargeted(stored)),
        Err(StoreError::Conflict { .. }) => Ok(Outcome::Deferred(format!(
            "bookmark {} changed while retargeting {}",
            existing, write.id
        ))),
        Err(e) => defer(e),
    }
}

fn apply_update(store: &dyn DurableStore, write: &PendingWrite) -> Result<Outcome, StoreError> {
    let desired = &write.bookmark;
    match store.put(desired, write.base) {
        Ok(stored) => {
            debug!("Updated {} to revision {}", stored.id, stored.revision);
            Ok(Outcome::Applied(stored))
        }
        Err(StoreError::Conflict { current, .. }) => resolve_update(store, write, *current),
        Err(StoreError::NotFound { .. }) => Ok(Outcome::Resolved {
            stored: None,
            conflict: conflict(write, Side::Store, ConflictReason::Purged, None),
        }),
        Err(StoreError::DuplicateUrl { url, existing }) => reject(
            store,
            write,
            format!("URL {} belongs to bookmark {}", url, existing),
        ),
        Err(StoreError::InvalidRecord(reason)) => reject(store, write, reason),
        Err(e) => defer(e),
    }
}

fn resolve_update(
    store: &dyn DurableStore,
    write: &PendingWrite,
    current: Bookmark,
) -> Result<Outcome, StoreError> {
    let desired = &write.bookmark;

    if current.deleted {
        return Ok(Outcome::Resolved {
            conflict: conflict(write, Side::Store, ConflictReason::Tombstone, Some(&current)),
            stored: Some(current),
        });
    }
    if current.same_content(desired) {
        return Ok(Outcome::AlreadyApplied(current));
    }

    if desired.updated_at > current.updated_at {
        // Local wins: re-issue once against the current revision
        return match store.put(desired, current.revision) {
            Ok(stored) => Ok(Outcome::Resolved {
                conflict: conflict(write, Side::Local, ConflictReason::NewerWrite, Some(&current)),
                stored: Some(stored),
            }),
            Err(StoreError::Conflict { .. }) => Ok(Outcome::Deferred(format!(
                "bookmark {} changed again while resolving a conflict",
                write.id
            ))),
            Err(e) => defer(e),
        };
    }

    let reason = if desired.updated_at == current.updated_at {
        ConflictReason::Tie
    } else {
        ConflictReason::NewerWrite
    };
    Ok(Outcome::Resolved {
        conflict: conflict(write, Side::Store, reason, Some(&current)),
        stored: Some(current),
    })
}

/// The store refused an update; fall back to its version
fn reject(
    store: &dyn DurableStore,
    write: &PendingWrite,
    reason: String,
) -> Result<Outcome, StoreError> {
    let current = match store.get(write.id) {
        Ok(current) => Some(current),
        Err(StoreError::NotFound { .. }) => None,
        Err(e) => return defer(e),
    };
    Ok(Outcome::Resolved {
        conflict: conflict(
            write,
            Side::Store,
            ConflictReason::Rejected(reason),
            current.as_ref(),
        ),
        stored: current,
    })
}

fn apply_delete(store: &dyn DurableStore, write: &PendingWrite) -> Result<Outcome, StoreError> {
    match store.delete(write.id, write.base) {
        Ok(tombstone) => {
            debug!("Deleted {} at revision {}", tombstone.id, tombstone.revision);
            Ok(Outcome::Applied(tombstone))
        }
        Err(StoreError::Conflict { current, .. }) if current.deleted => {
            Ok(Outcome::AlreadyApplied(*current))
        }
        Err(StoreError::Conflict { current, .. }) => {
            // A concurrent edit never un-deletes: delete the newer revision
            match store.delete(write.id, current.revision) {
                Ok(tombstone) => Ok(Outcome::Resolved {
                    conflict: conflict(write, Side::Local, ConflictReason::Tombstone, Some(&current)),
                    stored: Some(tombstone),
                }),
                Err(StoreError::Conflict { current, .. }) if current.deleted => {
                    Ok(Outcome::AlreadyApplied(*current))
                }
                Err(StoreError::Conflict { .. }) => Ok(Outcome::Deferred(format!(
                    "bookmark {} changed again while deleting",
                    write.id
                ))),
                Err(StoreError::NotFound { .. }) => Ok(Outcome::Vanished),
                Err(e) => defer(e),
            }
        }
        Err(StoreError::NotFound { .. }) => Ok(Outcome::Vanished),
        Err(e) => defer(e),
    }
}

/// Delete an insert that may or may not have reached the store
///
/// A record holding the URL is what the insert landed as, or what it would
/// have been folded into; either way it goes.
fn apply_delete_of_insert(
    store: &dyn DurableStore,
    write: &PendingWrite,
) -> Result<Outcome, StoreError> {
    let current = match store.get_by_url(&write.bookmark.url) {
        Ok(current) => current,
        Err(StoreError::NotFound { .. }) => return Ok(Outcome::Vanished),
        Err(e) => return defer(e),
    };

    debug!("Insert {} reached the store as {}; deleting it", write.id, current.id);
    let mut resolved = write.clone();
    resolved.id = current.id;
    resolved.base = current.revision;
    apply_delete(store, &resolved)
}

fn conflict(
    write: &PendingWrite,
    winner: Side,
    reason: ConflictReason,
    store: Option<&Bookmark>,
) -> ConflictRecord {
    ConflictRecord {
        id: write.id,
        url: write.bookmark.url.clone(),
        kind: write.kind,
        winner,
        reason,
        local: write.bookmark.clone(),
        store: store.cloned(),
    }
}

/// Reconcile the cache with the store
///
/// Only fatal store errors abort the pass; the journal is left intact and
/// in-flight entries are released. Cancellation is honoured between
/// records, never in the middle of a store write.
pub fn reconcile(
    cache: &LocalCache,
    store: &dyn DurableStore,
    cancel: &CancelToken,
) -> Result<MergeReport, StoreError> {
    let mut report = MergeReport::default();
    let start = cache.watermark();

    // Steps 1-2: pull
    let fetched = store.list(start)?;
    let mut seen = fetched.iter().map(|b| b.revision).max().unwrap_or(start);
    report.pulled += cache.absorb(&fetched);
    debug!("Pulled {} records above revision {}", fetched.len(), start);

    // Step 3: push
    let writes = cache.begin_writes();
    // Near-duplicate checks only look at records the store already has
    let known: Vec<Bookmark> = cache
        .read_live()
        .into_iter()
        .filter(|b| !b.id.is_provisional())
        .collect();
    let mut queue = writes.into_iter();
    while let Some(write) = queue.next() {
        if cancel.is_cancelled() {
            report.cancelled = true;
            for write in std::iter::once(write).chain(queue.by_ref()) {
                cache.release(write.id);
                report.blocked.push(write.id);
            }
            break;
        }

        let outcome = match apply_write(store, &write, &known, cache.similarity_threshold()) {
            Ok(outcome) => outcome,
            Err(e) => {
                cache.release(write.id);
                for rest in queue {
                    cache.release(rest.id);
                }
                warn!("Sync pass aborted on {} of {}: {}", write.kind, write.id, e);
                return Err(e);
            }
        };

        report.record(&write, &outcome);
        match outcome.settled() {
            Some(stored) => {
                if let Some(stored) = stored {
                    seen = seen.max(stored.revision);
                }
                if let Err(e) = cache.settle(&write, stored) {
                    for rest in queue {
                        cache.release(rest.id);
                    }
                    return Err(e.into());
                }
            }
            None => cache.release(write.id),
        }
    }

    // Step 4: catch up on anything written between the pull and our writes.
    // Any settled record above the pull, replays included, may sit above
    // foreign revisions the cache has not seen.
    let pulled_to = last_pulled(&fetched, start);
    if seen > pulled_to {
        match store.list(pulled_to) {
            Ok(more) => {
                report.pulled += cache.absorb(&more);
                seen = more.iter().map(|b| b.revision).fold(seen, Revision::max);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Catch-up read failed: {}", e);
                seen = pulled_to;
            }
        }
    }

    cache.advance_watermark(seen);
    report.watermark = cache.watermark();

    info!(
        "Sync pass: {} pulled, {} applied, {} retargeted, {} conflicts, {} retryable",
        report.pulled,
        report.applied,
        report.retargeted,
        report.conflicts.len(),
        report.retryable.len()
    );
    Ok(report)
}

fn last_pulled(fetched: &[Bookmark], start: Revision) -> Revision {
    fetched.iter().map(|b| b.revision).max().unwrap_or(start)
}

/// Result of a compaction pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionReport {
    /// Tombstones physically removed
    pub purged: Vec<BookmarkId>,
    /// Tombstones kept because they are inside the retention window
    pub retained: usize,
    /// Tombstones kept because a local op is still pending on them
    pub pending: usize,
}

/// Physically remove old tombstones from the store and the cache
///
/// A tombstone qualifies when it is older than `retention`, the cache
/// watermark covers its revision, and no local op is pending on it.
pub fn compact(
    cache: &LocalCache,
    store: &dyn DurableStore,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<CompactionReport, StoreError> {
    let watermark = cache.watermark();
    let cutoff = now - retention;
    let mut report = CompactionReport::default();
    let mut eligible = Vec::new();

    for entry in cache.tombstones() {
        if entry.is_dirty() {
            report.pending += 1;
        } else if entry.bookmark.updated_at > cutoff || entry.bookmark.revision > watermark {
            report.retained += 1;
        } else {
            eligible.push(entry.bookmark.id);
        }
    }

    if !eligible.is_empty() {
        let purged = store.purge(&eligible)?;
        cache.remove(&eligible);
        info!("Compacted {} tombstones", purged);
    }
    report.purged = eligible;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StageOp;
    use crate::config::Config;
    use crate::models::Candidate;
    use crate::storage::{FileStore, StoreResult};
    use std::thread;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn insert(url: &str) -> StageOp {
        StageOp::Insert {
            candidate: Candidate::new(url),
            confirmed: false,
        }
    }

    /// Cache and store holding one synced bookmark
    fn synced(url: &str) -> (LocalCache, FileStore, Bookmark) {
        let cache = LocalCache::new();
        let store = FileStore::new();
        cache.stage(insert(url)).unwrap();
        reconcile(&cache, &store, &CancelToken::new()).unwrap();
        let stored = store.get_by_url(url).unwrap();
        (cache, store, stored)
    }

    /// Someone else edits the store directly
    fn foreign_edit(store: &FileStore, id: BookmarkId, label: &str) -> Bookmark {
        let mut current = store.get(id).unwrap();
        current.label = label.to_string();
        store.put(&current, current.revision).unwrap()
    }

    #[test]
    fn test_push_insert_and_adopt_store_id() {
        let cache = LocalCache::new();
        let store = FileStore::new();
        let staged = cache.stage(insert("https://example.com")).unwrap();

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.applied, 1);
        assert!(!cache.is_dirty());
        assert!(cache.read(staged.id).is_none());

        let stored = cache.find_by_url("https://example.com").unwrap();
        assert!(!stored.id.is_provisional());
        assert_eq!(cache.entry(stored.id).unwrap().last_synced_revision, 1);
        assert_eq!(report.watermark, 1);
    }

    #[test]
    fn test_reconcile_twice_is_noop() {
        let (cache, store, _) = synced("https://example.com");
        foreign_edit(&store, store.get_by_url("https://example.com").unwrap().id, "Remote");

        let first = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(first.pulled, 1);

        let second = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(second.applied_changes(), 0);
        assert!(second.conflicts.is_empty());
        assert_eq!(second.watermark, first.watermark);
    }

    #[test]
    fn test_pull_refreshes_clean_entries() {
        let (cache, store, stored) = synced("https://example.com");
        foreign_edit(&store, stored.id, "Remote label");

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(cache.read(stored.id).unwrap().label, "Remote label");
    }

    #[test]
    fn test_newer_store_edit_wins_conflict() {
        // Local update made against revision N, store moved on with a later edit
        let (cache, store, stored) = synced("https://example.com");

        let mut local = stored.clone();
        local.label = "Foo".to_string();
        cache.stage(StageOp::Update(local)).unwrap();
        thread::sleep(StdDuration::from_millis(5));
        foreign_edit(&store, stored.id, "Bar");
        let remote = foreign_edit(&store, stored.id, "Baz");

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.conflicts.len(), 1);
        let conflict = &report.conflicts[0];
        assert_eq!(conflict.winner, Side::Store);
        assert_eq!(conflict.reason, ConflictReason::NewerWrite);
        assert_eq!(conflict.local.label, "Foo");

        let entry = cache.entry(stored.id).unwrap();
        assert!(!entry.is_dirty());
        assert_eq!(entry.bookmark.label, "Baz");
        assert_eq!(entry.last_synced_revision, remote.revision);
        assert_eq!(store.get(stored.id).unwrap().label, "Baz");
    }

    #[test]
    fn test_newer_local_edit_wins_conflict() {
        let (cache, store, stored) = synced("https://example.com");
        foreign_edit(&store, stored.id, "Remote");
        thread::sleep(StdDuration::from_millis(5));

        // Staged against the old revision, but later than the remote edit
        let mut local = stored.clone();
        local.label = "Local".to_string();
        cache.stage(StageOp::Update(local)).unwrap();

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].winner, Side::Local);
        assert_eq!(store.get(stored.id).unwrap().label, "Local");
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_update_loses_to_tombstone() {
        let (cache, store, stored) = synced("https://example.com");
        thread::sleep(StdDuration::from_millis(5));
        store.delete(stored.id, stored.revision).unwrap();

        // Local edit is later than the delete, the delete still wins
        thread::sleep(StdDuration::from_millis(5));
        let mut local = stored.clone();
        local.label = "Edited".to_string();
        cache.stage(StageOp::Update(local)).unwrap();

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.conflicts[0].reason, ConflictReason::Tombstone);
        assert!(store.get(stored.id).unwrap().deleted);
        assert!(cache.read(stored.id).unwrap().deleted);
    }

    #[test]
    fn test_local_delete_beats_concurrent_update() {
        let (cache, store, stored) = synced("https://example.com");
        cache.stage(StageOp::Delete(stored.id)).unwrap();
        thread::sleep(StdDuration::from_millis(5));
        let edited = foreign_edit(&store, stored.id, "Edited after delete");

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].reason, ConflictReason::Tombstone);

        let final_state = store.get(stored.id).unwrap();
        assert!(final_state.deleted);
        assert!(final_state.revision > edited.revision);
    }

    #[test]
    fn test_no_lost_deletes_under_interleavings() {
        // Every mix of foreign updates and a local delete ends tombstoned
        for foreign_updates in 0..4 {
            let (cache, store, stored) = synced("https://example.com");
            cache.stage(StageOp::Delete(stored.id)).unwrap();
            for i in 0..foreign_updates {
                foreign_edit(&store, stored.id, &format!("edit {}", i));
            }

            reconcile(&cache, &store, &CancelToken::new()).unwrap();
            assert!(store.get(stored.id).unwrap().deleted);
            assert!(cache.read(stored.id).unwrap().deleted);
            assert!(!cache.is_dirty());

            // A later sync never brings it back
            reconcile(&cache, &store, &CancelToken::new()).unwrap();
            assert!(store.get(stored.id).unwrap().deleted);
        }
    }

    #[test]
    fn test_delete_staged_during_insert_reaches_store() {
        let cache = LocalCache::new();
        let store = FileStore::new();
        let staged = cache.stage(insert("https://example.com")).unwrap();

        // The insert lands but its answer is lost, and a delete is staged meanwhile
        let writes = cache.begin_writes();
        let mut draft = writes[0].bookmark.clone();
        draft.revision = 0;
        let landed = store.put(&draft, 0).unwrap();
        cache.stage(StageOp::Delete(staged.id)).unwrap();
        cache.release(staged.id);

        reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert!(store.get(landed.id).unwrap().deleted);
        assert!(cache.read(landed.id).unwrap().deleted);
        assert!(cache.read(staged.id).is_none());
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_delete_of_insert_that_never_landed() {
        let cache = LocalCache::new();
        let store = FileStore::new();
        let staged = cache.stage(insert("https://example.com")).unwrap();

        let _writes = cache.begin_writes();
        cache.stage(StageOp::Delete(staged.id)).unwrap();
        cache.release(staged.id);

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.already_applied, 1);
        assert!(store.list(0).unwrap().is_empty());
        assert!(cache.read(staged.id).is_none());
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_duplicate_url_retargets_insert() {
        let store = FileStore::new();
        let existing = store
            .put(&Bookmark::new(BookmarkId::provisional(1), "https://example.com"), 0)
            .unwrap();

        // The cache has not pulled the existing record yet
        let cache = LocalCache::new();
        cache
            .stage(StageOp::Insert {
                candidate: Candidate::new("https://example.com").with_tags(["rust"]),
                confirmed: true,
            })
            .unwrap();
        // Skip the pull so the push meets the store's unique URL rule
        cache.advance_watermark(existing.revision);

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.retargeted, 1);
        assert_eq!(store.list(0).unwrap().len(), 1);

        let merged = store.get(existing.id).unwrap();
        assert!(merged.tags.contains("rust"));
        assert_eq!(cache.read(existing.id).unwrap(), merged);
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_near_duplicate_insert_is_held() {
        let store = FileStore::new();
        store
            .put(&Bookmark::new(BookmarkId::provisional(1), "http://x.com/a/"), 0)
            .unwrap();

        let cache = LocalCache::new();
        let staged = cache.stage(insert("http://x.com/a")).unwrap();

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.needs_confirmation.len(), 1);
        assert_eq!(report.needs_confirmation[0].id, staged.id);
        assert!(report.needs_confirmation[0].matches[0].score >= 0.8);
        assert_eq!(store.list(0).unwrap().len(), 1);
        assert!(cache.is_dirty());

        cache.confirm_insert(staged.id).unwrap();
        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(store.list(0).unwrap().len(), 2);
    }

    #[test]
    fn test_update_of_purged_record_is_reported() {
        let (cache, store, stored) = synced("https://example.com");
        let mut local = stored.clone();
        local.label = "Local".to_string();
        cache.stage(StageOp::Update(local)).unwrap();

        let tomb = store.delete(stored.id, stored.revision).unwrap();
        store.purge(&[tomb.id]).unwrap();

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.conflicts[0].reason, ConflictReason::Purged);
        assert!(cache.read(stored.id).is_none());
        assert!(!cache.is_dirty());
    }

    #[test]
    fn test_cancelled_pass_keeps_pending_ops() {
        let cache = LocalCache::new();
        let store = FileStore::new();
        cache.stage(insert("https://a.com")).unwrap();
        cache.stage(insert("https://b.com")).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = reconcile(&cache, &store, &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.blocked.len(), 2);
        assert!(store.list(0).unwrap().is_empty());

        // Released entries go out on the next pass
        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.applied, 2);
    }

    #[test]
    fn test_catch_up_does_not_skip_foreign_revisions() {
        let (cache, store, stored) = synced("https://a.com");
        let mut local = stored.clone();
        local.label = "Local".to_string();
        cache.stage(StageOp::Update(local)).unwrap();

        // Lands after the pull would have run, below our write
        let foreign = store
            .put(&Bookmark::new(BookmarkId::provisional(9), "https://b.com"), 0)
            .unwrap();

        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert!(cache.read(foreign.id).is_some());
        assert_eq!(report.watermark, store.head_revision().unwrap());
    }

    /// Store where another writer gets in just before the first delete
    struct InterleavedStore {
        inner: FileStore,
        armed: AtomicBool,
    }

    impl DurableStore for InterleavedStore {
        fn backend(&self) -> &'static str {
            self.inner.backend()
        }

        fn get(&self, id: BookmarkId) -> StoreResult<Bookmark> {
            self.inner.get(id)
        }

        fn get_by_url(&self, url: &str) -> StoreResult<Bookmark> {
            self.inner.get_by_url(url)
        }

        fn put(&self, bookmark: &Bookmark, expected: Revision) -> StoreResult<Bookmark> {
            self.inner.put(bookmark, expected)
        }

        fn delete(&self, id: BookmarkId, expected: Revision) -> StoreResult<Bookmark> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner
                    .put(&Bookmark::new(BookmarkId::provisional(9), "https://foreign.com"), 0)?;
                let current = self.inner.get(id)?;
                self.inner.delete(id, current.revision)?;
            }
            self.inner.delete(id, expected)
        }

        fn list(&self, since: Revision) -> StoreResult<Vec<Bookmark>> {
            self.inner.list(since)
        }

        fn head_revision(&self) -> StoreResult<Revision> {
            self.inner.head_revision()
        }

        fn purge(&self, ids: &[BookmarkId]) -> StoreResult<usize> {
            self.inner.purge(ids)
        }
    }

    #[test]
    fn test_replayed_delete_catches_up_on_foreign_writes() {
        let (cache, inner, stored) = synced("https://a.com");
        let store = InterleavedStore {
            inner,
            armed: AtomicBool::new(true),
        };
        cache.stage(StageOp::Delete(stored.id)).unwrap();

        // The delete finds the record already tombstoned by the other writer
        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.already_applied, 1);
        assert_eq!(report.watermark, store.head_revision().unwrap());

        let foreign = store.get_by_url("https://foreign.com").unwrap();
        assert!(foreign.revision < report.watermark);
        assert_eq!(cache.read(foreign.id).unwrap(), foreign);
        assert!(cache.read(stored.id).unwrap().deleted);
    }

    #[test]
    fn test_revisions_strictly_increase() {
        let (cache, store, stored) = synced("https://example.com");
        let mut seen = vec![stored.revision];

        for i in 0..5 {
            let mut local = cache.read(stored.id).unwrap();
            local.label = format!("v{}", i);
            cache.stage(StageOp::Update(local)).unwrap();
            if i % 2 == 0 {
                foreign_edit(&store, stored.id, &format!("remote {}", i));
            }
            reconcile(&cache, &store, &CancelToken::new()).unwrap();
            seen.push(store.get(stored.id).unwrap().revision);
        }

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            store_timeout_ms: 50,
            ..Config::default()
        };
        let store = FileStore::open(&config).unwrap();
        let cache = LocalCache::new();
        cache.stage(insert("https://example.com")).unwrap();

        // Another process holds the store lock for the whole pass
        std::fs::write(config.store_lock_path(), b"1").unwrap();
        let err = reconcile(&cache, &store, &CancelToken::new()).unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.is_dirty());

        std::fs::remove_file(config.store_lock_path()).unwrap();
        let report = reconcile(&cache, &store, &CancelToken::new()).unwrap();
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn test_compaction_eligibility() {
        let (cache, store, stored) = synced("https://old.com");
        cache.stage(insert("https://other.com")).unwrap();
        reconcile(&cache, &store, &CancelToken::new()).unwrap();
        let other = store.get_by_url("https://other.com").unwrap();

        cache.stage(StageOp::Delete(stored.id)).unwrap();
        reconcile(&cache, &store, &CancelToken::new()).unwrap();
        cache.stage(StageOp::Delete(other.id)).unwrap();

        // Inside the retention window: nothing purged
        let report = compact(&cache, &store, Duration::days(30), Utc::now()).unwrap();
        assert!(report.purged.is_empty());
        assert_eq!(report.retained, 1);
        assert_eq!(report.pending, 1);

        // Past the window: only the synced tombstone goes
        let later = Utc::now() + Duration::days(31);
        let report = compact(&cache, &store, Duration::days(30), later).unwrap();
        assert_eq!(report.purged, vec![stored.id]);
        assert!(cache.read(stored.id).is_none());
        assert!(matches!(store.get(stored.id), Err(StoreError::NotFound { .. })));
        assert!(cache.read(other.id).unwrap().deleted);
    }
}
