//! Bookmark stash
//!
//! The `Stash` ties the pieces together for callers:
//! - the durable store chosen by the configuration
//! - the local cache and its journal (reads and staged writes)
//! - the merge engine and sync coordinator
//!
//! ## Usage
//!
//! ```ignore
//! let stash = Stash::open()?;  // replays the journal, then pulls
//!
//! // Stage a bookmark (returns immediately)
//! let outcome = stash.add(Candidate::new("https://example.com"), AddOptions::default())?;
//!
//! // Push it to the store
//! let report = stash.reconcile()?;
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::{LocalCache, RecoveryReport, StageOp};
use crate::config::Config;
use crate::enrich::{EnrichReport, EnrichStatus, Enricher, EnrichmentPass};
use crate::fuzzy::{duplicate_groups, find_similar, Match};
use crate::import::ImportFormat;
use crate::merge::{self, CancelToken, CompactionReport, MergeReport};
use crate::models::{normalize_tag, Bookmark, BookmarkEdit, BookmarkId, Candidate, Revision};
use crate::storage::{open_store, DurableStore};
use crate::sync::{RetryPolicy, SyncCoordinator};

/// How `add` treats near-duplicates
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOptions {
    /// Add even if similar bookmarks exist
    pub confirmed: bool,
    /// Merge into the best near-duplicate instead of asking
    pub auto_merge: bool,
}

/// Result of `add`
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// Staged as a new bookmark
    Added(Bookmark),
    /// Folded into an existing bookmark for the same page
    MergedInto(Bookmark),
    /// Nothing staged; similar bookmarks exist
    NeedsConfirmation(Vec<Match>),
}

/// Result of an import
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    /// Candidates the importer produced
    pub parsed: usize,
    pub added: Vec<Bookmark>,
    pub merged: Vec<Bookmark>,
    /// Candidates held back because of near-duplicates
    pub needs_confirmation: Vec<(Candidate, Vec<Match>)>,
    /// Candidates refused, with the reason
    pub rejected: Vec<(String, String)>,
}

/// Snapshot of the stash's state
#[derive(Debug, Clone)]
pub struct Analysis {
    pub backend: &'static str,
    pub total: usize,
    pub tombstones: usize,
    pub pending_ops: usize,
    pub needs_enrichment: usize,
    pub duplicate_groups: Vec<Vec<Bookmark>>,
    pub tags: usize,
    pub watermark: Revision,
    pub store_head: Option<Revision>,
}

/// Bookmark storage with a journaled local cache
pub struct Stash {
    config: Config,
    store: Arc<dyn DurableStore>,
    cache: Arc<LocalCache>,
    coordinator: Arc<SyncCoordinator>,
    enrichment: EnrichmentPass,
    recovery: RecoveryReport,
}

impl Stash {
    /// Open the stash with the default configuration
    pub fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config)
    }

    /// Open the stash with a specific configuration
    ///
    /// Replays the journal against the store, then runs one sync pass. A
    /// store that is only temporarily unavailable does not stop the open;
    /// reads are served from the journal and the next sync catches up.
    pub fn open_with_config(config: Config) -> Result<Self> {
        let store = open_store(&config).context("Failed to open the durable store")?;
        let cache = LocalCache::open(&config).context("Failed to open the sync journal")?;

        let recovery = cache
            .recover(store.as_ref())
            .context("Failed to replay the sync journal")?;
        for corrupt in &recovery.corrupt {
            warn!("Skipped corrupt journal entry: {}", corrupt);
        }
        if !recovery.is_clean() {
            info!(
                "Journal replay: {} applied, {} conflicts, {} still pending",
                recovery.replay.applied,
                recovery.replay.conflicts.len(),
                recovery.remaining
            );
        }

        match merge::reconcile(&cache, store.as_ref(), &CancelToken::new()) {
            Ok(report) => debug!("Initial sync pulled {} records", report.pulled),
            Err(e) if e.is_retryable() => warn!("Store unavailable, working from the cache: {}", e),
            Err(e) => return Err(e).context("Initial sync failed"),
        }

        let cache = Arc::new(cache);
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            RetryPolicy::from_config(&config),
        ));

        Ok(Self {
            config,
            store,
            cache,
            coordinator,
            enrichment: EnrichmentPass::new(),
            recovery,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Coordinator for background or retried syncs
    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// What the journal replay at open did
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    // ==================== Bookmark Operations ====================

    /// Add a bookmark
    ///
    /// An exact URL match is merged into the existing bookmark. Near-duplicates
    /// need confirmation unless `options` say otherwise.
    pub fn add(&self, candidate: Candidate, options: AddOptions) -> Result<AddOutcome> {
        candidate.validate()?;
        let draft = Bookmark::from_candidate(BookmarkId(0), &candidate);

        if let Some(existing) = self.cache.find_by_url(&draft.url) {
            return self.merge_into(existing, &draft);
        }

        let near = find_similar(
            &draft,
            &self.cache.read_live(),
            self.cache.similarity_threshold(),
        );
        if !near.is_empty() && !options.confirmed {
            if options.auto_merge || self.config.auto_merge {
                return self.merge_into(near[0].bookmark.clone(), &draft);
            }
            debug!("{} has {} near-duplicates", draft.url, near.len());
            return Ok(AddOutcome::NeedsConfirmation(near));
        }

        let staged = self
            .cache
            .stage(StageOp::Insert {
                candidate,
                confirmed: options.confirmed,
            })
            .context("Failed to stage bookmark")?;
        Ok(AddOutcome::Added(staged))
    }

    fn merge_into(&self, mut existing: Bookmark, draft: &Bookmark) -> Result<AddOutcome> {
        if !existing.merge_from(draft) {
            return Ok(AddOutcome::MergedInto(existing));
        }
        let staged = self
            .cache
            .stage(StageOp::Update(existing))
            .context("Failed to stage merged bookmark")?;
        Ok(AddOutcome::MergedInto(staged))
    }

    /// Apply an edit to a bookmark
    pub fn edit(&self, id: BookmarkId, edit: &BookmarkEdit) -> Result<Bookmark> {
        let Some(mut bookmark) = self.get(id) else {
            bail!("No bookmark with id {}", id);
        };
        if !edit.apply(&mut bookmark) {
            return Ok(bookmark);
        }

        if let Some(other) = self.cache.find_by_url(&bookmark.url) {
            if other.id != id {
                bail!("URL {} is already bookmark {}", bookmark.url, other.id);
            }
        }

        self.cache
            .stage(StageOp::Update(bookmark))
            .with_context(|| format!("Failed to stage edit of bookmark {}", id))
    }

    /// Delete a bookmark
    pub fn delete(&self, id: BookmarkId) -> Result<Bookmark> {
        self.cache
            .stage(StageOp::Delete(id))
            .with_context(|| format!("Failed to delete bookmark {}", id))
    }

    /// Delete the bookmark with this exact URL
    pub fn delete_by_url(&self, url: &str) -> Result<Bookmark> {
        let Some(bookmark) = self.cache.find_by_url(url) else {
            bail!("No bookmark with URL {}", url.trim());
        };
        self.delete(bookmark.id)
    }

    /// Live bookmark by id
    pub fn get(&self, id: BookmarkId) -> Option<Bookmark> {
        self.cache.read(id).filter(|b| !b.deleted)
    }

    /// All live bookmarks, newest first
    pub fn list(&self) -> Vec<Bookmark> {
        let mut bookmarks = self.cache.read_live();
        bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        bookmarks
    }

    /// Live bookmarks carrying a tag
    pub fn list_by_tag(&self, tag: &str) -> Vec<Bookmark> {
        let Some(tag) = normalize_tag(tag) else {
            return Vec::new();
        };
        self.list()
            .into_iter()
            .filter(|b| b.tags.contains(&tag))
            .collect()
    }

    /// Live bookmarks matching a query in url, label, description or tags
    pub fn search(&self, query: &str) -> Vec<Bookmark> {
        self.list()
            .into_iter()
            .filter(|b| b.matches_query(query))
            .collect()
    }

    /// Tags in use, most used first
    pub fn tags_with_counts(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for bookmark in self.cache.read_live() {
            for tag in bookmark.tags {
                *counts.entry(tag).or_default() += 1;
            }
        }
        let mut tags: Vec<(String, usize)> = counts.into_iter().collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tags
    }

    /// Accept a held insert despite its near-duplicates
    pub fn confirm(&self, id: BookmarkId) -> Result<()> {
        self.cache
            .confirm_insert(id)
            .with_context(|| format!("Failed to confirm bookmark {}", id))
    }

    /// Fold a held insert into an existing bookmark
    pub fn retarget(&self, id: BookmarkId, target: BookmarkId) -> Result<Bookmark> {
        self.cache
            .retarget_insert(id, target)
            .with_context(|| format!("Failed to merge bookmark {} into {}", id, target))
    }

    // ==================== Analysis ====================

    pub fn analyze(&self) -> Result<Analysis> {
        let all = self.cache.read_all();
        let live: Vec<&Bookmark> = all.iter().filter(|b| !b.deleted).collect();

        let store_head = match self.store.head_revision() {
            Ok(head) => Some(head),
            Err(e) if !e.is_fatal() => {
                warn!("Could not read store head: {}", e);
                None
            }
            Err(e) => return Err(e).context("Failed to read store head"),
        };

        Ok(Analysis {
            backend: self.store.backend(),
            total: live.len(),
            tombstones: all.len() - live.len(),
            pending_ops: self.cache.pending_entries().len(),
            needs_enrichment: live.iter().filter(|b| b.needs_enrichment()).count(),
            duplicate_groups: duplicate_groups(live.iter().copied()),
            tags: self.tags_with_counts().len(),
            watermark: self.cache.watermark(),
            store_head,
        })
    }

    // ==================== Sync ====================

    /// Run one sync pass now
    pub fn reconcile(&self) -> Result<MergeReport> {
        merge::reconcile(&self.cache, self.store.as_ref(), &CancelToken::new())
            .context("Sync failed; pending changes stay in the journal")
    }

    /// Purge tombstones past the retention window
    pub fn compact(&self) -> Result<CompactionReport> {
        merge::compact(
            &self.cache,
            self.store.as_ref(),
            self.config.tombstone_retention(),
            Utc::now(),
        )
        .context("Compaction failed")
    }

    // ==================== Import ====================

    /// Import links from a file (format guessed from the extension if not given)
    pub fn import_file(&self, path: &Path, format: Option<ImportFormat>) -> Result<ImportSummary> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.import_str(&raw, format.unwrap_or_else(|| ImportFormat::detect(path)))
    }

    /// Import links from raw text; every candidate goes through `add`
    pub fn import_str(&self, raw: &str, format: ImportFormat) -> Result<ImportSummary> {
        let candidates = format
            .importer()
            .parse(raw)
            .with_context(|| format!("Failed to parse {} import", format))?;

        let mut summary = ImportSummary {
            parsed: candidates.len(),
            ..ImportSummary::default()
        };
        for candidate in candidates {
            if let Err(e) = candidate.validate() {
                summary.rejected.push((candidate.url.clone(), e.to_string()));
                continue;
            }
            match self.add(candidate.clone(), AddOptions::default())? {
                AddOutcome::Added(bookmark) => summary.added.push(bookmark),
                AddOutcome::MergedInto(bookmark) => summary.merged.push(bookmark),
                AddOutcome::NeedsConfirmation(matches) => {
                    summary.needs_confirmation.push((candidate, matches))
                }
            }
        }

        info!(
            "Imported {} links: {} added, {} merged, {} need confirmation",
            summary.parsed,
            summary.added.len(),
            summary.merged.len(),
            summary.needs_confirmation.len()
        );
        Ok(summary)
    }

    // ==================== Enrichment ====================

    /// Enrich bookmarks that lack a label or description
    pub fn enrich(&self, enricher: &dyn Enricher, limit: Option<usize>) -> EnrichReport {
        self.enrichment.run(&self.cache, enricher, limit)
    }

    /// Enrich a single bookmark
    pub fn enrich_one(&self, enricher: &dyn Enricher, id: BookmarkId) -> Result<EnrichStatus> {
        self.enrichment
            .enrich_one(&self.cache, enricher, id)
            .with_context(|| format!("Failed to enrich bookmark {}", id))
    }
}
