//! Metadata enrichment
//!
//! An [`Enricher`] looks up a better label and description for a bookmark,
//! typically by fetching its page. The core only decides which records need
//! it and stages the result through the local cache like any other edit.
//!
//! Enrichment of one id never runs twice concurrently: [`EnrichmentPass`]
//! claims the id for the duration of the call.

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, LocalCache, StageOp};
use crate::models::{Bookmark, BookmarkId};

/// Errors from an enrichment attempt
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    #[error("Fetching {url} failed: {details}")]
    Fetch { url: String, details: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl EnrichError {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichError::Timeout { .. } | EnrichError::Fetch { .. } => true,
            EnrichError::Status { status, .. } => *status == 429 || *status >= 500,
            EnrichError::Cache(_) => false,
        }
    }
}

/// What an enricher found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enrichment {
    Updated {
        label: Option<String>,
        description: Option<String>,
    },
    NoChange,
}

/// Source of page metadata
///
/// Calls block and must be safe to retry.
pub trait Enricher: Send + Sync {
    fn enrich(&self, bookmark: &Bookmark) -> Result<Enrichment, EnrichError>;
}

/// Fill the fields that still need work; `None` if nothing changes
///
/// A label equal to the URL is not an improvement.
pub fn apply_enrichment(bookmark: &Bookmark, enrichment: &Enrichment) -> Option<Bookmark> {
    let Enrichment::Updated { label, description } = enrichment else {
        return None;
    };

    let mut updated = bookmark.clone();
    let label_needs_work = updated.label.trim().is_empty() || updated.label == updated.url;
    if let Some(label) = label.as_deref().map(str::trim) {
        if label_needs_work && !label.is_empty() && label != updated.url {
            updated.label = label.to_string();
        }
    }
    if let Some(description) = description.as_deref().map(str::trim) {
        if updated.description.trim().is_empty() && !description.is_empty() {
            updated.description = description.to_string();
        }
    }

    if updated.same_content(bookmark) {
        None
    } else {
        Some(updated)
    }
}

/// Outcome for one bookmark
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichStatus {
    /// An update was staged
    Updated(Bookmark),
    /// The enricher found nothing better
    NoChange,
    /// The record does not need enrichment (or no longer exists)
    Skipped,
    /// Another caller is enriching this id right now
    Busy,
}

/// Failed enrichment of one bookmark
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichFailure {
    pub id: BookmarkId,
    pub url: String,
    pub error: String,
    pub retryable: bool,
}

/// Result of an enrichment run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichReport {
    pub attempted: usize,
    pub updated: Vec<BookmarkId>,
    pub unchanged: usize,
    pub busy: usize,
    pub failed: Vec<EnrichFailure>,
}

/// Runs enrichment with at most one call in flight per id
#[derive(Debug, Default)]
pub struct EnrichmentPass {
    in_flight: Mutex<HashSet<BookmarkId>>,
    delay: Duration,
}

impl EnrichmentPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between fetches in a batch run
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn claim(&self, id: BookmarkId) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.insert(id) {
            Some(Claim { pass: self, id })
        } else {
            None
        }
    }

    /// Enrich one bookmark and stage the result
    pub fn enrich_one(
        &self,
        cache: &LocalCache,
        enricher: &dyn Enricher,
        id: BookmarkId,
    ) -> Result<EnrichStatus, EnrichError> {
        let Some(_claim) = self.claim(id) else {
            debug!("Enrichment of {} already running", id);
            return Ok(EnrichStatus::Busy);
        };

        let Some(bookmark) = cache.read(id).filter(Bookmark::needs_enrichment) else {
            return Ok(EnrichStatus::Skipped);
        };

        let enrichment = enricher.enrich(&bookmark)?;

        // The record may have been edited while the fetch ran
        let Some(current) = cache.read(id).filter(Bookmark::needs_enrichment) else {
            return Ok(EnrichStatus::Skipped);
        };
        match apply_enrichment(&current, &enrichment) {
            Some(updated) => {
                let staged = cache.stage(StageOp::Update(updated))?;
                debug!("Enriched {} ({})", staged.id, staged.url);
                Ok(EnrichStatus::Updated(staged))
            }
            None => Ok(EnrichStatus::NoChange),
        }
    }

    /// Enrich every live bookmark that needs it, up to `limit`
    ///
    /// A failure on one record never stops the run.
    pub fn run(
        &self,
        cache: &LocalCache,
        enricher: &dyn Enricher,
        limit: Option<usize>,
    ) -> EnrichReport {
        let targets: Vec<Bookmark> = cache
            .read_live()
            .into_iter()
            .filter(Bookmark::needs_enrichment)
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        let mut report = EnrichReport::default();
        for (i, bookmark) in targets.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }

            report.attempted += 1;
            match self.enrich_one(cache, enricher, bookmark.id) {
                Ok(EnrichStatus::Updated(updated)) => report.updated.push(updated.id),
                Ok(EnrichStatus::NoChange) | Ok(EnrichStatus::Skipped) => report.unchanged += 1,
                Ok(EnrichStatus::Busy) => report.busy += 1,
                Err(e) => {
                    warn!("Could not enrich {}: {}", bookmark.url, e);
                    report.failed.push(EnrichFailure {
                        id: bookmark.id,
                        url: bookmark.url.clone(),
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Enrichment: {} attempted, {} updated, {} failed",
            report.attempted,
            report.updated.len(),
            report.failed.len()
        );
        report
    }
}

/// Releases an id when its enrichment ends
struct Claim<'a> {
    pass: &'a EnrichmentPass,
    id: BookmarkId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.pass
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candidate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedEnricher {
        result: Enrichment,
        calls: AtomicUsize,
    }

    impl FixedEnricher {
        fn new(label: &str, description: &str) -> Self {
            Self {
                result: Enrichment::Updated {
                    label: Some(label.to_string()),
                    description: Some(description.to_string()),
                },
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Enricher for FixedEnricher {
        fn enrich(&self, _bookmark: &Bookmark) -> Result<Enrichment, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    struct FailingEnricher;

    impl Enricher for FailingEnricher {
        fn enrich(&self, bookmark: &Bookmark) -> Result<Enrichment, EnrichError> {
            Err(EnrichError::Timeout {
                url: bookmark.url.clone(),
            })
        }
    }

    fn add(cache: &LocalCache, candidate: Candidate) -> Bookmark {
        cache
            .stage(StageOp::Insert {
                candidate,
                confirmed: true,
            })
            .unwrap()
    }

    #[test]
    fn test_apply_enrichment_fills_missing_fields_only() {
        let mut bookmark = Bookmark::new(BookmarkId(1), "https://example.com");
        bookmark.description = "Mine".to_string();

        let enrichment = Enrichment::Updated {
            label: Some("Example Domain".to_string()),
            description: Some("Theirs".to_string()),
        };
        let updated = apply_enrichment(&bookmark, &enrichment).unwrap();
        assert_eq!(updated.label, "Example Domain");
        assert_eq!(updated.description, "Mine");

        // A label that is just the URL is no improvement
        let same = Enrichment::Updated {
            label: Some("https://example.com".to_string()),
            description: None,
        };
        assert!(apply_enrichment(&bookmark, &same).is_none());
        assert!(apply_enrichment(&bookmark, &Enrichment::NoChange).is_none());
    }

    #[test]
    fn test_enrich_one_stages_update() {
        let cache = LocalCache::new();
        let bookmark = add(&cache, Candidate::new("https://example.com"));
        let enricher = FixedEnricher::new("Example", "An example page");

        let pass = EnrichmentPass::new();
        let status = pass.enrich_one(&cache, &enricher, bookmark.id).unwrap();
        assert!(matches!(status, EnrichStatus::Updated(_)));

        let enriched = cache.read(bookmark.id).unwrap();
        assert_eq!(enriched.label, "Example");
        assert_eq!(enriched.description, "An example page");
        assert!(!enriched.needs_enrichment());

        // Nothing left to do
        let status = pass.enrich_one(&cache, &enricher, bookmark.id).unwrap();
        assert_eq!(status, EnrichStatus::Skipped);
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_claimed_id_is_busy() {
        let cache = LocalCache::new();
        let bookmark = add(&cache, Candidate::new("https://example.com"));
        let pass = EnrichmentPass::new();

        let claim = pass.claim(bookmark.id).unwrap();
        let status = pass
            .enrich_one(&cache, &FixedEnricher::new("A", "B"), bookmark.id)
            .unwrap();
        assert_eq!(status, EnrichStatus::Busy);

        drop(claim);
        assert!(pass.claim(bookmark.id).is_some());
    }

    #[test]
    fn test_concurrent_enrichment_of_one_id() {
        struct SlowEnricher(AtomicUsize);

        impl Enricher for SlowEnricher {
            fn enrich(&self, _bookmark: &Bookmark) -> Result<Enrichment, EnrichError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(100));
                Ok(Enrichment::NoChange)
            }
        }

        let cache = Arc::new(LocalCache::new());
        let bookmark = add(&cache, Candidate::new("https://example.com"));
        let pass = Arc::new(EnrichmentPass::new());
        let enricher = Arc::new(SlowEnricher(AtomicUsize::new(0)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (cache, pass, enricher) =
                    (Arc::clone(&cache), Arc::clone(&pass), Arc::clone(&enricher));
                thread::spawn(move || pass.enrich_one(&cache, enricher.as_ref(), bookmark.id))
            })
            .collect();
        let statuses: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let ran = statuses
            .iter()
            .filter(|s| **s == EnrichStatus::NoChange)
            .count();
        assert!(ran >= 1);
        assert_eq!(ran + statuses.iter().filter(|s| **s == EnrichStatus::Busy).count(), 4);
        assert_eq!(enricher.0.load(Ordering::SeqCst), ran);
    }

    #[test]
    fn test_run_continues_past_failures() {
        let cache = LocalCache::new();
        add(&cache, Candidate::new("https://a.com"));
        add(&cache, Candidate::new("https://b.com"));
        add(
            &cache,
            Candidate::new("https://c.com")
                .with_label("C")
                .with_description("Done"),
        );

        let report = EnrichmentPass::new().run(&cache, &FailingEnricher, None);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| f.retryable));

        let report = EnrichmentPass::new().run(&cache, &FixedEnricher::new("L", "D"), Some(1));
        assert_eq!(report.attempted, 1);
        assert_eq!(report.updated.len(), 1);
    }
}
