//! Sync coordinator
//!
//! Runs merge sessions between the local cache and the durable store.
//!
//! ## Sessions
//!
//! ```text
//! Idle -> Running -> {Succeeded, PartiallyFailed, Failed}
//! ```
//!
//! At most one session runs at a time. A caller asking for a sync while one
//! is running waits for that session and receives its outcome instead of
//! starting another. The terminal phase of the last session stays published
//! until the next one starts.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use crate::cache::{JournalEntry, LocalCache};
use crate::merge::{reconcile, CancelToken, MergeReport};
use crate::storage::DurableStore;

/// Phase of the current (or last) sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No session has run yet
    Idle,
    /// A session is in progress
    Running,
    /// Every pending op was resolved
    Succeeded,
    /// Some ops hit retryable errors
    PartiallyFailed,
    /// Fatal error, or retries exhausted
    Failed,
}

impl SyncPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Succeeded | SyncPhase::PartiallyFailed | SyncPhase::Failed
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => write!(f, "idle"),
            SyncPhase::Running => write!(f, "running"),
            SyncPhase::Succeeded => write!(f, "succeeded"),
            SyncPhase::PartiallyFailed => write!(f, "partially failed"),
            SyncPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one session (or of a retry sequence)
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub phase: SyncPhase,
    /// Report of the last pass that completed
    pub report: Option<MergeReport>,
    /// Error that ended the last pass, if any
    pub error: Option<String>,
    /// Journal entries still unsynced when the sequence gave up
    pub remaining: Vec<JournalEntry>,
    /// Sessions run to produce this outcome
    pub attempts: u32,
}

impl SessionOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            phase: SyncPhase::Failed,
            report: None,
            error: Some(error.into()),
            remaining: Vec::new(),
            attempts: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.phase == SyncPhase::Succeeded
    }
}

type SessionSlot = Option<watch::Receiver<Option<SessionOutcome>>>;

/// Owns the session lock and the retry policy
pub struct SyncCoordinator {
    cache: Arc<LocalCache>,
    store: Arc<dyn DurableStore>,
    policy: RetryPolicy,
    session: Mutex<SessionSlot>,
    cancel: Mutex<CancelToken>,
    phase_tx: watch::Sender<SyncPhase>,
}

impl SyncCoordinator {
    pub fn new(cache: Arc<LocalCache>, store: Arc<dyn DurableStore>, policy: RetryPolicy) -> Self {
        let (phase_tx, _) = watch::channel(SyncPhase::Idle);
        Self {
            cache,
            store,
            policy,
            session: Mutex::new(None),
            cancel: Mutex::new(CancelToken::new()),
            phase_tx,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current phase
    pub fn phase(&self) -> SyncPhase {
        *self.phase_tx.borrow()
    }

    /// Watch phase changes
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    /// Ask the running session to stop after its current record
    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one session, or join the one already running
    pub async fn sync_now(&self) -> SessionOutcome {
        let owner = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(running) => Err(running.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx);
                    Ok(tx)
                }
            }
        };

        match owner {
            Ok(tx) => {
                let _guard = SessionGuard { coordinator: self };
                let outcome = self.run_session().await;
                self.slot().take();
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
            Err(mut running) => {
                debug!("Sync already running, joining it");
                match running.wait_for(Option::is_some).await {
                    Ok(outcome) => outcome.clone().unwrap_or_else(|| {
                        SessionOutcome::failed("sync session ended without an outcome")
                    }),
                    Err(_) => SessionOutcome::failed("sync session was abandoned"),
                }
            }
        }
    }

    /// Run sessions until one does not partially fail or attempts run out
    ///
    /// Running out of attempts gives `Failed` with the unsynced journal
    /// entries attached; they stay journaled.
    pub async fn sync_with_retry(&self) -> SessionOutcome {
        let mut attempt = 0;
        loop {
            let mut outcome = self.sync_now().await;
            attempt += 1;
            outcome.attempts = attempt;

            match outcome.phase {
                SyncPhase::PartiallyFailed if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt - 1);
                    warn!(
                        "Sync attempt {} of {} partially failed, retrying in {:?}",
                        attempt, self.policy.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                SyncPhase::PartiallyFailed | SyncPhase::Failed => {
                    outcome.phase = SyncPhase::Failed;
                    outcome.remaining = self.cache.pending_entries();
                    self.phase_tx.send_replace(SyncPhase::Failed);
                    warn!(
                        "Sync failed after {} attempts, {} journal entries left for inspection",
                        attempt,
                        outcome.remaining.len()
                    );
                    return outcome;
                }
                _ => return outcome,
            }
        }
    }

    async fn run_session(&self) -> SessionOutcome {
        self.phase_tx.send_replace(SyncPhase::Running);
        let cancel = {
            let mut current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            *current = CancelToken::new();
            current.clone()
        };

        let cache = Arc::clone(&self.cache);
        let store = Arc::clone(&self.store);
        let joined =
            tokio::task::spawn_blocking(move || reconcile(&cache, store.as_ref(), &cancel)).await;

        let outcome = match joined {
            Ok(Ok(report)) => {
                let phase = if report.has_failures() {
                    SyncPhase::PartiallyFailed
                } else {
                    SyncPhase::Succeeded
                };
                SessionOutcome {
                    phase,
                    error: report.retryable.first().map(|f| f.to_string()),
                    report: Some(report),
                    remaining: Vec::new(),
                    attempts: 1,
                }
            }
            Ok(Err(e)) if e.is_retryable() => SessionOutcome {
                phase: SyncPhase::PartiallyFailed,
                report: None,
                error: Some(e.to_string()),
                remaining: Vec::new(),
                attempts: 1,
            },
            Ok(Err(e)) => {
                let mut outcome = SessionOutcome::failed(e.to_string());
                outcome.remaining = self.cache.pending_entries();
                outcome
            }
            Err(e) => SessionOutcome::failed(format!("sync task panicked: {}", e)),
        };

        info!("Sync session {}", outcome.phase);
        self.phase_tx.send_replace(outcome.phase);
        outcome
    }
}

/// Frees the session slot if the owning future is dropped mid-session
struct SessionGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.slot().take();
    }
}
