//! Background sync task
//!
//! Runs sync sessions on a timer and on demand, independent of the callers
//! staging local writes. Each session goes through the coordinator, so the
//! background task and foreground callers never run two sessions at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::coordinator::{SessionOutcome, SyncCoordinator, SyncPhase};

/// Commands sent to the sync task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Run a session now instead of waiting for the timer
    SyncNow,
    /// Stop the task; a running session is cancelled between records
    Shutdown,
}

/// Events emitted by the sync task
#[derive(Debug, Clone)]
pub enum SyncTaskEvent {
    /// Session phase changed
    PhaseChanged(SyncPhase),
    /// A session (including its retries) finished
    SessionFinished(SessionOutcome),
    /// A session ended in an error
    Error(String),
}

/// Handle to control the background sync task
pub struct SyncTaskHandle {
    /// Send commands to the sync task
    pub command_tx: mpsc::Sender<SyncCommand>,
    /// Receive events from the sync task
    pub event_rx: mpsc::Receiver<SyncTaskEvent>,
    /// Watch the session phase
    pub phase_rx: watch::Receiver<SyncPhase>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncTaskHandle {
    /// Ask the task to run a session now
    pub async fn sync_now(&self) -> bool {
        self.command_tx.send(SyncCommand::SyncNow).await.is_ok()
    }

    /// Stop the task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Spawn the timer-driven sync task
///
/// The first session starts immediately, then one per `interval`.
pub fn spawn_sync_task(coordinator: Arc<SyncCoordinator>, interval: Duration) -> SyncTaskHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let phase_rx = coordinator.subscribe();

    let task = tokio::spawn(sync_task_loop(coordinator, interval, command_rx, event_tx));

    SyncTaskHandle {
        command_tx,
        event_rx,
        phase_rx,
        task,
    }
}

async fn sync_task_loop(
    coordinator: Arc<SyncCoordinator>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<SyncCommand>,
    event_tx: mpsc::Sender<SyncTaskEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Sync timer fired");
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(SyncCommand::SyncNow) => ticker.reset(),
                    Some(SyncCommand::Shutdown) | None => break,
                }
            }
        }

        if !run_session(&coordinator, &mut command_rx, &event_tx).await {
            break;
        }
    }

    info!("Sync task stopped");
}

/// Run one session with retries; returns false if the task should stop
async fn run_session(
    coordinator: &SyncCoordinator,
    command_rx: &mut mpsc::Receiver<SyncCommand>,
    event_tx: &mpsc::Sender<SyncTaskEvent>,
) -> bool {
    let _ = event_tx
        .send(SyncTaskEvent::PhaseChanged(SyncPhase::Running))
        .await;

    let session = coordinator.sync_with_retry();
    tokio::pin!(session);

    let outcome = loop {
        tokio::select! {
            outcome = &mut session => break outcome,
            cmd = command_rx.recv() => {
                match cmd {
                    // Already syncing; the request is served by this session
                    Some(SyncCommand::SyncNow) => continue,
                    Some(SyncCommand::Shutdown) | None => {
                        coordinator.cancel();
                        return false;
                    }
                }
            }
        }
    };

    let _ = event_tx
        .send(SyncTaskEvent::PhaseChanged(outcome.phase))
        .await;
    if let Some(ref error) = outcome.error {
        if outcome.phase != SyncPhase::Succeeded {
            let _ = event_tx.send(SyncTaskEvent::Error(error.clone())).await;
        }
    }
    let _ = event_tx.send(SyncTaskEvent::SessionFinished(outcome)).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LocalCache, StageOp};
    use crate::models::Candidate;
    use crate::storage::{DurableStore, FileStore};
    use crate::sync::RetryPolicy;

    fn coordinator() -> (Arc<LocalCache>, Arc<FileStore>, Arc<SyncCoordinator>) {
        let cache = Arc::new(LocalCache::new());
        let store = Arc::new(FileStore::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&cache),
            Arc::clone(&store) as Arc<dyn DurableStore>,
            RetryPolicy::no_retry(),
        ));
        (cache, store, coordinator)
    }

    async fn next_finished(handle: &mut SyncTaskHandle) -> SessionOutcome {
        loop {
            match handle.event_rx.recv().await {
                Some(SyncTaskEvent::SessionFinished(outcome)) => return outcome,
                Some(_) => continue,
                None => panic!("sync task stopped"),
            }
        }
    }

    #[tokio::test]
    async fn test_first_session_runs_immediately() {
        let (cache, store, coordinator) = coordinator();
        cache
            .stage(StageOp::Insert {
                candidate: Candidate::new("https://example.com"),
                confirmed: true,
            })
            .unwrap();

        let mut handle = spawn_sync_task(coordinator, Duration::from_secs(3600));
        let outcome = next_finished(&mut handle).await;
        assert!(outcome.is_success());
        assert!(store.get_by_url("https://example.com").is_ok());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_now_command() {
        let (cache, store, coordinator) = coordinator();
        let mut handle = spawn_sync_task(coordinator, Duration::from_secs(3600));
        next_finished(&mut handle).await;

        cache
            .stage(StageOp::Insert {
                candidate: Candidate::new("https://later.com"),
                confirmed: true,
            })
            .unwrap();
        assert!(handle.sync_now().await);

        let outcome = next_finished(&mut handle).await;
        assert_eq!(outcome.report.unwrap().applied, 1);
        assert!(store.get_by_url("https://later.com").is_ok());
        assert_eq!(*handle.phase_rx.borrow(), SyncPhase::Succeeded);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_events() {
        let (_cache, _store, coordinator) = coordinator();
        let mut handle = spawn_sync_task(coordinator, Duration::from_secs(3600));
        next_finished(&mut handle).await;

        handle.command_tx.send(SyncCommand::Shutdown).await.unwrap();
        while handle.event_rx.recv().await.is_some() {}
    }
}
