//! Sync between the local cache and the durable store
//!
//! The merge itself lives in [`crate::merge`]; this module schedules it:
//!
//! - `coordinator`: one session at a time, coalesced callers, retries
//! - `backoff`: exponential backoff with jitter
//! - `task`: timer-driven background task controlled over channels
//!
//! ## Usage
//!
//! ```ignore
//! let coordinator = Arc::new(SyncCoordinator::new(cache, store, RetryPolicy::default()));
//! let handle = spawn_sync_task(coordinator, Duration::from_secs(60));
//! handle.sync_now().await;
//! ```

mod backoff;
mod coordinator;
mod task;

pub use backoff::RetryPolicy;
pub use coordinator::{SessionOutcome, SyncCoordinator, SyncPhase};
pub use task::{spawn_sync_task, SyncCommand, SyncTaskEvent, SyncTaskHandle};
