//! Sync command handlers

use anyhow::{Context, Result};
use tracing::debug;

use linkstash_core::sync::{spawn_sync_task, SyncTaskEvent};
use linkstash_core::{SessionOutcome, Stash};

use super::Completion;
use crate::output::Output;

/// Run one sync pass and print what it did
pub fn sync(stash: &Stash, output: &Output) -> Result<Completion> {
    let report = stash.reconcile()?;
    output.print_merge_report(&report);

    if report.needs_attention() || report.cancelled {
        Ok(Completion::Partial)
    } else {
        Ok(Completion::Done)
    }
}

/// Push staged changes after a write; failures leave them queued
pub fn push(stash: &Stash, output: &Output) -> Completion {
    match stash.reconcile() {
        Ok(report) if report.needs_attention() => {
            output.print_merge_report(&report);
            Completion::Partial
        }
        Ok(report) => {
            debug!("Pushed {} change(s)", report.applied + report.retargeted);
            Completion::Done
        }
        Err(e) => {
            output.warn(&format!("{:#}", e));
            Completion::Partial
        }
    }
}

/// Sync on a timer until interrupted
pub fn watch(stash: &Stash, output: &Output) -> Result<Completion> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(watch_loop(stash, output))
}

async fn watch_loop(stash: &Stash, output: &Output) -> Result<Completion> {
    let interval = stash.config().sync_interval();
    let mut handle = spawn_sync_task(stash.coordinator(), interval);
    output.message(&format!(
        "Syncing every {}s. Press Ctrl-C to stop.",
        interval.as_secs()
    ));

    let mut completion = Completion::Done;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = handle.event_rx.recv() => match event {
                Some(SyncTaskEvent::SessionFinished(outcome)) => {
                    completion = completion.and(print_outcome(&outcome, output));
                }
                Some(SyncTaskEvent::Error(error)) => output.warn(&format!("Sync failed: {}", error)),
                Some(SyncTaskEvent::PhaseChanged(phase)) => debug!("Sync phase: {}", phase),
                None => break,
            }
        }
    }

    handle.shutdown().await;
    output.message("Sync stopped.");
    Ok(completion)
}

/// Print one background session; `Partial` unless it finished clean
pub fn print_outcome(outcome: &SessionOutcome, output: &Output) -> Completion {
    if let Some(ref report) = outcome.report {
        output.print_merge_report(report);
    }
    if !outcome.remaining.is_empty() {
        output.message(&format!(
            "{} change(s) still queued after {} attempt(s):",
            outcome.remaining.len(),
            outcome.attempts
        ));
        for entry in &outcome.remaining {
            output.message(&format!(
                "  {} {} ({})",
                entry.kind, entry.snapshot.id, entry.snapshot.url
            ));
        }
    }

    let clean = outcome.is_success()
        && outcome
            .report
            .as_ref()
            .map_or(true, |report| !report.needs_attention());
    if clean {
        Completion::Done
    } else {
        Completion::Partial
    }
}
