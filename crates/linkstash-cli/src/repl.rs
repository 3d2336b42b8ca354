//! Line-oriented interactive shell
//!
//! Each line is parsed with the same command definitions as the CLI. A
//! background sync task runs for the whole session; writes nudge it instead
//! of syncing inline.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use linkstash_core::sync::{spawn_sync_task, SyncCommand, SyncTaskEvent};
use linkstash_core::Stash;

use crate::commands::Completion;
use crate::output::Output;
use crate::{execute, Commands};

const PROMPT: &str = "links> ";

#[derive(Parser)]
#[command(name = "links", no_binary_name = true, disable_version_flag = true)]
struct ReplLine {
    #[command(subcommand)]
    command: Commands,
}

/// Run the shell until `exit` or end of input
pub fn run(stash: &Stash, output: &Output) -> Result<Completion> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let handle = {
        let _guard = runtime.enter();
        spawn_sync_task(stash.coordinator(), stash.config().sync_interval())
    };
    let commands = handle.command_tx;
    runtime.spawn(log_sync_events(handle.event_rx));

    output.message("linkstash shell. Type 'help' for commands, 'exit' to leave.");

    let mut completion = Completion::Done;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("{}", PROMPT);
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let line = line.trim();

        match line {
            "" => continue,
            "exit" | "quit" => break,
            _ => {}
        }

        let words = match split_words(line) {
            Ok(words) => words,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        let parsed = match ReplLine::try_parse_from(words) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Help and usage errors both print through clap
                let _ = e.print();
                continue;
            }
        };

        let is_write = parsed.command.is_write();
        match execute(stash, parsed.command, output) {
            Ok(done) => completion = completion.and(done),
            Err(e) => {
                eprintln!("Error: {:#}", e);
                completion = Completion::Partial;
            }
        }
        if is_write && commands.try_send(SyncCommand::SyncNow).is_err() {
            debug!("Sync task busy; changes go out with the next session");
        }
    }

    let _ = runtime.block_on(commands.send(SyncCommand::Shutdown));
    runtime.shutdown_timeout(stash.config().store_timeout());
    Ok(completion)
}

/// Report background sessions without interrupting the prompt
async fn log_sync_events(mut events: mpsc::Receiver<SyncTaskEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncTaskEvent::SessionFinished(outcome) => {
                if let Some(report) = outcome.report.filter(|r| r.needs_attention()) {
                    warn!(
                        "Background sync: {} conflict(s), {} held, {} to retry",
                        report.conflicts.len(),
                        report.needs_confirmation.len(),
                        report.retryable.len()
                    );
                }
                if !outcome.remaining.is_empty() {
                    warn!("{} change(s) still queued", outcome.remaining.len());
                }
            }
            SyncTaskEvent::Error(error) => warn!("Background sync failed: {}", error),
            SyncTaskEvent::PhaseChanged(phase) => debug!("Sync phase: {}", phase),
        }
    }
}

/// Split a line into words, honoring single and double quotes
fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        bail!("Unterminated quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
