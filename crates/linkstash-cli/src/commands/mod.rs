//! Command handlers

pub mod bookmark;
pub mod config;
pub mod import;
pub mod maintenance;
pub mod sync;

use linkstash_core::BookmarkId;

/// How a command finished
///
/// `Partial` covers conflicts, held duplicates and queued retries: the
/// command did its work but something needs a look. Exits 0 unless `--strict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    Partial,
}

impl Completion {
    pub fn and(self, other: Completion) -> Completion {
        if self == Completion::Partial || other == Completion::Partial {
            Completion::Partial
        } else {
            Completion::Done
        }
    }
}

/// Parse a bookmark id as printed by `list` (`~N` for unsynced ones)
pub fn parse_id(id: &str) -> anyhow::Result<BookmarkId> {
    id.parse()
        .map_err(|_| anyhow::anyhow!("Invalid bookmark id '{}': expected a number like 42 or ~3", id))
}
