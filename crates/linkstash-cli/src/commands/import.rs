//! Import command handler

use std::path::PathBuf;

use anyhow::Result;

use linkstash_core::{ImportFormat, Stash};

use super::Completion;
use crate::output::Output;

/// Import links from a text or JSON file
///
/// Near-duplicates are skipped and listed, never added silently.
pub fn import(
    stash: &Stash,
    path: PathBuf,
    format: Option<ImportFormat>,
    output: &Output,
) -> Result<Completion> {
    let summary = stash.import_file(&path, format)?;
    output.print_import_summary(&summary);

    if summary.needs_confirmation.is_empty() && summary.rejected.is_empty() {
        Ok(Completion::Done)
    } else {
        Ok(Completion::Partial)
    }
}
