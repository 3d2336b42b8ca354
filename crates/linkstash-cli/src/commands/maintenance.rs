//! Analyze, compact and enrich handlers

use anyhow::Result;

use linkstash_core::Stash;

use super::Completion;
use crate::metadata::HtmlEnricher;
use crate::output::Output;

/// Summarize the stash: counts, pending changes, likely duplicates
pub fn analyze(stash: &Stash, output: &Output) -> Result<Completion> {
    let analysis = stash.analyze()?;
    output.print_analysis(&analysis);
    Ok(Completion::Done)
}

/// Purge tombstones older than the retention window
pub fn compact(stash: &Stash, output: &Output) -> Result<Completion> {
    let report = stash.compact()?;
    output.print_compaction(&report);
    Ok(Completion::Done)
}

/// Fetch labels and descriptions for bookmarks missing them
pub fn enrich(stash: &Stash, limit: Option<usize>, output: &Output) -> Result<Completion> {
    let enricher = HtmlEnricher::new(stash.config().enrich_timeout())?;
    let report = stash.enrich(&enricher, limit);
    output.print_enrich_report(&report);

    if report.failed.is_empty() {
        Ok(Completion::Done)
    } else {
        Ok(Completion::Partial)
    }
}
