//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;
use serde_json::json;

use linkstash_core::merge::ConflictRecord;
use linkstash_core::{
    Analysis, Bookmark, CompactionReport, EnrichReport, ImportSummary, Match, MergeReport,
};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a single bookmark
    pub fn print_bookmark(&self, bookmark: &Bookmark) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:          {}", bookmark.id);
                println!("Label:       {}", bookmark.label);
                println!("URL:         {}", bookmark.url);
                if !bookmark.description.is_empty() {
                    println!("Description: {}", bookmark.description);
                }
                if !bookmark.tags.is_empty() {
                    println!("Tags:        {}", join_tags(bookmark));
                }
                println!("Created:     {}", bookmark.created_at.format("%Y-%m-%d %H:%M"));
                println!("Updated:     {}", bookmark.updated_at.format("%Y-%m-%d %H:%M"));
                if bookmark.id.is_provisional() {
                    println!("Status:      not synced yet");
                }
            }
            OutputFormat::Json => print_json(bookmark),
            OutputFormat::Quiet => {
                println!("{}", bookmark.id);
            }
        }
    }

    /// Print a list of bookmarks
    pub fn print_bookmarks(&self, bookmarks: &[Bookmark]) {
        match self.format {
            OutputFormat::Human => {
                if bookmarks.is_empty() {
                    println!("No bookmarks found.");
                    return;
                }
                for bookmark in bookmarks {
                    println!(
                        "{:>6} | {} | {}",
                        bookmark.id.to_string(),
                        truncate(&bookmark.label, 35),
                        truncate(&bookmark.url, 45)
                    );
                }
                println!("\n{} bookmark(s)", bookmarks.len());
            }
            OutputFormat::Json => print_json(&bookmarks),
            OutputFormat::Quiet => {
                for bookmark in bookmarks {
                    println!("{}", bookmark.id);
                }
            }
        }
    }

    /// Print near-duplicates of a URL that was not added
    pub fn print_matches(&self, url: &str, matches: &[Match]) {
        match self.format {
            OutputFormat::Human => {
                println!("{} looks like {} existing bookmark(s):", url, matches.len());
                for m in matches {
                    println!(
                        "  {:>6} ({:.2}) {} | {}",
                        m.bookmark.id.to_string(),
                        m.score,
                        truncate(&m.bookmark.label, 30),
                        truncate(&m.bookmark.url, 40)
                    );
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({
                        "status": "needs_confirmation",
                        "url": url,
                        "matches": matches_json(matches),
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a list of tags
    pub fn print_tags(&self, tags: &[(String, usize)]) {
        match self.format {
            OutputFormat::Human => {
                if tags.is_empty() {
                    println!("No tags found.");
                    return;
                }
                for (name, count) in tags {
                    println!("{} ({})", name, count);
                }
                println!("\n{} tag(s)", tags.len());
            }
            OutputFormat::Json => {
                let json_tags: Vec<_> = tags
                    .iter()
                    .map(|(name, count)| json!({"name": name, "count": count}))
                    .collect();
                print_json(&json_tags);
            }
            OutputFormat::Quiet => {
                for (name, _) in tags {
                    println!("{}", name);
                }
            }
        }
    }

    /// Print the result of a sync pass
    pub fn print_merge_report(&self, report: &MergeReport) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "Pulled {}, pushed {}, merged {}, already applied {} (watermark {})",
                    report.pulled,
                    report.applied,
                    report.retargeted,
                    report.already_applied,
                    report.watermark
                );
                if report.cancelled {
                    println!("Sync was cancelled; remaining changes stay queued.");
                }
                for conflict in &report.conflicts {
                    println!("  conflict: {}", conflict);
                }
                for failure in &report.retryable {
                    println!("  will retry: {}", failure);
                }
                for request in &report.needs_confirmation {
                    println!(
                        "  held: {} {} looks like {} existing bookmark(s); confirm or merge it",
                        request.id,
                        request.url,
                        request.matches.len()
                    );
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({
                        "pulled": report.pulled,
                        "applied": report.applied,
                        "retargeted": report.retargeted,
                        "already_applied": report.already_applied,
                        "conflicts": report.conflicts.iter().map(conflict_json).collect::<Vec<_>>(),
                        "retryable": report.retryable.iter().map(|f| json!({
                            "id": f.id,
                            "url": f.url,
                            "op": f.kind.to_string(),
                            "error": f.error,
                        })).collect::<Vec<_>>(),
                        "blocked": report.blocked,
                        "needs_confirmation": report.needs_confirmation.iter().map(|r| json!({
                            "id": r.id,
                            "url": r.url,
                            "matches": matches_json(&r.matches),
                        })).collect::<Vec<_>>(),
                        "cancelled": report.cancelled,
                        "watermark": report.watermark,
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    pub fn print_analysis(&self, analysis: &Analysis) {
        match self.format {
            OutputFormat::Human => {
                println!("Backend:           {}", analysis.backend);
                println!("Bookmarks:         {}", analysis.total);
                println!("Tombstones:        {}", analysis.tombstones);
                println!("Tags:              {}", analysis.tags);
                println!("Pending changes:   {}", analysis.pending_ops);
                println!("Need enrichment:   {}", analysis.needs_enrichment);
                println!("Watermark:         {}", analysis.watermark);
                match analysis.store_head {
                    Some(head) => println!("Store revision:    {}", head),
                    None => println!("Store revision:    (unavailable)"),
                }
                if !analysis.duplicate_groups.is_empty() {
                    println!();
                    println!("Possible duplicates:");
                    for group in &analysis.duplicate_groups {
                        let ids: Vec<String> = group.iter().map(|b| b.id.to_string()).collect();
                        println!("  [{}] {}", ids.join(", "), truncate(&group[0].url, 50));
                    }
                }
            }
            OutputFormat::Json => {
                let groups: Vec<Vec<_>> = analysis
                    .duplicate_groups
                    .iter()
                    .map(|group| group.iter().map(|b| json!({"id": b.id, "url": b.url})).collect())
                    .collect();
                println!(
                    "{}",
                    json!({
                        "backend": analysis.backend,
                        "total": analysis.total,
                        "tombstones": analysis.tombstones,
                        "tags": analysis.tags,
                        "pending_ops": analysis.pending_ops,
                        "needs_enrichment": analysis.needs_enrichment,
                        "duplicate_groups": groups,
                        "watermark": analysis.watermark,
                        "store_head": analysis.store_head,
                    })
                );
            }
            OutputFormat::Quiet => {
                println!("{}", analysis.total);
            }
        }
    }

    pub fn print_import_summary(&self, summary: &ImportSummary) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "Parsed {} link(s): {} added, {} merged, {} need confirmation, {} rejected",
                    summary.parsed,
                    summary.added.len(),
                    summary.merged.len(),
                    summary.needs_confirmation.len(),
                    summary.rejected.len()
                );
                for (candidate, matches) in &summary.needs_confirmation {
                    println!(
                        "  skipped {} (looks like {})",
                        candidate.url,
                        matches
                            .iter()
                            .map(|m| m.bookmark.id.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                for (url, error) in &summary.rejected {
                    println!("  rejected {}: {}", url, error);
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({
                        "parsed": summary.parsed,
                        "added": summary.added.iter().map(|b| b.id).collect::<Vec<_>>(),
                        "merged": summary.merged.iter().map(|b| b.id).collect::<Vec<_>>(),
                        "needs_confirmation": summary.needs_confirmation.iter().map(|(c, m)| json!({
                            "url": c.url,
                            "matches": matches_json(m),
                        })).collect::<Vec<_>>(),
                        "rejected": summary.rejected.iter().map(|(url, error)| json!({
                            "url": url,
                            "error": error,
                        })).collect::<Vec<_>>(),
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    pub fn print_enrich_report(&self, report: &EnrichReport) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "Enriched {} of {} bookmark(s); {} unchanged, {} busy, {} failed",
                    report.updated.len(),
                    report.attempted,
                    report.unchanged,
                    report.busy,
                    report.failed.len()
                );
                for failure in &report.failed {
                    let hint = if failure.retryable { " (will retry)" } else { "" };
                    println!("  {} {}: {}{}", failure.id, failure.url, failure.error, hint);
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({
                        "attempted": report.attempted,
                        "updated": report.updated,
                        "unchanged": report.unchanged,
                        "busy": report.busy,
                        "failed": report.failed.iter().map(|f| json!({
                            "id": f.id,
                            "url": f.url,
                            "error": f.error,
                            "retryable": f.retryable,
                        })).collect::<Vec<_>>(),
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    pub fn print_compaction(&self, report: &CompactionReport) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "Purged {} tombstone(s); kept {} within retention, {} with pending changes",
                    report.purged.len(),
                    report.retained,
                    report.pending
                );
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    json!({
                        "purged": report.purged,
                        "retained": report.retained,
                        "pending": report.pending,
                    })
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!("{}", json!({"status": "success", "message": message}));
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a warning to stderr (suppressed in quiet mode)
    pub fn warn(&self, message: &str) {
        if !self.is_quiet() {
            eprintln!("⚠ {}", message);
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to encode JSON output: {}", e),
    }
}

fn matches_json(matches: &[Match]) -> Vec<serde_json::Value> {
    matches
        .iter()
        .map(|m| json!({"id": m.bookmark.id, "url": m.bookmark.url, "score": m.score}))
        .collect()
}

fn conflict_json(conflict: &ConflictRecord) -> serde_json::Value {
    json!({
        "id": conflict.id,
        "url": conflict.url,
        "op": conflict.kind.to_string(),
        "winner": conflict.winner.to_string(),
        "reason": conflict.reason.to_string(),
    })
}

fn join_tags(bookmark: &Bookmark) -> String {
    bookmark.tags.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// Truncate a string to max chars, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("héllo wörld, again", 8), "héllo...");
    }
}
