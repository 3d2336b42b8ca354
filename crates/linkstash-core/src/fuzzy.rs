//! Near-duplicate detection
//!
//! Two signals, strongest first:
//! - normalized URL equality (scheme, `www.`, default port, trailing slash,
//!   fragment and query parameter order ignored)
//! - token overlap of label and description

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use url::Url;

use crate::models::Bookmark;

/// Default minimum score for a near-duplicate warning
pub const DEFAULT_THRESHOLD: f64 = 0.8;

/// Score for byte-identical URLs
const EXACT_URL: f64 = 1.0;
/// Base score for URLs equal after normalization
const NORMALIZED_URL: f64 = 0.9;
/// Weight of text overlap on top of a normalized URL match
const TEXT_BONUS: f64 = 0.1;
/// Weight of text overlap when URLs differ
const TEXT_ONLY: f64 = 0.5;

/// An existing bookmark similar to a candidate
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub bookmark: Bookmark,
    pub score: f64,
}

/// Reduce a URL to the form two "same page" URLs share
///
/// Unparseable input is only trimmed and lower-cased.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let parsed = match Url::parse(url) {
        Ok(parsed) if parsed.has_host() => parsed,
        _ => return url.to_lowercase(),
    };

    // `port()` is already `None` for the scheme's default port
    let host = parsed.host_str().unwrap_or_default().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let mut normalized = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    normalized.push_str(parsed.path().trim_end_matches('/'));

    let mut params: Vec<&str> = parsed
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .collect();
    if !params.is_empty() {
        params.sort_unstable();
        normalized.push('?');
        normalized.push_str(&params.join("&"));
    }
    normalized
}

/// Lower-cased word tokens of a bookmark's label and description
///
/// A label that is still the raw URL carries no words of its own.
fn text_tokens(bookmark: &Bookmark) -> BTreeSet<String> {
    let label = if bookmark.label == bookmark.url {
        ""
    } else {
        bookmark.label.as_str()
    };

    label
        .split(|c: char| !c.is_alphanumeric())
        .chain(bookmark.description.split(|c: char| !c.is_alphanumeric()))
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Similarity of two bookmarks in `[0, 1]`
pub fn similarity(a: &Bookmark, b: &Bookmark) -> f64 {
    if a.url.trim() == b.url.trim() {
        return EXACT_URL;
    }

    let overlap = jaccard(&text_tokens(a), &text_tokens(b));
    if normalize_url(&a.url) == normalize_url(&b.url) {
        NORMALIZED_URL + TEXT_BONUS * overlap
    } else {
        TEXT_ONLY * overlap
    }
}

/// Existing bookmarks similar to `candidate`, best match first
///
/// Tombstones and the candidate's own record never match. Ties are broken by
/// id so the order is stable across calls.
pub fn find_similar<'a, I>(candidate: &Bookmark, existing: I, min_score: f64) -> Vec<Match>
where
    I: IntoIterator<Item = &'a Bookmark>,
{
    let mut matches: Vec<Match> = existing
        .into_iter()
        .filter(|b| !b.deleted && b.id != candidate.id)
        .filter_map(|b| {
            let score = similarity(candidate, b);
            (score > 0.0 && score >= min_score).then(|| Match {
                bookmark: b.clone(),
                score,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.bookmark.id.cmp(&b.bookmark.id))
    });
    matches
}

/// Groups of live bookmarks that share a normalized URL
pub fn duplicate_groups<'a, I>(bookmarks: I) -> Vec<Vec<Bookmark>>
where
    I: IntoIterator<Item = &'a Bookmark>,
{
    let mut groups: BTreeMap<String, Vec<Bookmark>> = BTreeMap::new();
    for bookmark in bookmarks.into_iter().filter(|b| !b.deleted) {
        groups
            .entry(normalize_url(&bookmark.url))
            .or_default()
            .push(bookmark.clone());
    }
    groups.into_values().filter(|g| g.len() > 1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookmarkId;

    fn bookmark(id: i64, url: &str, label: &str) -> Bookmark {
        let mut b = Bookmark::new(BookmarkId(id), url);
        if !label.is_empty() {
            b.label = label.to_string();
        }
        b
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("http://x.com/a"), "x.com/a");
        assert_eq!(normalize_url("https://www.X.com/a/"), "x.com/a");
        assert_eq!(normalize_url("https://x.com:443/a#section"), "x.com/a");
        assert_eq!(
            normalize_url("https://x.com/search?b=2&a=1"),
            normalize_url("http://x.com/search?a=1&b=2")
        );
        assert_eq!(normalize_url("https://x.com"), "x.com");
        assert_eq!(normalize_url("http://x.com:8080/a"), "x.com:8080/a");
        assert_eq!(normalize_url("https://user@x.com/a"), "x.com/a");
        // Path case is significant
        assert_ne!(normalize_url("https://x.com/A"), normalize_url("https://x.com/a"));
    }

    #[test]
    fn test_trailing_slash_is_near_duplicate() {
        let existing = vec![bookmark(1, "http://x.com/a/", "")];
        let candidate = bookmark(-1, "http://x.com/a", "");

        let matches = find_similar(&candidate, &existing, 0.8);
        assert_eq!(matches.len(), 1);
        assert!(matches[0].score >= 0.9);
        assert!(matches[0].score < 1.0);
    }

    #[test]
    fn test_text_overlap_is_weak_signal() {
        let a = bookmark(1, "https://a.com", "Rust async book");
        let b = bookmark(2, "https://b.com", "Rust async book");
        let score = similarity(&a, &b);
        assert!((score - 0.5).abs() < 1e-9);

        // Below the default threshold
        assert!(find_similar(&a, [&b], 0.8).is_empty());
        assert_eq!(find_similar(&a, [&b], 0.3).len(), 1);
    }

    #[test]
    fn test_ordering_and_exclusions() {
        let mut tomb = bookmark(4, "https://x.com/a", "");
        tomb.deleted = true;
        let existing = vec![
            bookmark(3, "https://x.com/a/", ""),
            bookmark(2, "http://www.x.com/a", ""),
            bookmark(1, "https://x.com/a", ""),
            tomb,
        ];
        let candidate = bookmark(-1, "https://x.com/a", "");

        let matches = find_similar(&candidate, &existing, 0.8);
        let ids: Vec<i64> = matches.iter().map(|m| m.bookmark.id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(matches[0].score, 1.0);

        // Restartable: same input, same answer
        assert_eq!(find_similar(&candidate, &existing, 0.8), matches);
    }

    #[test]
    fn test_duplicate_groups() {
        let bookmarks = vec![
            bookmark(1, "https://x.com/a", ""),
            bookmark(2, "http://x.com/a/", ""),
            bookmark(3, "https://y.com", ""),
        ];
        let groups = duplicate_groups(&bookmarks);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }
}
