//! Data models for linkstash
//!
//! Defines the canonical `Bookmark` record and its identity rules, the
//! `Candidate` shape that importers and the CLI hand to the core, and the
//! `BookmarkEdit` patch applied by edits and enrichment.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{ParseError, Url};

/// Store-wide revision number. `0` means "never stored".
pub type Revision = u64;

/// Stable bookmark identifier
///
/// Positive values are assigned by a durable store on first insert and are
/// never reused. Negative values are provisional ids handed out by the local
/// cache for staged inserts; a store never sees one as a record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookmarkId(pub i64);

impl BookmarkId {
    /// Provisional id for the staged insert with the given journal sequence
    pub fn provisional(seq: u64) -> Self {
        Self(-(seq as i64))
    }

    /// Whether this id still awaits a store-assigned replacement
    pub fn is_provisional(&self) -> bool {
        self.0 <= 0
    }

    /// Raw value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for BookmarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_provisional() {
            write!(f, "~{}", -self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for BookmarkId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.strip_prefix('~') {
            Some(rest) => rest.parse::<i64>().map(|n| Self(-n)),
            None => s.parse::<i64>().map(Self),
        }
    }
}

/// A saved bookmark
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bookmark {
    /// Stable identifier
    pub id: BookmarkId,
    /// Absolute URL, the natural dedup key
    pub url: String,
    /// Display label (the URL itself until enriched)
    pub label: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Tag set
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Revision of the last stored mutation
    #[serde(default)]
    pub revision: Revision,
    /// When the record was first stored
    pub created_at: DateTime<Utc>,
    /// When the record was last mutated
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
}

impl Bookmark {
    /// Create a never-stored bookmark with the given id and URL
    pub fn new(id: BookmarkId, url: impl Into<String>) -> Self {
        let url = url.into();
        let now = Utc::now();
        Self {
            id,
            label: url.clone(),
            url,
            description: String::new(),
            tags: BTreeSet::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// Build a never-stored bookmark from a validated candidate
    pub fn from_candidate(id: BookmarkId, candidate: &Candidate) -> Self {
        let mut bookmark = Self::new(id, candidate.url.trim());
        if let Some(label) = candidate.label.as_deref().map(str::trim) {
            if !label.is_empty() {
                bookmark.label = label.to_string();
            }
        }
        bookmark.description = candidate.description.trim().to_string();
        bookmark.tags = candidate.tags.clone();
        bookmark
    }

    /// Update the label
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
        self.updated_at = Utc::now();
    }

    /// Update the description
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.updated_at = Utc::now();
    }

    /// Add a tag (normalized; blank tags are ignored)
    pub fn add_tag(&mut self, tag: &str) {
        if let Some(tag) = normalize_tag(tag) {
            if self.tags.insert(tag) {
                self.updated_at = Utc::now();
            }
        }
    }

    /// Remove a tag
    pub fn remove_tag(&mut self, tag: &str) {
        let Some(tag) = normalize_tag(tag) else {
            return;
        };
        if self.tags.remove(&tag) {
            self.updated_at = Utc::now();
        }
    }

    /// Replace all tags
    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = collect_tags(tags);
        self.updated_at = Utc::now();
    }

    /// Mark as deleted
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.updated_at = Utc::now();
    }

    /// Whether two records carry the same user-visible state
    ///
    /// Ignores id, revision and timestamps. A replayed write whose target
    /// already has the same content has been applied before.
    pub fn same_content(&self, other: &Bookmark) -> bool {
        self.url == other.url
            && self.label == other.label
            && self.description == other.description
            && self.tags == other.tags
            && self.deleted == other.deleted
    }

    /// Fold another record for the same page into this one
    ///
    /// Tags are unioned; the label and description are taken from `other`
    /// only where this record has none of its own. Returns whether anything
    /// changed.
    pub fn merge_from(&mut self, other: &Bookmark) -> bool {
        let before = self.clone();

        self.tags.extend(other.tags.iter().cloned());
        let own_label = !self.label.trim().is_empty() && self.label != self.url;
        let other_label = !other.label.trim().is_empty() && other.label != other.url;
        if !own_label && other_label {
            self.label = other.label.clone();
        }
        if self.description.trim().is_empty() && !other.description.trim().is_empty() {
            self.description = other.description.clone();
        }

        let changed = !self.same_content(&before);
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Whether the enricher should look at this record
    pub fn needs_enrichment(&self) -> bool {
        !self.deleted
            && (self.label.trim().is_empty()
                || self.label == self.url
                || self.description.trim().is_empty())
    }

    /// Case-insensitive match of a query against url, label, description and tags
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.url.to_lowercase().contains(&query)
            || self.label.to_lowercase().contains(&query)
            || self.description.to_lowercase().contains(&query)
            || self.tags.iter().any(|t| t.contains(&query))
    }
}

/// Normalize a tag token: trimmed, lower-cased, leading ':' or '#' dropped
pub fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim().trim_start_matches([':', '#']).trim().to_lowercase();
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

/// Collect tags into a normalized set, dropping blanks and duplicates
pub fn collect_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .filter_map(|t| normalize_tag(t.as_ref()))
        .collect()
}

/// Errors raised when a candidate fails boundary validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("URL is empty")]
    EmptyUrl,

    #[error("URL '{0}' is not absolute (expected scheme://host/...)")]
    NotAbsolute(String),

    #[error("URL '{0}' has no host")]
    MissingHost(String),

    #[error("URL '{0}' contains whitespace")]
    Whitespace(String),

    #[error("URL '{0}' is malformed: {1}")]
    Malformed(String, ParseError),
}

/// A bookmark proposed for insertion (no id, no revision)
///
/// Produced by importers and the CLI, validated before it enters the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Candidate {
    pub url: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Candidate {
    /// Create a candidate for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        self.label = if label.trim().is_empty() {
            None
        } else {
            Some(label)
        };
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags.extend(collect_tags(tags));
        self
    }

    /// Check that the URL is absolute
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_url(&self.url)
    }
}

/// Check that a URL is absolute: `scheme://host[...]`
pub fn validate_url(url: &str) -> Result<(), ValidationError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ValidationError::EmptyUrl);
    }
    if url.chars().any(char::is_whitespace) {
        return Err(ValidationError::Whitespace(url.to_string()));
    }

    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(ParseError::RelativeUrlWithoutBase) => {
            return Err(ValidationError::NotAbsolute(url.to_string()))
        }
        Err(ParseError::EmptyHost) => return Err(ValidationError::MissingHost(url.to_string())),
        Err(e) => return Err(ValidationError::Malformed(url.to_string(), e)),
    };
    if parsed.cannot_be_a_base() {
        return Err(ValidationError::NotAbsolute(url.to_string()));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::MissingHost(url.to_string()));
    }

    Ok(())
}

/// A partial change to a bookmark
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookmarkEdit {
    pub url: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
    /// Replacement tag set
    pub tags: Option<Vec<String>>,
}

impl BookmarkEdit {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.label.is_none() && self.description.is_none() && self.tags.is_none()
    }

    /// Apply to a bookmark, returning whether anything changed
    pub fn apply(&self, bookmark: &mut Bookmark) -> bool {
        let before = bookmark.clone();
        if let Some(ref url) = self.url {
            bookmark.url = url.trim().to_string();
        }
        if let Some(ref label) = self.label {
            bookmark.label = label.trim().to_string();
        }
        if let Some(ref description) = self.description {
            bookmark.description = description.trim().to_string();
        }
        if let Some(ref tags) = self.tags {
            bookmark.tags = collect_tags(tags);
        }

        let changed = !bookmark.same_content(&before);
        if changed {
            bookmark.updated_at = Utc::now();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookmark_new() {
        let bookmark = Bookmark::new(BookmarkId(1), "https://example.com");
        assert_eq!(bookmark.url, "https://example.com");
        assert_eq!(bookmark.label, "https://example.com");
        assert!(bookmark.tags.is_empty());
        assert!(bookmark.description.is_empty());
        assert_eq!(bookmark.revision, 0);
        assert!(!bookmark.deleted);
    }

    #[test]
    fn test_provisional_ids() {
        let id = BookmarkId::provisional(3);
        assert!(id.is_provisional());
        assert_eq!(id.to_string(), "~3");
        assert_eq!("~3".parse::<BookmarkId>().unwrap(), id);

        let stored = BookmarkId(42);
        assert!(!stored.is_provisional());
        assert_eq!(stored.to_string(), "42");
        assert_eq!("42".parse::<BookmarkId>().unwrap(), stored);
    }

    #[test]
    fn test_set_label_bumps_updated_at() {
        let mut bookmark = Bookmark::new(BookmarkId(1), "https://example.com");
        let original_updated = bookmark.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(10));
        bookmark.set_label("Example Site");
        assert_eq!(bookmark.label, "Example Site");
        assert!(bookmark.updated_at > original_updated);
    }

    #[test]
    fn test_tags_are_a_normalized_set() {
        let mut bookmark = Bookmark::new(BookmarkId(1), "https://example.com");
        bookmark.add_tag("Rust");
        bookmark.add_tag(":programming");
        bookmark.add_tag("rust");
        bookmark.add_tag("   ");
        assert_eq!(
            bookmark.tags.iter().collect::<Vec<_>>(),
            vec!["programming", "rust"]
        );

        bookmark.remove_tag("RUST");
        assert_eq!(bookmark.tags.len(), 1);
    }

    #[test]
    fn test_same_content_ignores_bookkeeping() {
        let a = Bookmark::new(BookmarkId(1), "https://example.com");
        let mut b = a.clone();
        b.id = BookmarkId(9);
        b.revision = 12;
        b.updated_at = Utc::now();
        assert!(a.same_content(&b));

        b.tombstone();
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_merge_from_keeps_own_data() {
        let mut existing = Bookmark::new(BookmarkId(1), "http://x.com/a/");
        existing.set_label("X");
        existing.add_tag("old");

        let mut incoming = Bookmark::new(BookmarkId::provisional(2), "http://x.com/a");
        incoming.set_label("Other label");
        incoming.set_description("From the import");
        incoming.add_tag("new");

        assert!(existing.merge_from(&incoming));
        assert_eq!(existing.label, "X");
        assert_eq!(existing.description, "From the import");
        assert_eq!(existing.tags.len(), 2);
        assert_eq!(existing.url, "http://x.com/a/");

        // Folding the same record again is a no-op
        assert!(!existing.merge_from(&incoming));
    }

    #[test]
    fn test_needs_enrichment() {
        let mut bookmark = Bookmark::new(BookmarkId(1), "https://example.com");
        assert!(bookmark.needs_enrichment());

        bookmark.set_label("Example");
        assert!(bookmark.needs_enrichment());

        bookmark.set_description("An example");
        assert!(!bookmark.needs_enrichment());

        bookmark.set_label("https://example.com");
        assert!(bookmark.needs_enrichment());
    }

    #[test]
    fn test_malformed_urls_are_rejected() {
        for url in ["http://a.com:99999/", "https://[::1/x", "https://exa%zzmple.com"] {
            assert!(
                matches!(validate_url(url), Err(ValidationError::Malformed(..))),
                "{} should be rejected",
                url
            );
        }
        assert!(validate_url("http://a.com:8080/x?q=1#top").is_ok());
    }

    #[test]
    fn test_candidate_validation() {
        assert!(Candidate::new("https://example.com/a").validate().is_ok());
        assert!(Candidate::new("ftp://files.example.com").validate().is_ok());
        assert_eq!(
            Candidate::new("").validate(),
            Err(ValidationError::EmptyUrl)
        );
        assert!(matches!(
            Candidate::new("example.com").validate(),
            Err(ValidationError::NotAbsolute(_))
        ));
        assert!(matches!(
            Candidate::new("https://").validate(),
            Err(ValidationError::MissingHost(_))
        ));
        assert!(matches!(
            Candidate::new("mailto:someone@example.com").validate(),
            Err(ValidationError::NotAbsolute(_))
        ));
        assert!(matches!(
            Candidate::new("https://exa mple.com").validate(),
            Err(ValidationError::Whitespace(_))
        ));
    }

    #[test]
    fn test_from_candidate() {
        let candidate = Candidate::new(" https://rust-lang.org ")
            .with_label("Rust")
            .with_description("The Rust language")
            .with_tags(["lang", "Rust"]);
        let bookmark = Bookmark::from_candidate(BookmarkId::provisional(1), &candidate);
        assert_eq!(bookmark.url, "https://rust-lang.org");
        assert_eq!(bookmark.label, "Rust");
        assert_eq!(bookmark.description, "The Rust language");
        assert_eq!(bookmark.tags.len(), 2);
    }

    #[test]
    fn test_edit_apply() {
        let mut bookmark = Bookmark::new(BookmarkId(1), "https://example.com");
        let edit = BookmarkEdit {
            label: Some("Example".to_string()),
            tags: Some(vec!["a".to_string(), "A".to_string()]),
            ..BookmarkEdit::default()
        };
        assert!(edit.apply(&mut bookmark));
        assert_eq!(bookmark.label, "Example");
        assert_eq!(bookmark.tags.len(), 1);

        // Re-applying changes nothing
        assert!(!edit.apply(&mut bookmark));
        assert!(BookmarkEdit::default().is_empty());
    }

    #[test]
    fn test_matches_query() {
        let mut bookmark = Bookmark::new(BookmarkId(1), "https://rust-lang.org");
        bookmark.set_label("Rust Programming Language");
        bookmark.add_tag("systems");
        assert!(bookmark.matches_query("programming"));
        assert!(bookmark.matches_query("SYSTEMS"));
        assert!(!bookmark.matches_query("python"));
    }

    #[test]
    fn test_bookmark_serialization() {
        let mut bookmark = Bookmark::new(BookmarkId(5), "https://example.com");
        bookmark.add_tag("test");
        let json = serde_json::to_string(&bookmark).unwrap();
        let deserialized: Bookmark = serde_json::from_str(&json).unwrap();
        assert_eq!(bookmark, deserialized);
    }
}
