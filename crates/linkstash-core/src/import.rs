//! Link import
//!
//! Importers turn raw text into [`Candidate`]s. They do no deduplication of
//! their own: every candidate goes through the same add path as a bookmark
//! typed by hand.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::models::Candidate;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Invalid JSON import: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parser for one import format
pub trait Importer {
    fn parse(&self, raw: &str) -> Result<Vec<Candidate>, ImportError>;
}

/// Supported import formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportFormat {
    #[default]
    Text,
    Json,
}

impl ImportFormat {
    /// Guess the format from a file extension (text unless `.json`)
    pub fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ImportFormat::Json,
            _ => ImportFormat::Text,
        }
    }

    pub fn importer(&self) -> Box<dyn Importer> {
        match self {
            ImportFormat::Text => Box::new(TextImporter),
            ImportFormat::Json => Box::new(JsonImporter),
        }
    }
}

impl fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportFormat::Text => write!(f, "text"),
            ImportFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for ImportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "txt" => Ok(ImportFormat::Text),
            "json" => Ok(ImportFormat::Json),
            other => Err(format!("unknown import format '{}' (use text or json)", other)),
        }
    }
}

/// Plain text, one link per line
///
/// Accepted line shapes:
///
/// ```text
/// https://example.com
/// https://example.com :tag1, :tag2
/// label text: https://example.com
/// label text: https://example.com :tag1, :tag2
/// label text https://example.com
/// ```
///
/// Lines without an http(s) URL (blank lines, section headers) are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextImporter;

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"https?://\S+").expect("URL pattern is valid"))
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":(\w+)").expect("tag pattern is valid"))
}

impl TextImporter {
    /// Parse a single line: label before the URL, `:tags` after it
    pub fn parse_line(line: &str) -> Option<Candidate> {
        let line = line.trim();
        let found = url_pattern().find(line)?;

        let label = line[..found.start()].trim().trim_end_matches(':').trim();
        let tags: Vec<&str> = tag_pattern()
            .captures_iter(&line[found.end()..])
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();

        Some(Candidate::new(found.as_str()).with_label(label).with_tags(tags))
    }
}

impl Importer for TextImporter {
    fn parse(&self, raw: &str) -> Result<Vec<Candidate>, ImportError> {
        Ok(raw.lines().filter_map(Self::parse_line).collect())
    }
}

/// JSON array of `{url, label, tags, description}` objects
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonImporter;

#[derive(Debug, Deserialize)]
struct JsonRecord {
    url: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl Importer for JsonImporter {
    fn parse(&self, raw: &str) -> Result<Vec<Candidate>, ImportError> {
        let records: Vec<JsonRecord> = serde_json::from_str(raw)?;
        Ok(records
            .into_iter()
            .map(|record| {
                let url = record.url.trim().to_string();
                // A label that only repeats the URL is no label
                let label = record.label.filter(|l| l.trim() != url).unwrap_or_default();
                Candidate::new(url)
                    .with_label(label)
                    .with_description(record.description.unwrap_or_default().trim())
                    .with_tags(record.tags)
            })
            .collect())
    }
}
