//! URL metadata fetching
//!
//! [`HtmlEnricher`] fetches a bookmark's page and pulls a label and a
//! description out of the HTML.

use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use tracing::debug;

use linkstash_core::{Bookmark, EnrichError, Enricher, Enrichment};

/// Longest description taken from page text
const MAX_DESCRIPTION_CHARS: usize = 500;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; linkstash/0.1)";

/// Metadata extracted from a page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Enricher backed by a blocking HTTP client
pub struct HtmlEnricher {
    client: reqwest::blocking::Client,
}

impl HtmlEnricher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Enricher for HtmlEnricher {
    fn enrich(&self, bookmark: &Bookmark) -> Result<Enrichment, EnrichError> {
        let url = bookmark.url.clone();
        debug!("Fetching {}", url);

        let response = self.client.get(&bookmark.url).send().map_err(|e| {
            if e.is_timeout() {
                EnrichError::Timeout { url: url.clone() }
            } else {
                EnrichError::Fetch {
                    url: url.clone(),
                    details: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnrichError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let html = response.text().map_err(|e| EnrichError::Fetch {
            url: url.clone(),
            details: e.to_string(),
        })?;

        let metadata = parse_metadata(&html);
        if metadata.title.is_none() && metadata.description.is_none() {
            return Ok(Enrichment::NoChange);
        }
        Ok(Enrichment::Updated {
            label: metadata.title,
            description: metadata.description,
        })
    }
}

/// Parse metadata from HTML content
pub fn parse_metadata(html: &str) -> PageMetadata {
    let document = Html::parse_document(html);

    PageMetadata {
        title: extract_title(&document),
        description: extract_description(&document),
    }
}

/// `<title>`, then og:title, twitter:title, the first `<h1>`
fn extract_title(document: &Html) -> Option<String> {
    first_text(document, "title")
        .or_else(|| extract_meta_content(document, "og:title"))
        .or_else(|| extract_meta_content(document, "twitter:title"))
        .or_else(|| first_text(document, "h1"))
}

/// Meta description, then og:description, twitter:description, the first `<p>`
fn extract_description(document: &Html) -> Option<String> {
    extract_meta_content(document, "description")
        .or_else(|| extract_meta_content(document, "og:description"))
        .or_else(|| extract_meta_content(document, "twitter:description"))
        .or_else(|| first_text(document, "p").map(|text| cap_chars(&text, MAX_DESCRIPTION_CHARS)))
}

/// Text of the first element matching `selector`, whitespace collapsed
fn first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty())
}

/// Extract content from a meta tag by property or name
fn extract_meta_content(document: &Html, property: &str) -> Option<String> {
    ["property", "name"].iter().find_map(|attr| {
        let selector = Selector::parse(&format!(r#"meta[{}="{}"]"#, attr, property)).ok()?;
        document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(collapse_whitespace)
            .filter(|s| !s.is_empty())
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn cap_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
