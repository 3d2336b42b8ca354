//! Bookmark command handlers

use anyhow::{bail, Context, Result};
use tracing::warn;

use linkstash_core::{
    AddOptions, AddOutcome, Bookmark, BookmarkEdit, Candidate, EnrichStatus, Stash,
};

use super::{parse_id, Completion};
use crate::metadata::HtmlEnricher;
use crate::output::Output;
use crate::prompt::{choose_duplicate, confirm, DuplicateChoice};

/// Fields for a new bookmark
pub struct NewBookmark {
    pub url: String,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub label: Option<String>,
}

impl NewBookmark {
    fn candidate(&self) -> Candidate {
        Candidate::new(self.url.trim())
            .with_label(self.label.clone().unwrap_or_default())
            .with_description(self.description.clone().unwrap_or_default())
            .with_tags(&self.tags)
    }
}

/// Add a bookmark
///
/// Near-duplicates are listed; an interactive user may add or merge anyway.
pub fn add(
    stash: &Stash,
    new: NewBookmark,
    yes: bool,
    enrich: bool,
    output: &Output,
) -> Result<Completion> {
    let candidate = new.candidate();
    let url = candidate.url.clone();
    let options = AddOptions {
        confirmed: yes,
        auto_merge: false,
    };

    let outcome = match stash.add(candidate.clone(), options)? {
        AddOutcome::NeedsConfirmation(matches) => {
            output.print_matches(&url, &matches);
            let choice = if output.should_prompt() {
                choose_duplicate()?
            } else {
                DuplicateChoice::Skip
            };
            match choice {
                DuplicateChoice::Add => stash.add(
                    candidate,
                    AddOptions {
                        confirmed: true,
                        auto_merge: false,
                    },
                )?,
                DuplicateChoice::Merge => stash.add(
                    candidate,
                    AddOptions {
                        confirmed: false,
                        auto_merge: true,
                    },
                )?,
                DuplicateChoice::Skip => {
                    output.message("Not added. Pass --yes to add it anyway.");
                    return Ok(Completion::Partial);
                }
            }
        }
        other => other,
    };

    match outcome {
        AddOutcome::Added(bookmark) => {
            let bookmark = if enrich {
                enrich_new(stash, bookmark, output)
            } else {
                bookmark
            };
            output.success(&format!("Added bookmark {}", bookmark.id));
            output.print_bookmark(&bookmark);
        }
        AddOutcome::MergedInto(bookmark) => {
            output.success(&format!("Merged into existing bookmark {}", bookmark.id));
            output.print_bookmark(&bookmark);
        }
        AddOutcome::NeedsConfirmation(matches) => {
            output.print_matches(&url, &matches);
            return Ok(Completion::Partial);
        }
    }

    Ok(Completion::Done)
}

/// Best-effort metadata fetch for a freshly added bookmark
fn enrich_new(stash: &Stash, bookmark: Bookmark, output: &Output) -> Bookmark {
    if !bookmark.needs_enrichment() {
        return bookmark;
    }
    let enricher = match HtmlEnricher::new(stash.config().enrich_timeout()) {
        Ok(enricher) => enricher,
        Err(e) => {
            warn!("Enrichment unavailable: {:#}", e);
            return bookmark;
        }
    };
    match stash.enrich_one(&enricher, bookmark.id) {
        Ok(EnrichStatus::Updated(updated)) => updated,
        Ok(_) => bookmark,
        Err(e) => {
            output.warn(&format!("Could not fetch page details: {:#}", e));
            bookmark
        }
    }
}

/// Delete a bookmark by id or by URL
pub fn delete(
    stash: &Stash,
    id: Option<String>,
    url: Option<String>,
    output: &Output,
) -> Result<Completion> {
    let bookmark = match (id, url) {
        (Some(id), _) => {
            let id = parse_id(&id)?;
            stash
                .get(id)
                .with_context(|| format!("No bookmark with id {}", id))?
        }
        (None, Some(url)) => stash
            .cache()
            .find_by_url(&url)
            .with_context(|| format!("No bookmark with URL {}", url.trim()))?,
        (None, None) => bail!("Pass --id or --url"),
    };

    if output.should_prompt() {
        println!("Delete bookmark: {} - {}", bookmark.id, bookmark.label);
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(Completion::Done);
        }
    }

    stash.delete(bookmark.id)?;
    output.success(&format!("Deleted bookmark {}", bookmark.id));
    Ok(Completion::Done)
}

/// Edit label, description or tags of a bookmark
pub fn edit(
    stash: &Stash,
    id: String,
    tags: Vec<String>,
    description: Option<String>,
    label: Option<String>,
    output: &Output,
) -> Result<Completion> {
    let id = parse_id(&id)?;
    let edit = BookmarkEdit {
        url: None,
        label,
        description,
        tags: if tags.is_empty() { None } else { Some(tags) },
    };
    if edit.is_empty() {
        bail!("Nothing to change. Pass --tag, --desc or --label.");
    }

    let bookmark = stash.edit(id, &edit)?;
    output.success(&format!("Updated bookmark {}", bookmark.id));
    output.print_bookmark(&bookmark);
    Ok(Completion::Done)
}

/// Accept a held bookmark, or fold it into another one
pub fn confirm_held(
    stash: &Stash,
    id: String,
    into: Option<String>,
    output: &Output,
) -> Result<Completion> {
    let id = parse_id(&id)?;
    match into {
        Some(target) => {
            let target = parse_id(&target)?;
            let merged = stash.retarget(id, target)?;
            output.success(&format!("Merged {} into bookmark {}", id, merged.id));
        }
        None => {
            stash.confirm(id)?;
            output.success(&format!("Confirmed bookmark {}", id));
        }
    }
    Ok(Completion::Done)
}

/// List bookmarks, optionally filtered by tag
pub fn list(stash: &Stash, tag: Option<String>, output: &Output) -> Result<Completion> {
    let bookmarks = match tag {
        Some(ref t) => stash.list_by_tag(t),
        None => stash.list(),
    };
    output.print_bookmarks(&bookmarks);
    Ok(Completion::Done)
}

/// Show a single bookmark
pub fn show(stash: &Stash, id: String, output: &Output) -> Result<Completion> {
    let id = parse_id(&id)?;
    let bookmark = stash
        .get(id)
        .with_context(|| format!("No bookmark with id {}", id))?;
    output.print_bookmark(&bookmark);
    Ok(Completion::Done)
}

pub fn search(stash: &Stash, query: String, output: &Output) -> Result<Completion> {
    output.print_bookmarks(&stash.search(&query));
    Ok(Completion::Done)
}

/// List all tags with usage counts
pub fn tags(stash: &Stash, output: &Output) -> Result<Completion> {
    output.print_tags(&stash.tags_with_counts());
    Ok(Completion::Done)
}
