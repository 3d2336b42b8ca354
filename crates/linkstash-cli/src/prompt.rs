//! Interactive prompts
//!
//! Every prompt answers "no" when stdin is not a terminal, so scripts never
//! block waiting for input.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::Result;

/// What to do with a URL that looks like an existing bookmark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateChoice {
    /// Add it as a separate bookmark
    Add,
    /// Fold it into the closest existing bookmark
    Merge,
    /// Leave the stash unchanged
    Skip,
}

/// Prompt for confirmation
///
/// Returns true if user confirms, false otherwise.
/// In non-interactive mode (no TTY), returns false.
pub fn confirm(prompt: &str) -> Result<bool> {
    if !io::stdin().is_terminal() {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    Ok(parse_yes(&read_line()?))
}

/// Ask how to handle a near-duplicate; `Skip` without a TTY
pub fn choose_duplicate() -> Result<DuplicateChoice> {
    if !io::stdin().is_terminal() {
        return Ok(DuplicateChoice::Skip);
    }

    print!("[a]dd anyway, [m]erge into the closest match, or [s]kip? [s] ");
    io::stdout().flush()?;

    Ok(parse_duplicate_choice(&read_line()?))
}

fn read_line() -> Result<String> {
    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    Ok(input)
}

fn parse_yes(input: &str) -> bool {
    let input = input.trim().to_lowercase();
    input == "y" || input == "yes"
}

fn parse_duplicate_choice(input: &str) -> DuplicateChoice {
    match input.trim().to_lowercase().as_str() {
        "a" | "add" => DuplicateChoice::Add,
        "m" | "merge" => DuplicateChoice::Merge,
        _ => DuplicateChoice::Skip,
    }
}
