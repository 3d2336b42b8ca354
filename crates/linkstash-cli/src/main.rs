//! linkstash CLI
//!
//! Command-line interface for linkstash - bookmarks kept in sync between a
//! local cache and a durable store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use linkstash_core::{Config, ImportFormat, Stash};

mod commands;
mod metadata;
mod output;
mod prompt;
mod repl;

use commands::bookmark::NewBookmark;
use commands::Completion;
use output::{Output, OutputFormat};

/// Exit code for conflicts and partial outcomes under `--strict`
const EXIT_PARTIAL: i32 = 2;

#[derive(Parser)]
#[command(name = "links")]
#[command(about = "linkstash - bookmarks with a local cache and a durable store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Exit nonzero on conflicts and partial outcomes
    #[arg(long, global = true)]
    strict: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Add a bookmark
    Add {
        /// URL to save
        url: String,
        /// Tags to add
        #[arg(short, long)]
        tag: Vec<String>,
        /// Description
        #[arg(short, long)]
        desc: Option<String>,
        /// Label (fetched from the page if omitted)
        #[arg(short, long)]
        label: Option<String>,
        /// Add even if it looks like an existing bookmark
        #[arg(short, long)]
        yes: bool,
        /// Do not fetch the page for a label and description
        #[arg(long)]
        no_enrich: bool,
    },
    /// Delete a bookmark
    #[command(alias = "rm")]
    #[command(group(ArgGroup::new("target").required(true).args(["id", "url"])))]
    Delete {
        /// Bookmark ID
        #[arg(long)]
        id: Option<String>,
        /// Exact URL of the bookmark
        #[arg(long)]
        url: Option<String>,
    },
    /// Edit a bookmark
    Edit {
        /// Bookmark ID
        #[arg(long)]
        id: String,
        /// Replace tags
        #[arg(short, long)]
        tag: Vec<String>,
        /// New description
        #[arg(short, long)]
        desc: Option<String>,
        /// New label
        #[arg(short, long)]
        label: Option<String>,
    },
    /// Accept a held bookmark, or merge it into another
    Confirm {
        /// Held bookmark ID (as shown by `sync`)
        id: String,
        /// Merge into this bookmark instead of adding it
        #[arg(long)]
        into: Option<String>,
    },
    /// List bookmarks
    #[command(alias = "ls")]
    List {
        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Show bookmark details
    Show {
        /// Bookmark ID
        id: String,
    },
    /// Search bookmarks
    Search {
        /// Search query
        query: String,
    },
    /// List all tags
    Tags,
    /// Counts, pending changes and likely duplicates
    Analyze,
    /// Sync the local cache with the store
    Sync {
        /// Keep syncing on a timer until interrupted
        #[arg(short, long)]
        watch: bool,
    },
    /// Purge old tombstones from the store
    Compact,
    /// Import links from a file
    Import {
        /// File to import
        file: PathBuf,
        /// Input format (text or json; guessed from the extension if omitted)
        #[arg(short, long)]
        format: Option<ImportFormat>,
    },
    /// Fetch labels and descriptions for bookmarks missing them
    Enrich {
        /// Enrich at most this many bookmarks
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Interactive shell
    Repl,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

impl Commands {
    /// Whether the command stages changes that should be pushed
    pub(crate) fn is_write(&self) -> bool {
        matches!(
            self,
            Commands::Add { .. }
                | Commands::Delete { .. }
                | Commands::Edit { .. }
                | Commands::Confirm { .. }
                | Commands::Import { .. }
                | Commands::Enrich { .. }
        )
    }
}

#[derive(Subcommand, Clone)]
pub(crate) enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, backend, similarity_threshold, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            init_logging("warn", cli.verbose);
            return Err(e);
        }
    };
    init_logging(&config.log_level, cli.verbose);

    let completion = match cli.command {
        // Config commands don't need the store
        Commands::Config { command } => match command {
            Some(ConfigCommands::Show) | None => commands::config::show(&config, &output)?,
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, &output)?
            }
        },
        Commands::Repl => {
            let stash = Stash::open_with_config(config).context("Failed to open stash")?;
            repl::run(&stash, &output)?
        }
        command => {
            let stash = Stash::open_with_config(config).context("Failed to open stash")?;
            let is_write = command.is_write();
            let completion = execute(&stash, command, &output)?;

            // Push staged changes right away; they stay queued if the store is unavailable
            if is_write {
                completion.and(commands::sync::push(&stash, &output))
            } else {
                completion
            }
        }
    };

    if cli.strict && completion == Completion::Partial {
        std::process::exit(EXIT_PARTIAL);
    }
    Ok(())
}

/// Run one command against an open stash
pub(crate) fn execute(stash: &Stash, command: Commands, output: &Output) -> Result<Completion> {
    match command {
        Commands::Add {
            url,
            tag,
            desc,
            label,
            yes,
            no_enrich,
        } => commands::bookmark::add(
            stash,
            NewBookmark {
                url,
                tags: tag,
                description: desc,
                label,
            },
            yes,
            !no_enrich,
            output,
        ),
        Commands::Delete { id, url } => commands::bookmark::delete(stash, id, url, output),
        Commands::Edit {
            id,
            tag,
            desc,
            label,
        } => commands::bookmark::edit(stash, id, tag, desc, label, output),
        Commands::Confirm { id, into } => commands::bookmark::confirm_held(stash, id, into, output),
        Commands::List { tag } => commands::bookmark::list(stash, tag, output),
        Commands::Show { id } => commands::bookmark::show(stash, id, output),
        Commands::Search { query } => commands::bookmark::search(stash, query, output),
        Commands::Tags => commands::bookmark::tags(stash, output),
        Commands::Analyze => commands::maintenance::analyze(stash, output),
        Commands::Sync { watch: false } => commands::sync::sync(stash, output),
        Commands::Sync { watch: true } => commands::sync::watch(stash, output),
        Commands::Compact => commands::maintenance::compact(stash, output),
        Commands::Import { file, format } => {
            commands::import::import(stash, file, format, output)
        }
        Commands::Enrich { limit } => commands::maintenance::enrich(stash, limit, output),
        Commands::Config { command } => match command {
            Some(ConfigCommands::Show) | None => commands::config::show(stash.config(), output),
            Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, output),
        },
        Commands::Repl => {
            output.message("Already in the shell.");
            Ok(Completion::Done)
        }
    }
}

/// Log to stderr; `RUST_LOG` wins over the configured level
fn init_logging(level: &str, verbose: bool) {
    let level = if verbose { "debug" } else { level };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("linkstash_core={},linkstash_cli={}", level, level))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
