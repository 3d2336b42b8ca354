//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/linkstash/config.toml)
//! 3. Environment variables (LINKSTASH_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "LINKSTASH";

/// Durable store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One JSON document with timestamped backups
    #[default]
    File,
    /// Embedded SQLite database
    Sqlite,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::File => write!(f, "file"),
            Backend::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" | "json" => Ok(Backend::File),
            "sqlite" | "db" => Ok(Backend::Sqlite),
            other => bail!("Unknown backend '{}' (expected 'file' or 'sqlite')", other),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (store document or database, journal, backups)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Durable store backend
    #[serde(default)]
    pub backend: Backend,

    /// Minimum score for a near-duplicate warning
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Merge near-duplicate adds into the existing bookmark without asking
    #[serde(default)]
    pub auto_merge: bool,

    /// Tombstones older than this are eligible for compaction
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: u32,

    /// Number of timestamped store backups to keep
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,

    /// Timeout for each durable store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Timeout for each enrichment fetch
    #[serde(default = "default_enrich_timeout_secs")]
    pub enrich_timeout_secs: u64,

    /// Background sync interval
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Base retry delay
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Retry delay cap
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Attempts before a sync is declared failed
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Upper bound of the random jitter added to each retry delay
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// Default log level for the CLI
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: Backend::default(),
            similarity_threshold: default_similarity_threshold(),
            auto_merge: false,
            tombstone_retention_days: default_tombstone_retention_days(),
            backup_retention: default_backup_retention(),
            store_timeout_ms: default_store_timeout_ms(),
            enrich_timeout_secs: default_enrich_timeout_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_jitter_ms: default_retry_jitter_ms(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LINKSTASH_DATA_DIR, LINKSTASH_BACKEND, ...)
    /// 2. Config file (~/.config/linkstash/config.toml or LINKSTASH_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // LINKSTASH_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            if !val.is_empty() {
                self.data_dir = PathBuf::from(val);
            }
        }

        // LINKSTASH_BACKEND
        if let Ok(val) = std::env::var(format!("{}_BACKEND", ENV_PREFIX)) {
            match val.parse() {
                Ok(backend) => self.backend = backend,
                Err(e) => tracing::warn!("Ignoring {}_BACKEND: {}", ENV_PREFIX, e),
            }
        }

        // LINKSTASH_AUTO_MERGE
        if let Ok(val) = std::env::var(format!("{}_AUTO_MERGE", ENV_PREFIX)) {
            self.auto_merge = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // LINKSTASH_LOG
        if let Ok(val) = std::env::var(format!("{}_LOG", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    /// Reject values the rest of the system cannot work with
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be between 0 and 1, got {}",
                self.similarity_threshold
            );
        }
        if self.retry_max_attempts == 0 {
            bail!("retry_max_attempts must be at least 1");
        }
        if self.store_timeout_ms == 0 {
            bail!("store_timeout_ms must be greater than 0");
        }
        Ok(())
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Set a single key from its string form (used by `config set`)
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
        where
            T::Err: fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
        }

        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "backend" => self.backend = value.parse()?,
            "similarity_threshold" => self.similarity_threshold = parse(key, value)?,
            "auto_merge" => self.auto_merge = parse(key, value)?,
            "tombstone_retention_days" => self.tombstone_retention_days = parse(key, value)?,
            "backup_retention" => self.backup_retention = parse(key, value)?,
            "store_timeout_ms" => self.store_timeout_ms = parse(key, value)?,
            "enrich_timeout_secs" => self.enrich_timeout_secs = parse(key, value)?,
            "sync_interval_secs" => self.sync_interval_secs = parse(key, value)?,
            "retry_base_ms" => self.retry_base_ms = parse(key, value)?,
            "retry_max_ms" => self.retry_max_ms = parse(key, value)?,
            "retry_max_attempts" => self.retry_max_attempts = parse(key, value)?,
            "retry_jitter_ms" => self.retry_jitter_ms = parse(key, value)?,
            "log_level" => self.log_level = value.to_string(),
            other => bail!("Unknown config key: {}", other),
        }
        self.validate()
    }

    /// Get the config file path
    ///
    /// Can be overridden with LINKSTASH_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("linkstash")
            .join("config.toml")
    }

    /// Get the path to the store document (file backend)
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    /// Get the path to the store lock file (file backend)
    pub fn store_lock_path(&self) -> PathBuf {
        self.data_dir.join("store.lock")
    }

    /// Get the directory holding timestamped store backups
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("linkstash.db")
    }

    /// Get the path to the sync journal
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.jsonl")
    }

    /// Get the path where unreadable journal lines are set aside
    pub fn rejected_journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.rejected")
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_secs(self.enrich_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.tombstone_retention_days))
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("linkstash")
}

fn default_similarity_threshold() -> f64 {
    0.8
}

fn default_tombstone_retention_days() -> u32 {
    30
}

fn default_backup_retention() -> usize {
    10
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_enrich_timeout_secs() -> u64 {
    10
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_jitter_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "warn".to_string()
}
