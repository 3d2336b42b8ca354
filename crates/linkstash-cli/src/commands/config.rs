//! Config command handlers

use anyhow::{Context, Result};

use linkstash_core::Config;

use super::Completion;
use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config: &Config, output: &Output) -> Result<Completion> {
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(config).context("Failed to encode configuration")?
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:                 {}", config.data_dir.display());
            println!("  backend:                  {}", config.backend);
            println!("  similarity_threshold:     {}", config.similarity_threshold);
            println!("  auto_merge:               {}", config.auto_merge);
            println!("  tombstone_retention_days: {}", config.tombstone_retention_days);
            println!("  backup_retention:         {}", config.backup_retention);
            println!("  store_timeout_ms:         {}", config.store_timeout_ms);
            println!("  enrich_timeout_secs:      {}", config.enrich_timeout_secs);
            println!("  sync_interval_secs:       {}", config.sync_interval_secs);
            println!("  retry_base_ms:            {}", config.retry_base_ms);
            println!("  retry_max_ms:             {}", config.retry_max_ms);
            println!("  retry_max_attempts:       {}", config.retry_max_attempts);
            println!("  retry_jitter_ms:          {}", config.retry_jitter_ms);
            println!("  log_level:                {}", config.log_level);
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(Completion::Done)
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<Completion> {
    let mut config = Config::load().context("Failed to load configuration")?;
    config.set_value(&key, &value)?;
    config.save().context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(Completion::Done)
}
