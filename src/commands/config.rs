use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use docvault::config::{ConfigUpdate, load_or_default};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the active configuration (the key-encryption key is redacted)
    Show,
    /// Update configuration values
    Set(ConfigSetArgs),
}

#[derive(Args)]
pub struct ConfigSetArgs {
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Maximum number of unwrapped data keys kept in memory
    #[arg(long)]
    pub key_cache_capacity: Option<usize>,

    #[arg(long)]
    pub lock_shards: Option<usize>,

    #[arg(long)]
    pub io_retry_attempts: Option<u32>,

    #[arg(long)]
    pub io_retry_backoff_ms: Option<u64>,
}

pub fn execute(config_path: Option<PathBuf>, command: ConfigCommands) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;
    match command {
        ConfigCommands::Show => {
            config.key_encryption_key = config.key_encryption_key.as_ref().map(|_| "<redacted>".into());
            println!("# {}", path.display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("failed to render configuration")?
            );
        }
        ConfigCommands::Set(args) => {
            let ConfigSetArgs {
                data_dir,
                key_cache_capacity,
                lock_shards,
                io_retry_attempts,
                io_retry_backoff_ms,
            } = args;
            let update = ConfigUpdate {
                data_dir,
                key_cache_capacity,
                lock_shards,
                io_retry_attempts,
                io_retry_backoff_ms,
            };
            if update.is_empty() {
                println!("nothing to update");
                return Ok(());
            }

            config.apply_update(update);
            config.ensure_data_dir()?;
            config.save(&path)?;
            tracing::info!("Configuration saved to {}", path.display());
        }
    }
    Ok(())
}
