use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use serde_json::json;

use docvault::config::load_or_default;

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Show the wrapping metadata of a project's data key
    Show(KeyIdentityArgs),
    /// Replace a project's data key. Existing ciphertext becomes unreadable.
    Rotate(KeyRotateArgs),
}

#[derive(Args)]
pub struct KeyIdentityArgs {
    /// Project identifier
    pub project_id: String,
}

#[derive(Args)]
pub struct KeyRotateArgs {
    /// Project identifier
    pub project_id: String,

    /// Confirm that snapshots and events under the current key will be lost
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

pub fn execute(config_path: Option<PathBuf>, command: KeyCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let encryptor = config.encryption_service()?;

    match command {
        KeyCommands::Show(args) => {
            let Some(record) = encryptor.key_record(&args.project_id)? else {
                bail!("no data key exists for {}", args.project_id);
            };
            let output = json!({
                "keyId": record.key_id,
                "version": record.version,
                "wrappedByKeyId": record.wrapped_by_key_id,
                "createdAt": record.created_at,
                "ownerId": record.owner_id,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        KeyCommands::Rotate(args) => {
            if !args.force {
                bail!(
                    "rotating the key for {} makes every existing snapshot and event unreadable; re-run with --force to proceed",
                    args.project_id
                );
            }
            let record = encryptor.rotate_key(&args.project_id)?;
            println!("key {} rotated to version {}", record.key_id, record.version);
        }
    }
    Ok(())
}
