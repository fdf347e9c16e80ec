mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{config::ConfigCommands, key::KeyCommands, project::ProjectCommands};

#[derive(Parser)]
#[command(author, version, about = "Encrypted, versioned project store")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.docvault/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or update configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Inspect and rotate per-project data keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init()?;
    docvault::observability::describe();

    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Config { command } => commands::config::execute(config, command)?,
        Commands::Project { command } => commands::project::execute(config, command).await?,
        Commands::Key { command } => commands::key::execute(config, command)?,
    }

    Ok(())
}
