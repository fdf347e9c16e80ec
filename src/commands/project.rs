use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Subcommand};
use serde_json::{Map as JsonMap, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docvault::{
    PatchOutcome, Project, ProjectService, config::load_or_default, patch::parse_operations,
};

use super::resolve_actor_name;

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a project owned by a user
    Create(ProjectCreateArgs),
    /// List the projects of an owner
    List(ProjectListArgs),
    /// Print the latest snapshot of a project
    Show(ProjectIdentityArgs),
    /// Print the change sets recorded for a project
    History(ProjectHistoryArgs),
    /// Apply an RFC 6902 patch read from a file or stdin
    Patch(ProjectPatchArgs),
    /// Revert a recorded change set by committing its inverse
    Undo(ProjectUndoArgs),
    /// Soft-delete a project
    Delete(ProjectIdentityArgs),
}

#[derive(Args)]
pub struct ProjectCreateArgs {
    /// Owning user identifier
    #[arg(long)]
    pub owner: String,

    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub description: Option<String>,

    /// Domain fields expressed as KEY=VALUE pairs; VALUE is parsed as JSON when possible
    #[arg(long = "field", value_parser = parse_key_value, value_name = "KEY=VALUE")]
    pub fields: Vec<(String, Value)>,
}

#[derive(Args)]
pub struct ProjectListArgs {
    /// Owning user identifier
    #[arg(long)]
    pub owner: String,
}

#[derive(Args)]
pub struct ProjectIdentityArgs {
    /// Project identifier
    pub project_id: String,
}

#[derive(Args)]
pub struct ProjectHistoryArgs {
    /// Project identifier
    pub project_id: String,

    /// Only include change sets whose base version is at least this value
    #[arg(long, default_value_t = 0)]
    pub since: u32,
}

#[derive(Args)]
pub struct ProjectPatchArgs {
    /// Project identifier
    pub project_id: String,

    /// Version the patch was written against
    #[arg(long = "expected-version")]
    pub expected_version: u32,

    /// File holding the JSON patch array; stdin when omitted
    #[arg(long)]
    pub file: Option<PathBuf>,

    #[arg(long)]
    pub description: Option<String>,

    /// User recorded on the change set
    #[arg(long)]
    pub user: Option<String>,
}

#[derive(Args)]
pub struct ProjectUndoArgs {
    /// Project identifier
    pub project_id: String,

    /// Change set to revert
    pub change_set_id: Uuid,

    /// User recorded on the change set
    #[arg(long)]
    pub user: Option<String>,
}

pub async fn execute(config_path: Option<PathBuf>, command: ProjectCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let service = ProjectService::new(config.open_store()?.into());
    let cancel = CancellationToken::new();

    match command {
        ProjectCommands::Create(args) => {
            let fields: JsonMap<String, Value> = args.fields.into_iter().collect();
            let project = service
                .create_project(&args.owner, &args.name, args.description, fields, &cancel)
                .await?;
            print_project(&project)?;
        }
        ProjectCommands::List(args) => {
            let projects = service.list(&args.owner, &cancel).await?;
            if projects.is_empty() {
                println!("no projects");
            }
            for project in projects {
                println!(
                    "{}\tv{}\t{}\t{}",
                    project.id,
                    project.version,
                    project.updated_at.to_rfc3339(),
                    project.name
                );
            }
        }
        ProjectCommands::Show(args) => {
            let project = service.get(&args.project_id, &cancel).await?;
            print_project(&project)?;
        }
        ProjectCommands::History(args) => {
            let events = service
                .history(&args.project_id, args.since, &cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        ProjectCommands::Patch(args) => {
            let raw = read_patch(args.file.as_ref())?;
            let operations = parse_operations(&raw)?;
            let user = resolve_actor_name(args.user.as_deref(), "cli");
            let outcome = service
                .apply_patch(
                    &args.project_id,
                    &user,
                    args.expected_version,
                    &operations,
                    args.description,
                    &cancel,
                )
                .await?;
            report(outcome)?;
        }
        ProjectCommands::Undo(args) => {
            let user = resolve_actor_name(args.user.as_deref(), "cli");
            let outcome = service
                .undo(&args.project_id, &user, args.change_set_id, &cancel)
                .await?;
            report(outcome)?;
        }
        ProjectCommands::Delete(args) => {
            if service.delete(&args.project_id, &cancel).await? {
                println!("project {} deleted", args.project_id);
            } else {
                println!("project {} does not exist", args.project_id);
            }
        }
    }
    Ok(())
}

fn print_project(project: &Project) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(project)?);
    Ok(())
}

fn report(outcome: PatchOutcome) -> Result<()> {
    match outcome {
        PatchOutcome::Applied { project, event } => {
            eprintln!(
                "change set {} committed as version {}",
                event.change_set_id, project.version
            );
            print_project(&project)
        }
        PatchOutcome::Conflict { expected, actual } => Err(anyhow!(
            "version conflict: patch targets version {expected} but the project is at version {actual}; re-read and retry"
        )),
    }
}

fn read_patch(file: Option<&PathBuf>) -> Result<Value> {
    let contents = match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read patch file {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read patch from stdin")?;
            buffer
        }
    };
    if contents.trim().is_empty() {
        bail!("patch input is empty");
    }
    serde_json::from_str(&contents).context("patch must be a JSON array")
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| "expected KEY=VALUE".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("field name must not be empty".into());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
