//! `harness project new` / `harness project import`.
//!
//! Grounded on `sdlc-cli::cmd::init::run`'s shape — validate, scaffold the
//! workspace layout, persist — generalized from a single flat `.sdlc/`
//! directory to the Registry-backed `Project`/`SpecVersion` pair plus its
//! on-disk workspace layout.

use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};

use crate::app::App;
use crate::cli_exit::CliExit;

#[derive(Subcommand)]
pub enum ProjectCommand {
    /// Create a new project and its workspace from a spec file.
    New(NewArgs),
    /// Register an existing workspace (already containing `prompts/app_spec.txt`).
    Import(ImportArgs),
    /// Update a project's agent settings. Rejected while a run is active.
    Settings(SettingsArgs),
}

#[derive(Args)]
pub struct SettingsArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub yolo_mode: Option<bool>,
    #[arg(long)]
    pub require_tdd: Option<bool>,
}

#[derive(Args)]
pub struct NewArgs {
    #[arg(long)]
    pub name: String,
    /// Directory under `WORKSPACE_ROOT` to create for this project.
    #[arg(long)]
    pub workspace: PathBuf,
    /// Path to the plain-text application spec to seed the project with.
    #[arg(long)]
    pub spec: PathBuf,
}

#[derive(Args)]
pub struct ImportArgs {
    #[arg(long)]
    pub name: String,
    /// Existing workspace directory containing `prompts/app_spec.txt`.
    #[arg(long)]
    pub workspace: PathBuf,
}

pub fn new(app: &App, args: &NewArgs) -> Result<(), CliExit> {
    let allowed_root = Path::new(&app.config.allowed_root_directory);
    harness_core::paths::validate_workspace_path(&args.workspace, allowed_root)
        .map_err(|e| CliExit::Usage(e.to_string()))?;

    let spec_text = std::fs::read_to_string(&args.spec)
        .map_err(|e| CliExit::Usage(format!("failed to read spec file {}: {e}", args.spec.display())))?;
    if spec_text.trim().is_empty() {
        return Err(CliExit::Usage("spec file has empty body".to_string()));
    }

    harness_core::io::ensure_dir(&args.workspace).map_err(CliExit::from)?;
    let project = app.registry.create_project(&args.name, &args.workspace.to_string_lossy())?;

    let app_spec_path = harness_core::paths::app_spec_path(&args.workspace);
    harness_core::io::atomic_write(&app_spec_path, spec_text.as_bytes()).map_err(CliExit::from)?;
    app.registry.append_spec_version(project.id, &spec_text)?;

    println!("created project '{}' ({})", project.name, project.id);
    Ok(())
}

pub fn import(app: &App, args: &ImportArgs) -> Result<(), CliExit> {
    let allowed_root = Path::new(&app.config.allowed_root_directory);
    harness_core::paths::validate_workspace_path(&args.workspace, allowed_root)
        .map_err(|e| CliExit::Usage(e.to_string()))?;

    let app_spec_path = harness_core::paths::app_spec_path(&args.workspace);
    let spec_text = std::fs::read_to_string(&app_spec_path).map_err(|e| {
        CliExit::Usage(format!("failed to read {}: {e} (expected an existing workspace)", app_spec_path.display()))
    })?;
    if spec_text.trim().is_empty() {
        return Err(CliExit::Usage("imported spec has empty body".to_string()));
    }

    let project = app.registry.create_project(&args.name, &args.workspace.to_string_lossy())?;
    app.registry.append_spec_version(project.id, &spec_text)?;

    println!("imported project '{}' ({})", project.name, project.id);
    Ok(())
}

/// Update a project's `AgentSettings`. The Registry rejects this with
/// `SettingsLocked` (surfaced here as a `Conflict` exit) while a run is
/// active for the project — settings may not change mid-run (spec.md §4.9).
pub fn settings(app: &App, args: &SettingsArgs) -> Result<(), CliExit> {
    let project = app.registry.get_project_by_name(&args.name)?;
    let model = args.model.clone();
    let yolo_mode = args.yolo_mode;
    let require_tdd = args.require_tdd;
    let updated = app.registry.update_agent_settings(project.id, |settings| {
        if let Some(model) = model {
            settings.model_id = model;
        }
        if let Some(yolo_mode) = yolo_mode {
            settings.yolo_mode = yolo_mode;
        }
        if let Some(require_tdd) = require_tdd {
            settings.require_tdd = require_tdd;
        }
    })?;

    println!(
        "updated '{}' agent settings: model={} yolo_mode={} require_tdd={}",
        updated.name, updated.agent_settings.model_id, updated.agent_settings.yolo_mode, updated.agent_settings.require_tdd
    );
    Ok(())
}

pub fn run(app: &App, cmd: &ProjectCommand) -> Result<(), CliExit> {
    match cmd {
        ProjectCommand::New(args) => new(app, args),
        ProjectCommand::Import(args) => import(app, args),
        ProjectCommand::Settings(args) => settings(app, args),
    }
}
