//! `harness run`: trigger one project through its full execution loop
//! (initializer, feature loop, regression) to completion or cancellation.
//!
//! Binds the project's MCP socket for the duration of the run (unless
//! `harness serve` already has it bound) so every agent subprocess the
//! orchestrator spawns can reach the tool surface, then drives
//! `Orchestrator::run` in the foreground.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use crate::app::App;
use crate::cli_exit::CliExit;

#[derive(Args)]
pub struct RunArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long, env = "SCREENSHOT_SERVICE_ENDPOINT", default_value = "http://127.0.0.1:4000")]
    pub screenshot_endpoint: String,
}

pub async fn run(app: &App, args: &RunArgs) -> Result<(), CliExit> {
    let project = app.registry.get_project_by_name(&args.name)?;

    if app.registry.active_run(project.id)?.is_some() {
        return Err(CliExit::from(harness_core::HarnessError::RunAlreadyActive));
    }

    let workspace = PathBuf::from(&project.workspace_path);
    let (mcp_command, mcp_args, socket_path) = app.mcp_invocation(project.id);

    let screenshot = Arc::new(app.screenshot_collaborator(args.screenshot_endpoint.clone()));
    let factory = Arc::new(app.tool_context_factory(project.id, workspace, screenshot));
    let socket_task = tokio::spawn(async move { crate::mcp::socket_server::serve(&socket_path, factory).await });

    let orchestrator = harness_engine::Orchestrator::new(
        app.registry.clone(),
        app.supervisor.clone(),
        app.bus.clone(),
        app.skills.clone(),
    );

    let result = orchestrator.run(project.id, mcp_command, mcp_args).await;
    socket_task.abort();
    let phase = result.map_err(CliExit::from)?;

    println!("run finished for '{}' at phase {phase:?}", project.name);
    Ok(())
}
