//! `harness redesign`: trigger a new redesign session for a project,
//! running it through token extraction and plan generation up to the
//! point where phases need human approval.
//!
//! Approving individual phases (`require_phase_approval`'s suspended
//! waiters) and driving implementation onward is done through the MCP
//! tool surface by whatever client is approving the plan, not by this
//! command — the CLI surface only needs to trigger the session.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use crate::app::App;
use crate::cli_exit::CliExit;

#[derive(Args)]
pub struct RedesignArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub brief: String,
    #[arg(long, env = "SCREENSHOT_SERVICE_ENDPOINT", default_value = "http://127.0.0.1:4000")]
    pub screenshot_endpoint: String,
}

pub async fn run(app: &App, args: &RedesignArgs) -> Result<(), CliExit> {
    let project = app.registry.get_project_by_name(&args.name)?;
    let session = app.registry.create_redesign_session(project.id, &args.brief)?;

    let workspace = PathBuf::from(&project.workspace_path);
    let (mcp_command, mcp_args, socket_path) = app.mcp_invocation(project.id);

    let screenshot = Arc::new(app.screenshot_collaborator(args.screenshot_endpoint.clone()));
    let factory = Arc::new(app.tool_context_factory(project.id, workspace, screenshot));
    let socket_task = tokio::spawn(async move { crate::mcp::socket_server::serve(&socket_path, factory).await });

    let result = app.redesign.advance_to_approving(session.id, mcp_command, mcp_args).await;
    socket_task.abort();
    result.map_err(CliExit::from)?;

    println!("redesign session {} is awaiting phase approval", session.id);
    Ok(())
}
