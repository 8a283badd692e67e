//! `harness serve`: start (and, on Ctrl-C, stop) the long-running MCP
//! socket host for one project.
//!
//! One socket serves every run `harness run`/`harness redesign` triggers
//! for a project over its lifetime, so the socket needs a home independent
//! of any single run's process. This command is that home: it binds the
//! socket and blocks until interrupted. `run`/`redesign` also bind the
//! socket themselves if it isn't already up, so `serve` is only required
//! when a caller wants the socket to outlive any single trigger.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use crate::app::App;
use crate::cli_exit::CliExit;

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long)]
    pub name: String,
    #[arg(long, env = "SCREENSHOT_SERVICE_ENDPOINT", default_value = "http://127.0.0.1:4000")]
    pub screenshot_endpoint: String,
}

pub async fn run(app: &App, args: &ServeArgs) -> Result<(), CliExit> {
    let project = app.registry.get_project_by_name(&args.name)?;
    let workspace = PathBuf::from(&project.workspace_path);
    let (_command, _args, socket_path) = app.mcp_invocation(project.id);

    let screenshot = Arc::new(app.screenshot_collaborator(args.screenshot_endpoint.clone()));
    let factory = Arc::new(app.tool_context_factory(project.id, workspace, screenshot));

    tracing::info!(project = %project.name, socket = %socket_path.display(), "serving mcp socket");
    let serve_handle = tokio::spawn(async move { crate::mcp::socket_server::serve(&socket_path, factory).await });

    tokio::select! {
        result = serve_handle => {
            result
                .map_err(|e| CliExit::Runtime(format!("socket server task panicked: {e}")))?
                .map_err(|e| CliExit::Runtime(format!("socket server error: {e}")))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, stopping server");
        }
    }

    Ok(())
}
