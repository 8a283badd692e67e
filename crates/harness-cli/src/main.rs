//! Entry point for the `harness` binary: argument parsing, logging
//! init, subcommand dispatch, and the typed exit-code contract.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use harness_cli::app::App;
use harness_cli::cli_exit::CliExit;
use harness_cli::cmd;
use harness_cli::cmd::project::ProjectCommand;
use harness_cli::cmd::redesign::RedesignArgs;
use harness_cli::cmd::run::RunArgs;
use harness_cli::cmd::serve::ServeArgs;
use harness_cli::mcp::relay;

#[derive(Parser)]
#[command(
    name = "harness",
    about = "Drives a generated feature backlog to completion via Claude Code CLI subprocesses",
    version
)]
struct Cli {
    /// Absolute path containing all project workspaces.
    #[arg(long, global = true, env = "WORKSPACE_ROOT")]
    workspace_root: Option<String>,

    /// Directory holding `registry.db` and `config.yaml`.
    #[arg(long, global = true, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Prefix-checked against every project's workspace path.
    #[arg(long, global = true, env = "ALLOWED_ROOT_DIRECTORY")]
    allowed_root_directory: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (and, on Ctrl-C, stop) the MCP socket host for a project.
    Serve(ServeArgs),
    /// Create or import a project.
    Project {
        #[command(subcommand)]
        subcommand: ProjectCommand,
    },
    /// Trigger a project's run loop.
    Run(RunArgs),
    /// Trigger a redesign session.
    Redesign(RedesignArgs),
    /// The stdio-to-socket MCP relay a Claude Code CLI subprocess is spawned as.
    #[command(hide = true)]
    Mcp {
        #[arg(long)]
        socket: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = rt.block_on(dispatch(cli)) {
        eprintln!("error: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliExit> {
    if let Commands::Mcp { socket } = &cli.command {
        return relay::run(socket).await.map_err(|e| CliExit::Runtime(e.to_string()));
    }

    let workspace_root = cli
        .workspace_root
        .ok_or_else(|| CliExit::Usage("WORKSPACE_ROOT is required".to_string()))?;
    let data_dir = cli.data_dir.ok_or_else(|| CliExit::Usage("DATA_DIR is required".to_string()))?;
    let allowed_root_directory = cli
        .allowed_root_directory
        .ok_or_else(|| CliExit::Usage("ALLOWED_ROOT_DIRECTORY is required".to_string()))?;

    let app = App::bootstrap(&data_dir, &workspace_root, &allowed_root_directory)
        .map_err(|e| CliExit::Runtime(e.to_string()))?;

    match cli.command {
        Commands::Serve(args) => cmd::serve::run(&app, &args).await,
        Commands::Project { subcommand } => cmd::project::run(&app, &subcommand),
        Commands::Run(args) => cmd::run::run(&app, &args).await,
        Commands::Redesign(args) => cmd::redesign::run(&app, &args).await,
        Commands::Mcp { .. } => unreachable!("handled above"),
    }
}
