//! Unix-socket transport for the MCP Tool Surface.
//!
//! The Claude Code CLI only knows how to speak MCP over a child process's
//! stdio, a transport reachable from the child. But the state
//! a tool call needs — `Registry`, `EventBus`, `Supervisor`,
//! `RedesignEngine` — lives in the long-running `harness run` process, not
//! in the short-lived grandchild the CLI spawns for the `mcp` subcommand.
//! So this listens on a Unix socket inside the long-running process; the
//! `mcp` subcommand (see `relay.rs`) is just a stdio-to-socket proxy.
//!
//! `Orchestrator::run` reuses the same `mcp_command`/`mcp_args` for every
//! run it spawns in a project's lifetime (initializer, each feature,
//! regression), so one socket serves many runs in turn; each connection
//! opens with a one-line handshake naming which run it belongs to, which
//! the relay fills in from its own `HARNESS_RUN_ID` environment variable.
//!
//! The request loop here is `sdlc-cli::cmd::mcp::run`'s line-reading loop
//! generalized from stdin/stdout to an accepted `UnixStream`, and from
//! sync dispatch to awaited dispatch, so multiple connections can be
//! served concurrently out of one listener task.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::dispatch::handle_request;
use super::protocol::{JsonRpcRequest, JsonRpcResponse};
use super::tools::{all_tools, HarnessTool, ToolContextFactory};

#[derive(Debug, Deserialize)]
struct Handshake {
    run_id: uuid::Uuid,
}

/// Bind `path` and serve MCP requests, building a fresh `ToolContext` per
/// connection from `factory` once that connection's handshake arrives.
/// Removes a stale socket file left by a prior crashed run before binding.
pub async fn serve(path: &Path, factory: Arc<ToolContextFactory>) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    let tools: Arc<Vec<Box<dyn HarnessTool>>> = Arc::new(all_tools());

    loop {
        let (stream, _addr) = listener.accept().await?;
        let factory = factory.clone();
        let tools = tools.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, &tools, &factory).await {
                tracing::warn!(error = %e, "mcp socket connection ended with error");
            }
        });
    }
}

async fn serve_connection(
    stream: UnixStream,
    tools: &[Box<dyn HarnessTool>],
    factory: &ToolContextFactory,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(handshake_line) = lines.next_line().await? else {
        return Ok(());
    };
    let handshake: Handshake = match serde_json::from_str(&handshake_line) {
        Ok(h) => h,
        Err(e) => {
            let resp = JsonRpcResponse::err(None, -32600, format!("invalid handshake: {e}"));
            write_response(&mut write_half, &resp).await?;
            return Ok(());
        }
    };
    let ctx = match factory.build(handshake.run_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            let resp = JsonRpcResponse::err(None, -32000, format!("unknown run: {}", e.message));
            write_response(&mut write_half, &resp).await?;
            return Ok(());
        }
    };

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let raw: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let resp = JsonRpcResponse::err(None, -32700, format!("parse error: {e}"));
                write_response(&mut write_half, &resp).await?;
                continue;
            }
        };

        // Notifications (no "id" key) get no response.
        if !raw.as_object().map(|o| o.contains_key("id")).unwrap_or(false) {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_value(raw) {
            Ok(r) => r,
            Err(e) => {
                let resp = JsonRpcResponse::err(None, -32600, format!("invalid request: {e}"));
                write_response(&mut write_half, &resp).await?;
                continue;
            }
        };

        let response = handle_request(&request, tools, &ctx).await;
        write_response(&mut write_half, &response).await?;
    }

    Ok(())
}

async fn write_response(
    out: &mut (impl AsyncWriteExt + Unpin),
    resp: &JsonRpcResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(resp).unwrap_or_default();
    line.push(b'\n');
    out.write_all(&line).await
}
