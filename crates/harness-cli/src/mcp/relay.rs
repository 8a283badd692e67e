//! The `harness mcp` subcommand: what the Claude Code CLI actually spawns.
//!
//! It is deliberately thin — a handshake line followed by a byte-for-byte
//! stdio-to-socket proxy, not a tool host. The JSON-RPC traffic itself is
//! already newline-delimited in both directions (the same framing
//! `harness-agent::process` uses for the CLI's own stdout), so no parsing
//! of it is needed here; `socket_server.rs` on the other end of the socket
//! does all the dispatch work.

use std::path::Path;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::UnixStream;

/// Proxy stdin/stdout to the Unix socket at `socket_path` until either side
/// closes. `HARNESS_RUN_ID` (set by `Supervisor::spawn_run` on the child's
/// environment) identifies which run this relay belongs to — one socket
/// serves every run in a project's lifetime, so this is sent as the first
/// line of the connection for `socket_server::serve` to key its
/// per-connection `ToolContext` on.
pub async fn run(socket_path: &Path) -> anyhow::Result<()> {
    let run_id = std::env::var("HARNESS_RUN_ID")
        .map_err(|_| anyhow::anyhow!("HARNESS_RUN_ID not set in mcp relay environment"))?;
    tracing::info!(run_id, socket = %socket_path.display(), "mcp relay connecting");

    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(format!("{{\"run_id\":\"{run_id}\"}}\n").as_bytes()).await?;
    let (mut socket_read, mut socket_write) = stream.into_split();

    let mut stdin = io::stdin();
    let mut stdout = io::stdout();

    let to_socket = async {
        io::copy(&mut stdin, &mut socket_write).await?;
        socket_write.shutdown().await
    };
    let to_stdout = async { io::copy(&mut socket_read, &mut stdout).await };

    tokio::select! {
        r = to_socket => { r?; }
        r = to_stdout => { r?; }
    }

    Ok(())
}
