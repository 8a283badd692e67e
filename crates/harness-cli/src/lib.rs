//! Library surface behind the `harness` binary: the shared bootstrap
//! (`app`), the typed exit-code contract (`cli_exit`), the subcommand
//! handlers (`cmd`), and the MCP tool-surface host (`mcp`). Split out of
//! `main.rs` so the command handlers are unit-testable without a process
//! boundary.

pub mod app;
pub mod cli_exit;
pub mod cmd;
pub mod mcp;
