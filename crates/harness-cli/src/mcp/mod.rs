//! MCP Tool Surface: the JSON-RPC server a Claude Code CLI
//! subprocess talks to over stdio, and the socket relay that lets a
//! short-lived `harness mcp` process reach the long-lived engine state
//! (`Registry`, `EventBus`, `Supervisor`, `RedesignEngine`) that actually
//! owns a run.

pub mod dispatch;
pub mod protocol;
pub mod relay;
pub mod socket_server;
pub mod tools;
