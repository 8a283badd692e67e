//! Native Rust driver for the Claude Code CLI subprocess
//! (`claude --print --output-format stream-json`).
//!
//! # Architecture
//!
//! ```text
//! QueryOptions
//!     │
//!     ▼
//! ClaudeProcess   ← spawns `claude --print --output-format stream-json …`
//!     │              reads JSONL from stdout
//!     ▼
//! QueryStream     ← implements futures::Stream<Item = Result<Message>>
//!     │              background task + mpsc channel
//!     ▼
//! Message enum    ← fully typed; no Value escape hatches
//! ```
//!
//! The Run Orchestrator drives the streaming form directly (so it can
//! forward every message onto the Event Bus as it arrives); the Spec
//! Compiler and Redesign Engine's planning collaborators use [`agent_run`]
//! for one-shot, non-interactive invocations that only care about the
//! final result text.

pub mod error;
pub mod runner;
pub mod types;

pub(crate) mod process;
pub mod session;
pub mod stream;

pub use error::AgentError;
pub use runner::{run as agent_run, RunConfig, RunResult};
pub use session::SessionStore;
pub use stream::QueryStream;
pub use types::{
    AssistantContent, AssistantMessage, ContentBlock, McpServerConfig, Message, PermissionMode,
    QueryOptions, ResultError, ResultMessage, ResultSuccess, SystemMessage, SystemPayload,
    TokenUsage, UserMessage,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Drive a single agentic query against the Claude Code CLI.
///
/// Returns a [`QueryStream`] that yields [`Message`] values as they arrive
/// from the subprocess. The stream terminates after the first
/// [`Message::Result`] or on process exit.
pub fn query(prompt: impl Into<String>, opts: QueryOptions) -> QueryStream {
    QueryStream::new(prompt.into(), opts)
}

/// Like [`query`], but force-kills the child as soon as `cancel` carries
/// `true` instead of waiting for its next stdout line. The Process
/// Supervisor uses this form so a cancelled run's child is actually
/// terminated rather than merely disconnected.
pub fn query_cancellable(
    prompt: impl Into<String>,
    opts: QueryOptions,
    cancel: tokio::sync::watch::Receiver<bool>,
) -> QueryStream {
    QueryStream::new_cancellable(prompt.into(), opts, Some(cancel))
}
