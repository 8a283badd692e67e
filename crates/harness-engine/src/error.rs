use thiserror::Error;

/// Errors from the execution layer: process supervision, orchestration,
/// the redesign pipeline, and reference ingest. Domain-level failures
/// (invariant violations, not-found, conflict) come straight from
/// `harness_core::HarnessError` and are wrapped rather than re-cast, so a
/// caller can still match on the original kind.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] harness_core::HarnessError),

    #[error(transparent)]
    Agent(#[from] harness_agent::AgentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("subprocess exited without reaching a terminal state: {0}")]
    RunIncomplete(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation stalled: {0}")]
    Stalled(String),

    #[error("reference validation failed: {0}")]
    InvalidReference(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Collapse to the wire-level error-kind taxonomy shared with
    /// `HarnessError::kind`, so the MCP Tool Surface can
    /// render a uniform `{code, message}` error frame regardless of which
    /// layer a failure originated in.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Registry(e) => e.kind(),
            EngineError::Cancelled => "cancelled",
            EngineError::Timeout(_) | EngineError::Stalled(_) => "internal",
            _ => "internal",
        }
    }
}
