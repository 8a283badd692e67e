use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse stream-json line: {source}\n  line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("process error: {0}")]
    Process(String),

    #[error("subprocess exited with status {code}: {stderr}")]
    ExitedNonZero { code: i32, stderr: String },

    #[error("session not found for key: {0}")]
    SessionNotFound(String),
}
