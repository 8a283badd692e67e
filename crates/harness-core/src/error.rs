use thiserror::Error;

/// Domain error taxonomy for the harness.
///
/// Variants map onto a shared set of error *kinds*
/// (`NotFound`, `Conflict`, `InvariantViolation`, ...). The MCP tool surface
/// and CLI both collapse these down to their kind when reporting to a
/// caller; the variant itself carries the detail for logs.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project already exists: {0}")]
    ProjectExists(String),

    #[error("workspace path is outside the allowed root: {0}")]
    WorkspaceOutsideAllowedRoot(String),

    #[error("feature not found: {0}")]
    FeatureNotFound(String),

    #[error("invalid feature transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("feature {0} is already claimed by another run")]
    FeatureAlreadyClaimed(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("a run is already active for this project")]
    RunAlreadyActive,

    #[error("redesign session not found: {0}")]
    RedesignSessionNotFound(String),

    #[error("a redesign session is already active for this project")]
    RedesignSessionAlreadyActive,

    #[error("invalid redesign phase: {0}")]
    InvalidPhase(String),

    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    #[error("agent settings are locked while a run is active")]
    SettingsLocked,

    #[error("spec artifact coverage incomplete: {covered} of {total} requirements mapped")]
    MappingIncomplete { covered: usize, total: usize },

    #[error("unresolved conflict in spec merge: {0}")]
    UnresolvedConflict(String),

    #[error("spec chunk extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("run stalled: no activity for {0}")]
    Stalled(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("invalid slug: {0}")]
    InvalidSlug(String),

    #[error("not initialized: run `harness project new` or `harness project import` first")]
    NotInitialized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("registry storage error: {0}")]
    Registry(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    /// Collapse a variant to the wire-level error kind used by the MCP tool
    /// surface's `{code, message}` error frame.
    pub fn kind(&self) -> &'static str {
        use HarnessError::*;
        match self {
            ProjectNotFound(_)
            | FeatureNotFound(_)
            | RunNotFound(_)
            | RedesignSessionNotFound(_)
            | ReferenceNotFound(_) => "not_found",

            ProjectExists(_)
            | FeatureAlreadyClaimed(_)
            | RunAlreadyActive
            | RedesignSessionAlreadyActive
            | DuplicateName(_) => "conflict",

            WorkspaceOutsideAllowedRoot(_)
            | InvalidTransition { .. }
            | InvalidPhase(_)
            | SettingsLocked
            | MappingIncomplete { .. }
            | UnresolvedConflict(_)
            | InvalidSlug(_)
            | NotInitialized => "invariant_violation",

            Cancelled => "cancelled",
            Unauthorized(_) => "unauthorized",
            Timeout(_) => "internal",
            Stalled(_) => "internal",
            ExtractionFailed(_) => "internal",
            Io(_) | Yaml(_) | Json(_) | Registry(_) | Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_variants_map_to_not_found_kind() {
        assert_eq!(
            HarnessError::FeatureNotFound("x".into()).kind(),
            "not_found"
        );
        assert_eq!(HarnessError::RunNotFound("x".into()).kind(), "not_found");
    }

    #[test]
    fn conflict_variants_map_to_conflict_kind() {
        assert_eq!(HarnessError::RunAlreadyActive.kind(), "conflict");
        assert_eq!(
            HarnessError::FeatureAlreadyClaimed("x".into()).kind(),
            "conflict"
        );
    }

    #[test]
    fn cancelled_maps_to_cancelled_kind() {
        assert_eq!(HarnessError::Cancelled.kind(), "cancelled");
    }
}
