use crate::error::{HarnessError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Workspace layout
// ---------------------------------------------------------------------------

pub const PROMPTS_DIR: &str = "prompts";
pub const APP_SPEC_FILE: &str = "prompts/app_spec.txt";
pub const SPEC_MANIFEST_FILE: &str = "prompts/.spec_manifest.json";
pub const SPEC_VERSIONS_DIR: &str = "prompts/spec_versions";
pub const SPEC_UPDATES_DIR: &str = "prompts/spec_updates";

pub const AUTO_AGENT_DIR: &str = ".auto-agent";
pub const FEATURES_SNAPSHOT_FILE: &str = ".auto-agent/features.json";
pub const AGENT_SETTINGS_FILE: &str = ".auto-agent/agent_settings.json";
pub const REDESIGN_DIR: &str = ".auto-agent/redesign";

pub const SKILLS_DIR: &str = "skills";

pub fn app_spec_path(workspace: &Path) -> PathBuf {
    workspace.join(APP_SPEC_FILE)
}

pub fn spec_manifest_path(workspace: &Path) -> PathBuf {
    workspace.join(SPEC_MANIFEST_FILE)
}

pub fn spec_version_path(workspace: &Path, version_id: u32) -> PathBuf {
    workspace
        .join(SPEC_VERSIONS_DIR)
        .join(format!("v{version_id}.txt"))
}

pub fn spec_update_dir(workspace: &Path, update_id: &str) -> PathBuf {
    workspace.join(SPEC_UPDATES_DIR).join(update_id)
}

pub fn features_snapshot_path(workspace: &Path) -> PathBuf {
    workspace.join(FEATURES_SNAPSHOT_FILE)
}

pub fn agent_settings_snapshot_path(workspace: &Path) -> PathBuf {
    workspace.join(AGENT_SETTINGS_FILE)
}

pub fn redesign_session_dir(workspace: &Path, session_id: &str) -> PathBuf {
    workspace.join(REDESIGN_DIR).join(format!("session-{session_id}"))
}

pub fn redesign_references_dir(workspace: &Path, session_id: &str) -> PathBuf {
    redesign_session_dir(workspace, session_id).join("references")
}

pub fn redesign_tokens_path(workspace: &Path, session_id: &str) -> PathBuf {
    redesign_session_dir(workspace, session_id).join("tokens.json")
}

pub fn redesign_plan_path(workspace: &Path, session_id: &str) -> PathBuf {
    redesign_session_dir(workspace, session_id).join("plan.json")
}

pub fn skills_dir(workspace: &Path) -> PathBuf {
    workspace.join(SKILLS_DIR)
}

// ---------------------------------------------------------------------------
// Data directory (harness-wide, not per-workspace)
// ---------------------------------------------------------------------------

pub fn registry_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("registry.db")
}

// ---------------------------------------------------------------------------
// Workspace path validation
// ---------------------------------------------------------------------------

/// Verify `workspace_path` resolves inside `allowed_root`. Both are
/// canonicalized before the prefix check so `..` traversal and symlinks
/// can't escape the sandbox.
pub fn validate_workspace_path(workspace_path: &Path, allowed_root: &Path) -> Result<()> {
    let root = allowed_root
        .canonicalize()
        .map_err(|e| HarnessError::Internal(format!("allowed root does not exist: {e}")))?;
    let candidate = if workspace_path.exists() {
        workspace_path
            .canonicalize()
            .map_err(|e| HarnessError::Internal(format!("cannot resolve workspace path: {e}")))?
    } else {
        // Not-yet-created workspaces are validated against their parent.
        let parent = workspace_path.parent().unwrap_or(workspace_path);
        let parent = parent
            .canonicalize()
            .map_err(|e| HarnessError::Internal(format!("cannot resolve workspace parent: {e}")))?;
        parent.join(workspace_path.file_name().unwrap_or_default())
    };

    if !candidate.starts_with(&root) {
        return Err(HarnessError::WorkspaceOutsideAllowedRoot(
            workspace_path.display().to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Slug validation (project names, feature slugs used in log/event topics)
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() || slug.len() > 64 || !slug_re().is_match(slug) {
        return Err(HarnessError::InvalidSlug(slug.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn valid_slugs() {
        for slug in ["auth-login", "a", "my-feature-123", "x1"] {
            validate_slug(slug).unwrap_or_else(|_| panic!("expected valid: {slug}"));
        }
    }

    #[test]
    fn invalid_slugs() {
        for slug in ["", "-bad", "bad-", "has spaces", "UPPER", "a_b"] {
            assert!(validate_slug(slug).is_err(), "expected invalid: {slug}");
        }
    }

    #[test]
    fn workspace_inside_root_is_valid() {
        let root = TempDir::new().unwrap();
        let ws = root.path().join("project-a");
        std::fs::create_dir_all(&ws).unwrap();
        validate_workspace_path(&ws, root.path()).unwrap();
    }

    #[test]
    fn workspace_outside_root_is_rejected() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let err = validate_workspace_path(outside.path(), root.path()).unwrap_err();
        assert!(matches!(err, HarnessError::WorkspaceOutsideAllowedRoot(_)));
    }

    #[test]
    fn workspace_traversal_is_rejected() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("a")).unwrap();
        let traversal = root.path().join("a").join("..").join("..").join("escaped");
        let err = validate_workspace_path(&traversal, root.path()).unwrap_err();
        assert!(matches!(err, HarnessError::WorkspaceOutsideAllowedRoot(_)));
    }

    #[test]
    fn path_helpers() {
        let ws = Path::new("/tmp/proj");
        assert_eq!(app_spec_path(ws), PathBuf::from("/tmp/proj/prompts/app_spec.txt"));
        assert_eq!(
            features_snapshot_path(ws),
            PathBuf::from("/tmp/proj/.auto-agent/features.json")
        );
        assert_eq!(
            redesign_tokens_path(ws, "abc"),
            PathBuf::from("/tmp/proj/.auto-agent/redesign/session-abc/tokens.json")
        );
    }
}
