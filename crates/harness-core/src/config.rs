use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{HarnessError, Result};

// ---------------------------------------------------------------------------
// Supervisor timeouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_idle_warn_secs")]
    pub idle_warn_seconds: u64,
    #[serde(default = "default_idle_kill_secs")]
    pub idle_kill_seconds: u64,
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_seconds: u64,
}

fn default_idle_warn_secs() -> u64 {
    120
}
fn default_idle_kill_secs() -> u64 {
    300
}
fn default_cancel_grace_secs() -> u64 {
    15
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            idle_warn_seconds: default_idle_warn_secs(),
            idle_kill_seconds: default_idle_kill_secs(),
            cancel_grace_seconds: default_cancel_grace_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reference ingest limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_image_max_bytes")]
    pub image_max_bytes: u64,
    #[serde(default = "default_archive_max_bytes")]
    pub archive_max_bytes: u64,
    #[serde(default = "default_url_capture_timeout_secs")]
    pub url_capture_timeout_seconds: u64,
}

fn default_image_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_archive_max_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_url_capture_timeout_secs() -> u64 {
    30
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            image_max_bytes: default_image_max_bytes(),
            archive_max_bytes: default_archive_max_bytes(),
            url_capture_timeout_seconds: default_url_capture_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Absolute path containing all project workspaces (`WORKSPACE_ROOT`).
    pub workspace_root: String,
    /// Prefix-checked against every project's `workspace_path` (`ALLOWED_ROOT_DIRECTORY`).
    pub allowed_root_directory: String,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(workspace_root: impl Into<String>, allowed_root_directory: impl Into<String>) -> Self {
        Config {
            version: default_version(),
            workspace_root: workspace_root.into(),
            allowed_root_directory: allowed_root_directory.into(),
            supervisor: SupervisorConfig::default(),
            ingest: IngestConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarnessError::NotInitialized);
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::new("/data/workspaces", "/data/workspaces");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.workspace_root, "/data/workspaces");
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn load_missing_config_is_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, HarnessError::NotInitialized));
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let cfg = Config::new("/ws", "/ws");
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.workspace_root, "/ws");
    }
}
