//! Shared bootstrap for every subcommand that touches live engine state.
//!
//! Generalizes `sdlc-cli::root::resolve_root` + ad hoc `Config::load`
//! call sites into one assembly point, since `harness`'s engine layer has
//! more moving parts (`Registry`, `EventBus`, `Supervisor`,
//! `RedesignEngine`, skills) than a single per-command `Config::load` suits.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use harness_core::config::Config;
use harness_core::guardrail::{load_skills, SkillManifest};
use harness_core::registry::Registry;
use harness_engine::{EventBus, IdleWindows, RedesignEngine, ScreenshotCollaborator, Supervisor};

use crate::mcp::tools::ToolContextFactory;

pub struct App {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub bus: EventBus,
    pub supervisor: Arc<Supervisor>,
    pub redesign: Arc<RedesignEngine>,
    pub skills: Arc<SkillManifest>,
    pub data_dir: PathBuf,
    /// Absolute path to the running `harness` binary — this is the
    /// `mcp_command` every spawned agent's `--mcp-config` points back at.
    pub exe_path: PathBuf,
}

impl App {
    /// Load config from `<data_dir>/config.yaml` (writing a fresh default
    /// on first run, mirroring `sdlc-core::config`'s init-on-missing
    /// pattern) and wire up the engine layer.
    pub fn bootstrap(data_dir: &Path, workspace_root: &str, allowed_root_directory: &str) -> anyhow::Result<Self> {
        harness_core::io::ensure_dir(data_dir)?;
        let config_path = data_dir.join("config.yaml");
        let config = if config_path.exists() {
            Config::load(&config_path)?
        } else {
            let config = Config::new(workspace_root, allowed_root_directory);
            config.save(&config_path)?;
            config
        };

        let registry = Arc::new(Registry::open(&data_dir.join("registry.db"))?);
        let bus = EventBus::default();
        let idle_windows = IdleWindows {
            warn: Duration::from_secs(config.supervisor.idle_warn_seconds),
            kill: Duration::from_secs(config.supervisor.idle_kill_seconds),
        };
        let supervisor = Arc::new(Supervisor::new(registry.clone(), bus.clone(), idle_windows));

        let skills_dir = Path::new(&config.workspace_root).join(harness_core::paths::SKILLS_DIR);
        let skills = Arc::new(load_skills(&skills_dir));

        let redesign = Arc::new(RedesignEngine::new(registry.clone(), supervisor.clone(), bus.clone(), skills.clone()));

        let exe_path = std::env::current_exe()?;

        Ok(App { config, registry, bus, supervisor, redesign, skills, data_dir: data_dir.to_path_buf(), exe_path })
    }

    /// The `mcp_command`/`mcp_args` every orchestrated run spawns its
    /// `--mcp-config` entry with: the current binary, told to relay to
    /// this project's socket.
    pub fn mcp_invocation(&self, project_id: uuid::Uuid) -> (String, Vec<String>, PathBuf) {
        let socket_path = self.data_dir.join("sockets").join(format!("{project_id}.sock"));
        let command = self.exe_path.to_string_lossy().to_string();
        let args = vec!["mcp".to_string(), "--socket".to_string(), socket_path.to_string_lossy().to_string()];
        (command, args, socket_path)
    }

    pub fn screenshot_collaborator(&self, endpoint: impl Into<String>) -> ScreenshotCollaborator {
        ScreenshotCollaborator::new(endpoint, Duration::from_secs(self.config.ingest.url_capture_timeout_seconds))
    }

    pub fn tool_context_factory(
        &self,
        project_id: uuid::Uuid,
        workspace: PathBuf,
        screenshot: Arc<ScreenshotCollaborator>,
    ) -> ToolContextFactory {
        ToolContextFactory {
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            supervisor: self.supervisor.clone(),
            redesign: self.redesign.clone(),
            screenshot,
            ingest_cfg: self.config.ingest.clone(),
            project_id,
            workspace,
        }
    }
}
