//! The core entity model. Plain records; all lifecycle rules live
//! in `registry` (the sole mutator), mirroring how `sdlc-core::feature`
//! keeps transition logic next to storage rather than on the struct itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    ExitReason, FeatureCategory, FeatureStatus, Framework, OperationKind, ReferenceType, RunKind,
    RunStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub workspace_path: String,
    pub spec_version: u32,
    pub agent_settings: AgentSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, workspace_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Project {
            id: Uuid::new_v4(),
            name: name.into(),
            workspace_path: workspace_path.into(),
            spec_version: 0,
            agent_settings: AgentSettings::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-project agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub model_id: String,
    pub yolo_mode: bool,
    pub require_tdd: bool,
    pub env_config_policy: bool,
    pub locked: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            model_id: "claude-opus-4-1".to_string(),
            yolo_mode: false,
            require_tdd: true,
            env_config_policy: true,
            locked: false,
        }
    }
}

/// One immutable version of a project's spec artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecVersion {
    pub project_id: Uuid,
    pub version_id: u32,
    pub source_text: String,
    pub created_at: DateTime<Utc>,
    pub diff_from_prev: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub project_id: Uuid,
    pub ordinal: u32,
    pub title: String,
    pub description: String,
    pub category: FeatureCategory,
    pub status: FeatureStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub depends_on: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feature {
    pub fn new(
        project_id: Uuid,
        ordinal: u32,
        title: impl Into<String>,
        description: impl Into<String>,
        category: FeatureCategory,
        depends_on: Vec<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Feature {
            id: Uuid::new_v4(),
            project_id,
            ordinal,
            title: title.into(),
            description: description.into(),
            category,
            status: FeatureStatus::Pending,
            attempt_count: 0,
            last_error: None,
            depends_on,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_eligible(&self, done_ids: &std::collections::HashSet<Uuid>) -> bool {
        self.status == FeatureStatus::Pending && self.depends_on.iter().all(|d| done_ids.contains(d))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub project_id: Uuid,
    pub kind: RunKind,
    pub feature_id: Option<Uuid>,
    pub pid: Option<u32>,
    pub status: RunStatus,
    pub model_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub last_error: Option<String>,
}

impl Run {
    pub fn new(project_id: Uuid, kind: RunKind, feature_id: Option<Uuid>, model_id: impl Into<String>) -> Self {
        Run {
            id: Uuid::new_v4(),
            project_id,
            kind,
            feature_id,
            pid: None,
            status: RunStatus::Starting,
            model_id: model_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            exit_reason: None,
            last_error: None,
        }
    }
}

/// Extracted style vocabulary. Every leaf is a
/// string in the output design system's own source format — the harness
/// does not interpret colors or units, only threads them through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesignTokens {
    #[serde(default)]
    pub color: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub typography: std::collections::BTreeMap<String, TypographyToken>,
    #[serde(default)]
    pub spacing: Vec<String>,
    #[serde(default)]
    pub radii: Vec<String>,
    #[serde(default)]
    pub shadows: Vec<String>,
    #[serde(default)]
    pub motion: Option<MotionToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypographyToken {
    pub family: String,
    pub weight: String,
    pub size: String,
    pub line_height: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionToken {
    pub duration: String,
    pub easing: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub target_path: String,
    pub kind: OperationKind,
    pub rationale: String,
    pub diff_preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlanPhase {
    pub key: crate::types::RedesignPhase,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangePlan {
    pub phases: Vec<ChangePlanPhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_manifest: Option<ComponentManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentManifestEntry {
    pub path: String,
    pub kind: crate::types::ComponentKind,
    pub route: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentManifest {
    pub framework: Framework,
    pub entries: Vec<ComponentManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub id: Uuid,
    pub session_id: Uuid,
    pub kind: ReferenceType,
    /// Opaque payload bytes. Stored inline in the registry value; callers
    /// needing a byte budget should check `payload.len()` against the
    /// per-kind ceilings enforced at ingest time, not here.
    pub payload: Vec<u8>,
    pub metadata: ReferenceMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseApprovals {
    pub globals: bool,
    pub config: bool,
    pub components: bool,
    pub pages: bool,
}

impl PhaseApprovals {
    pub fn get(&self, phase: crate::types::RedesignPhase) -> bool {
        use crate::types::RedesignPhase::*;
        match phase {
            Globals => self.globals,
            Config => self.config,
            Components => self.components,
            Pages => self.pages,
        }
    }

    pub fn set(&mut self, phase: crate::types::RedesignPhase) {
        use crate::types::RedesignPhase::*;
        match phase {
            Globals => self.globals = true,
            Config => self.config = true,
            Components => self.components = true,
            Pages => self.pages = true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedesignSession {
    pub id: Uuid,
    pub project_id: Uuid,
    pub status: crate::types::RedesignStatus,
    pub style_brief: String,
    pub references: Vec<Uuid>,
    pub extracted_tokens: Option<DesignTokens>,
    pub change_plan: Option<ChangePlan>,
    pub framework_detected: Option<Framework>,
    pub phase_approvals: PhaseApprovals,
    pub created_at: DateTime<Utc>,
}

impl RedesignSession {
    pub fn new(project_id: Uuid, style_brief: impl Into<String>) -> Self {
        RedesignSession {
            id: Uuid::new_v4(),
            project_id,
            status: crate::types::RedesignStatus::Collecting,
            style_brief: style_brief.into(),
            references: Vec::new(),
            extracted_tokens: None,
            change_plan: None,
            framework_detected: None,
            phase_approvals: PhaseApprovals::default(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_eligibility_respects_dependencies() {
        let project_id = Uuid::new_v4();
        let dep = Feature::new(
            project_id,
            0,
            "dep",
            "",
            FeatureCategory::Core,
            vec![],
        );
        let mut feature = Feature::new(
            project_id,
            1,
            "feat",
            "",
            FeatureCategory::Core,
            vec![dep.id],
        );
        let mut done = std::collections::HashSet::new();
        assert!(!feature.is_eligible(&done));
        done.insert(dep.id);
        assert!(feature.is_eligible(&done));
        feature.status = FeatureStatus::Done;
        assert!(!feature.is_eligible(&done));
    }

    #[test]
    fn phase_approvals_independent_per_phase() {
        let mut approvals = PhaseApprovals::default();
        assert!(!approvals.get(crate::types::RedesignPhase::Globals));
        approvals.set(crate::types::RedesignPhase::Globals);
        assert!(approvals.get(crate::types::RedesignPhase::Globals));
        assert!(!approvals.get(crate::types::RedesignPhase::Config));
    }
}
