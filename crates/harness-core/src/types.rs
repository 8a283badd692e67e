use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;

/// Feature classification, used by the Spec Compiler to bucket generated
/// work and by the Guardrail Enforcer to decide which skill packs apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    Infrastructure,
    Core,
    Ui,
    Integration,
    Testing,
    Documentation,
}

impl FeatureCategory {
    pub const fn all() -> &'static [FeatureCategory] {
        &[
            FeatureCategory::Infrastructure,
            FeatureCategory::Core,
            FeatureCategory::Ui,
            FeatureCategory::Integration,
            FeatureCategory::Testing,
            FeatureCategory::Documentation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureCategory::Infrastructure => "infrastructure",
            FeatureCategory::Core => "core",
            FeatureCategory::Ui => "ui",
            FeatureCategory::Integration => "integration",
            FeatureCategory::Testing => "testing",
            FeatureCategory::Documentation => "documentation",
        }
    }
}

impl fmt::Display for FeatureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureCategory {
    type Err = HarnessError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| HarnessError::Internal(format!("unknown feature category: {s}")))
    }
}

/// Feature lifecycle. Edges enforced by the Registry Store, not here — see
/// `Registry::transition_feature`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    NeedsReview,
    Blocked,
    Done,
    Skipped,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::InProgress => "in_progress",
            FeatureStatus::NeedsReview => "needs_review",
            FeatureStatus::Blocked => "blocked",
            FeatureStatus::Done => "done",
            FeatureStatus::Skipped => "skipped",
        }
    }

    /// Allowed forward edges of the feature lifecycle. `(InProgress, Pending)` covers
    /// both a failed attempt returning to the backlog for retry and an
    /// explicit `unclaim`; `(Done, Pending)` covers regression reopening a
    /// feature it found broken.
    pub fn can_transition_to(&self, target: FeatureStatus) -> bool {
        use FeatureStatus::*;
        matches!(
            (self, target),
            (Pending, InProgress)
                | (InProgress, Done)
                | (InProgress, NeedsReview)
                | (InProgress, Blocked)
                | (InProgress, Skipped)
                | (InProgress, Pending)
                | (NeedsReview, InProgress)
                | (Blocked, Pending)
                | (Done, Pending)
        )
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Initializer,
    Coding,
    Regression,
    Redesign,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Initializer => "initializer",
            RunKind::Coding => "coding",
            RunKind::Regression => "regression",
            RunKind::Redesign => "redesign",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run lifecycle. `{starting, running, paused, cancelling}` are non-terminal;
/// at most one such Run may exist per project (enforced by the Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    Paused,
    Cancelling,
    Finished,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a Run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Clean,
    Error,
    Killed,
    Timeout,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Clean => "clean",
            ExitReason::Error => "error",
            ExitReason::Killed => "killed",
            ExitReason::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// RedesignSession lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedesignStatus {
    Collecting,
    Extracting,
    Planning,
    Approving,
    Implementing,
    Verifying,
    Done,
    Cancelled,
}

impl RedesignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedesignStatus::Collecting => "collecting",
            RedesignStatus::Extracting => "extracting",
            RedesignStatus::Planning => "planning",
            RedesignStatus::Approving => "approving",
            RedesignStatus::Implementing => "implementing",
            RedesignStatus::Verifying => "verifying",
            RedesignStatus::Done => "done",
            RedesignStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RedesignStatus::Done | RedesignStatus::Cancelled)
    }

    /// Forward-only ordering through the redesign phases; `Cancelled` is reachable from
    /// any non-terminal state.
    pub fn next(&self) -> Option<RedesignStatus> {
        use RedesignStatus::*;
        match self {
            Collecting => Some(Extracting),
            Extracting => Some(Planning),
            Planning => Some(Approving),
            Approving => Some(Implementing),
            Implementing => Some(Verifying),
            Verifying => Some(Done),
            Done | Cancelled => None,
        }
    }
}

impl fmt::Display for RedesignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four redesign phases gating `implementing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedesignPhase {
    Globals,
    Config,
    Components,
    Pages,
}

impl RedesignPhase {
    pub const fn ordered() -> &'static [RedesignPhase] {
        &[
            RedesignPhase::Globals,
            RedesignPhase::Config,
            RedesignPhase::Components,
            RedesignPhase::Pages,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedesignPhase::Globals => "globals",
            RedesignPhase::Config => "config",
            RedesignPhase::Components => "components",
            RedesignPhase::Pages => "pages",
        }
    }
}

impl fmt::Display for RedesignPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedesignPhase {
    type Err = HarnessError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ordered()
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| HarnessError::InvalidPhase(s.to_string()))
    }
}

/// Reference kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Image,
    Url,
    Archive,
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReferenceType::Image => "image",
            ReferenceType::Url => "url",
            ReferenceType::Archive => "archive",
        };
        f.write_str(s)
    }
}

/// Detected frontend framework for an archive reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    React,
    Vue,
    Svelte,
    SwiftUi,
    Flutter,
    HtmlTailwind,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Framework::React => "react",
            Framework::Vue => "vue",
            Framework::Svelte => "svelte",
            Framework::SwiftUi => "swiftui",
            Framework::Flutter => "flutter",
            Framework::HtmlTailwind => "html_tailwind",
        };
        f.write_str(s)
    }
}

/// Component kind within a parsed archive manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Page,
    Layout,
    Component,
}

/// Change-plan operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Modify,
    Replace,
}

/// Guardrail Enforcer mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Initializer,
    Coding,
    Regression,
    Redesign,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Initializer => "initializer",
            AgentMode::Coding => "coding",
            AgentMode::Regression => "regression",
            AgentMode::Redesign => "redesign",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_status_forward_edges() {
        assert!(FeatureStatus::Pending.can_transition_to(FeatureStatus::InProgress));
        assert!(FeatureStatus::InProgress.can_transition_to(FeatureStatus::Done));
        assert!(FeatureStatus::NeedsReview.can_transition_to(FeatureStatus::InProgress));
        assert!(FeatureStatus::Blocked.can_transition_to(FeatureStatus::Pending));
    }

    #[test]
    fn feature_status_rejects_illegal_edges() {
        assert!(!FeatureStatus::Pending.can_transition_to(FeatureStatus::Done));
        assert!(!FeatureStatus::Skipped.can_transition_to(FeatureStatus::InProgress));
        assert!(!FeatureStatus::Done.can_transition_to(FeatureStatus::InProgress));
    }

    #[test]
    fn feature_status_allows_retry_and_regression_reopen() {
        assert!(FeatureStatus::InProgress.can_transition_to(FeatureStatus::Pending));
        assert!(FeatureStatus::Done.can_transition_to(FeatureStatus::Pending));
    }

    #[test]
    fn redesign_status_is_forward_only() {
        assert_eq!(
            RedesignStatus::Collecting.next(),
            Some(RedesignStatus::Extracting)
        );
        assert_eq!(RedesignStatus::Done.next(), None);
        assert_eq!(RedesignStatus::Cancelled.next(), None);
    }

    #[test]
    fn redesign_phase_from_str_roundtrip() {
        for phase in RedesignPhase::ordered() {
            let parsed: RedesignPhase = phase.as_str().parse().unwrap();
            assert_eq!(parsed, *phase);
        }
        assert!("bogus".parse::<RedesignPhase>().is_err());
    }

    #[test]
    fn feature_category_from_str() {
        assert_eq!(
            "documentation".parse::<FeatureCategory>().unwrap(),
            FeatureCategory::Documentation
        );
        assert!("nonsense".parse::<FeatureCategory>().is_err());
    }
}
