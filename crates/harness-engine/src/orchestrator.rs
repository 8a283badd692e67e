//! The Run Orchestrator: drives a single project through its
//! complete execution lifecycle —
//! `Idle -> Initializing -> FeatureLoop -> Regression -> Idle`.
//!
//! New state machine grounded on the shape of a classifier's
//! context-to-classification loop — "repeatedly evaluate state, decide the
//! next action, act, repeat" — generalized here to feature selection instead
//! of log classification, and layered on top of the Process Supervisor for
//! the actual agent execution.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use harness_core::entities::Feature;
use harness_core::guardrail::{render_prompt, SkillManifest};
use harness_core::registry::Registry;
use harness_core::types::{AgentMode, FeatureStatus, RunKind};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::{EngineError, Result};
use crate::supervisor::Supervisor;

/// Phase of a project's orchestration loop.
/// `Idle` is both the start and every terminal landing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initializing,
    FeatureLoop,
    Regression,
}

const MAX_FEATURE_ATTEMPTS: u32 = 3;

/// One project's orchestration loop. Holds no state beyond a cancel flag —
/// everything else (current phase, which feature is active) lives in the
/// Registry so the loop can resume cleanly after a crash.
pub struct Orchestrator {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    bus: EventBus,
    skills: Arc<SkillManifest>,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, supervisor: Arc<Supervisor>, bus: EventBus, skills: Arc<SkillManifest>) -> Self {
        Orchestrator {
            registry,
            supervisor,
            bus,
            skills,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation: observed at each natural
    /// scheduling point, not preemptive.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Drive `project_id` through `INITIALIZING -> FEATURE_LOOP -> REGRESSION`
    /// to completion, or until cancelled. Returns the phase the loop landed
    /// on when it stopped (always `Idle` absent a bug, per the diagram).
    pub async fn run(&self, project_id: Uuid, mcp_command: String, mcp_args: Vec<String>) -> Result<Phase> {
        let project = {
            let registry = self.registry.clone();
            tokio::task::spawn_blocking(move || registry.get_project(project_id))
                .await
                .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
        };

        if self.cancelled() {
            return Ok(Phase::Idle);
        }

        self.initializing(&project, mcp_command.clone(), mcp_args.clone()).await?;

        if self.cancelled() {
            return Ok(Phase::Idle);
        }

        self.feature_loop(&project, mcp_command.clone(), mcp_args.clone()).await?;

        if self.cancelled() {
            return Ok(Phase::Idle);
        }

        self.regression(&project, mcp_command, mcp_args).await?;

        Ok(Phase::Idle)
    }

    async fn initializing(
        &self,
        project: &harness_core::entities::Project,
        mcp_command: String,
        mcp_args: Vec<String>,
    ) -> Result<()> {
        self.bus.publish_feature_event(project.id, project.id, "initializing").await;

        let spec_version = {
            let registry = self.registry.clone();
            let project_id = project.id;
            tokio::task::spawn_blocking(move || registry.latest_spec_version(project_id))
                .await
                .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
        }
        .ok_or_else(|| EngineError::Internal("project has no spec version to initialize from".into()))?;

        let base_prompt = format!(
            "You are initializing this project from its application spec.\n\n{}",
            spec_version.source_text
        );
        let system_prompt = render_prompt(&base_prompt, &project.agent_settings, AgentMode::Initializer, &self.skills);

        let spawned = self
            .supervisor
            .spawn_run(
                project.id,
                RunKind::Initializer,
                None,
                &project.agent_settings,
                system_prompt,
                "Produce the initial feature backlog via replace_features, then call mark_complete."
                    .to_string(),
                mcp_command,
                mcp_args,
                None,
                PathBuf::from(&project.workspace_path),
            )
            .await?;

        let outcome = spawned.join.await.map_err(|e| EngineError::Internal(format!("join error: {e}")))?;
        outcome?;
        Ok(())
    }

    async fn feature_loop(
        &self,
        project: &harness_core::entities::Project,
        mcp_command: String,
        mcp_args: Vec<String>,
    ) -> Result<()> {
        loop {
            if self.cancelled() {
                return Ok(());
            }

            let next = {
                let registry = self.registry.clone();
                let project_id = project.id;
                tokio::task::spawn_blocking(move || select_next_feature(&registry, project_id))
                    .await
                    .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
            };

            let Some(feature) = next else {
                // No pending-and-eligible feature remains; needs_review
                // features are left for the user.
                return Ok(());
            };

            {
                let registry = self.registry.clone();
                let feature_id = feature.id;
                tokio::task::spawn_blocking(move || {
                    registry.transition_feature(feature_id, FeatureStatus::InProgress, None)
                })
                .await
                .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
            }
            self.bus.publish_feature_event(project.id, feature.id, "in_progress").await;

            let base_prompt = format!(
                "Implement the following feature end to end, including tests:\n\nTitle: {}\n\n{}",
                feature.title, feature.description
            );
            let system_prompt = render_prompt(&base_prompt, &project.agent_settings, AgentMode::Coding, &self.skills);

            let spawned = self
                .supervisor
                .spawn_run(
                    project.id,
                    RunKind::Coding,
                    Some(feature.id),
                    &project.agent_settings,
                    system_prompt,
                    "Implement this feature, then call mark_complete or mark_needs_review.".to_string(),
                    mcp_command.clone(),
                    mcp_args.clone(),
                    None,
                    PathBuf::from(&project.workspace_path),
                )
                .await?;

            let run_id = spawned.run_id;
            let outcome = spawned.join.await.map_err(|e| EngineError::Internal(format!("join error: {e}")))?;

            let final_status = {
                let registry = self.registry.clone();
                let feature_id = feature.id;
                tokio::task::spawn_blocking(move || registry.get_feature(feature_id))
                    .await
                    .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
                    .status
            };

            if final_status == FeatureStatus::Done || final_status == FeatureStatus::NeedsReview {
                // The agent itself called mark_complete / mark_needs_review via
                // the MCP tool surface before exiting; nothing further to do.
                self.bus.publish_feature_event(project.id, feature.id, final_status.as_str()).await;
                continue;
            }

            // The run ended (cleanly or not) without the feature reaching a
            // terminal status — count the attempt and retry or escalate.
            if let Err(e) = &outcome {
                tracing::warn!(run_id = %run_id, feature_id = %feature.id, "coding run ended without completing feature: {e}");
            }

            let updated = {
                let registry = self.registry.clone();
                let feature_id = feature.id;
                let err_text = outcome.as_ref().err().map(|e| e.to_string()).unwrap_or_else(|| "run exited without completing the feature".to_string());
                tokio::task::spawn_blocking(move || registry.record_feature_attempt_failure(feature_id, &err_text))
                    .await
                    .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
            };

            if updated.attempt_count >= MAX_FEATURE_ATTEMPTS {
                let registry = self.registry.clone();
                let feature_id = feature.id;
                tokio::task::spawn_blocking(move || {
                    registry.transition_feature(feature_id, FeatureStatus::NeedsReview, Some("exceeded retry budget"))
                })
                .await
                .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
                self.bus.publish_feature_event(project.id, feature.id, "needs_review").await;
            } else {
                let registry = self.registry.clone();
                let feature_id = feature.id;
                tokio::task::spawn_blocking(move || registry.transition_feature(feature_id, FeatureStatus::Pending, None))
                    .await
                    .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
                self.bus.publish_feature_event(project.id, feature.id, "pending").await;
            }
        }
    }

    async fn regression(
        &self,
        project: &harness_core::entities::Project,
        mcp_command: String,
        mcp_args: Vec<String>,
    ) -> Result<()> {
        if self.cancelled() {
            return Ok(());
        }

        let base_prompt =
            "Run end-to-end verification across the full feature set. If you find a regression, \
             reopen the offending feature with unclaim so it returns to the backlog, then explain why."
                .to_string();
        let system_prompt = render_prompt(&base_prompt, &project.agent_settings, AgentMode::Regression, &self.skills);

        let spawned = self
            .supervisor
            .spawn_run(
                project.id,
                RunKind::Regression,
                None,
                &project.agent_settings,
                system_prompt,
                "Verify the application end to end, then call mark_complete.".to_string(),
                mcp_command,
                mcp_args,
                None,
                PathBuf::from(&project.workspace_path),
            )
            .await?;

        let outcome = spawned.join.await.map_err(|e| EngineError::Internal(format!("join error: {e}")))?;
        outcome?;
        Ok(())
    }
}

/// Pick the lowest-ordinal `pending` feature whose dependencies are all
/// `done`. Runs inside `spawn_blocking` — pure Registry reads.
fn select_next_feature(registry: &Registry, project_id: Uuid) -> harness_core::Result<Option<Feature>> {
    let features = registry.list_features(project_id)?;
    let done: std::collections::HashSet<Uuid> = features
        .iter()
        .filter(|f| f.status == FeatureStatus::Done)
        .map(|f| f.id)
        .collect();
    Ok(features.into_iter().find(|f| f.is_eligible(&done)))
}
