//! The Redesign Engine: drives one `RedesignSession` through its
//! phase-gated status machine, and hosts the suspension registry behind
//! `require_phase_approval` — an MCP tool call that blocks rather than
//! errors when its phase isn't approved yet.
//!
//! The phase machine itself is new code against
//! the entity model in `harness_core::entities`/`registry`; the
//! suspend-a-waiter-resume-on-event shape is grounded on the same
//! register/notify pattern the Process Supervisor's pause/resume uses
//! (`supervisor::RunControl`), generalized from a single running/paused
//! flag to one waiter per `(session, phase)` pair.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use harness_core::entities::{Project, RedesignSession};
use harness_core::registry::Registry;
use harness_core::types::{AgentMode, RedesignPhase, RedesignStatus, RunKind};
use harness_core::guardrail::{render_prompt, SkillManifest};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::bus::{topic, EventBus};
use crate::error::{EngineError, Result};
use crate::supervisor::Supervisor;

/// Outcome delivered to a suspended `require_phase_approval` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Cancelled,
}

/// Registry of pending `require_phase_approval` waiters, keyed by
/// `(session_id, phase)`. Multiple concurrent tool calls for the same
/// phase are all released together on approval.
#[derive(Default)]
pub struct PhaseWaiters {
    waiters: Mutex<HashMap<(Uuid, RedesignPhase), Vec<oneshot::Sender<ApprovalOutcome>>>>,
}

impl PhaseWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called from an MCP tool handler. Resolves immediately if `phase` is
    /// already approved; otherwise suspends until `approve` or `cancel` is
    /// called for this `(session_id, phase)`.
    pub async fn wait_for(&self, registry: Arc<Registry>, session_id: Uuid, phase: RedesignPhase) -> Result<()> {
        let session = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || registry.get_redesign_session(session_id))
                .await
                .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
        };
        if session.phase_approvals.get(phase) {
            return Ok(());
        }
        if session.status == RedesignStatus::Cancelled {
            return Err(EngineError::Cancelled);
        }

        let rx = {
            let mut waiters = self.waiters.lock().await;
            let (tx, rx) = oneshot::channel();
            waiters.entry((session_id, phase)).or_default().push(tx);
            rx
        };

        match rx.await {
            Ok(ApprovalOutcome::Approved) => Ok(()),
            Ok(ApprovalOutcome::Cancelled) | Err(_) => Err(EngineError::Cancelled),
        }
    }

    /// Release every waiter currently suspended on `(session_id, phase)`.
    pub async fn approve(&self, session_id: Uuid, phase: RedesignPhase) {
        let senders = {
            let mut waiters = self.waiters.lock().await;
            waiters.remove(&(session_id, phase)).unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(ApprovalOutcome::Approved);
        }
    }

    /// Release every waiter for every phase of `session_id` with `cancelled`,
    /// since a suspended tool call should not be left hanging when its
    /// session is cancelled.
    pub async fn cancel_session(&self, session_id: Uuid) {
        let mut waiters = self.waiters.lock().await;
        let keys: Vec<_> = waiters.keys().filter(|(s, _)| *s == session_id).cloned().collect();
        for key in keys {
            if let Some(senders) = waiters.remove(&key) {
                for tx in senders {
                    let _ = tx.send(ApprovalOutcome::Cancelled);
                }
            }
        }
    }
}

/// Drives a single `RedesignSession` through `extracting` / `planning` /
/// `implementing` / `verifying`. `collecting` and `approving` involve no
/// agent run — they're driven entirely by MCP tool calls (ingest, approve)
/// from outside this struct.
pub struct RedesignEngine {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    bus: EventBus,
    skills: Arc<SkillManifest>,
    pub waiters: Arc<PhaseWaiters>,
}

impl RedesignEngine {
    pub fn new(registry: Arc<Registry>, supervisor: Arc<Supervisor>, bus: EventBus, skills: Arc<SkillManifest>) -> Self {
        RedesignEngine {
            registry,
            supervisor,
            bus,
            skills,
            waiters: Arc::new(PhaseWaiters::new()),
        }
    }

    async fn publish_status(&self, session: &RedesignSession) {
        self.bus
            .publish(crate::bus::Event::new(
                topic::session_redesign(session.id),
                serde_json::json!({ "status": session.status.as_str() }),
            ))
            .await;
    }

    /// Run `extracting` then `planning`, stopping at `approving` (which
    /// has no agent of its own — the caller surfaces the plan to the user
    /// and waits for `approve_phase` calls).
    pub async fn advance_to_approving(
        &self,
        session_id: Uuid,
        mcp_command: String,
        mcp_args: Vec<String>,
    ) -> Result<()> {
        let (project, session) = self.load(session_id).await?;
        if session.status != RedesignStatus::Collecting {
            return Err(EngineError::Internal(format!(
                "advance_to_approving called from status {}",
                session.status
            )));
        }

        self.transition(session_id, RedesignStatus::Extracting).await?;
        self.run_phase_agent(
            &project,
            session_id,
            "Extract a DesignTokens record from the attached references via write_tokens, then finish.",
            mcp_command.clone(),
            mcp_args.clone(),
        )
        .await?;

        self.transition(session_id, RedesignStatus::Planning).await?;
        let planning_prompt = self.planning_prompt(session_id).await?;
        self.run_phase_agent(&project, session_id, &planning_prompt, mcp_command, mcp_args)
            .await?;

        self.transition(session_id, RedesignStatus::Approving).await?;
        Ok(())
    }

    /// Called once the user has approved a phase — records the approval
    /// and releases any suspended `require_phase_approval` waiters for it.
    pub async fn approve_phase(&self, session_id: Uuid, phase: RedesignPhase) -> Result<()> {
        let registry = self.registry.clone();
        let session = tokio::task::spawn_blocking(move || registry.record_phase_approval(session_id, phase))
            .await
            .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
        self.publish_status(&session).await;
        self.waiters.approve(session_id, phase).await;
        Ok(())
    }

    /// Move from `approving` into `implementing`, spawning the main coding
    /// agent with the change plan as input; `require_phase_approval` calls
    /// it makes mid-run resolve against `PhaseWaiters`.
    pub async fn start_implementing(
        &self,
        session_id: Uuid,
        mcp_command: String,
        mcp_args: Vec<String>,
    ) -> Result<()> {
        let (project, session) = self.load(session_id).await?;
        if session.status != RedesignStatus::Approving {
            return Err(EngineError::Internal(format!(
                "start_implementing called from status {}",
                session.status
            )));
        }

        self.transition(session_id, RedesignStatus::Implementing).await?;
        self.run_phase_agent(
            &project,
            session_id,
            "Apply the approved change plan. Call require_phase_approval(phase) before touching \
             files in that phase's scope — the call will suspend, not error, if the phase isn't \
             approved yet.",
            mcp_command.clone(),
            mcp_args.clone(),
        )
        .await?;

        self.transition(session_id, RedesignStatus::Verifying).await?;
        self.run_phase_agent(
            &project,
            session_id,
            "Verify the redesigned surfaces render correctly, then finish.",
            mcp_command,
            mcp_args,
        )
        .await?;

        self.transition(session_id, RedesignStatus::Done).await?;
        Ok(())
    }

    /// Cancel a session from any non-terminal state, releasing every
    /// suspended waiter with `cancelled` and stopping its in-flight agent
    /// run, if any.
    pub async fn cancel(&self, session_id: Uuid) -> Result<()> {
        let registry = self.registry.clone();
        let project_id = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || registry.get_redesign_session(session_id))
                .await
                .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
                .project_id
        };
        let active_run = {
            let registry = registry.clone();
            tokio::task::spawn_blocking(move || registry.active_run(project_id))
                .await
                .map_err(|e| EngineError::Internal(format!("join error: {e}")))??
        };

        let session = tokio::task::spawn_blocking(move || registry.update_redesign_status(session_id, RedesignStatus::Cancelled))
            .await
            .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
        self.publish_status(&session).await;
        self.waiters.cancel_session(session_id).await;
        if let Some(run) = active_run {
            self.supervisor.cancel(run.id).await.ok();
        }
        Ok(())
    }

    async fn load(&self, session_id: Uuid) -> Result<(Project, RedesignSession)> {
        let registry = self.registry.clone();
        let session = tokio::task::spawn_blocking(move || registry.get_redesign_session(session_id))
            .await
            .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
        let registry = self.registry.clone();
        let project_id = session.project_id;
        let project = tokio::task::spawn_blocking(move || registry.get_project(project_id))
            .await
            .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
        Ok((project, session))
    }

    async fn transition(&self, session_id: Uuid, status: RedesignStatus) -> Result<()> {
        let registry = self.registry.clone();
        let session = tokio::task::spawn_blocking(move || registry.update_redesign_status(session_id, status))
            .await
            .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;
        self.publish_status(&session).await;
        Ok(())
    }

    /// Build the planning-phase prompt, scoping the pages phase's
    /// candidate components per spec.md §4.7: a reference carrying a
    /// `page_identifier` binds its manifest entries to that page alone.
    async fn planning_prompt(&self, session_id: Uuid) -> Result<String> {
        let registry = self.registry.clone();
        let references = tokio::task::spawn_blocking(move || registry.list_references(session_id))
            .await
            .map_err(|e| EngineError::Internal(format!("join error: {e}")))??;

        let candidates = crate::ingest::page_phase_candidates(&references);
        let base = "Produce a ChangePlan covering globals, config, components, and pages via \
                    write_plan, then finish.";
        if candidates.is_empty() {
            return Ok(base.to_string());
        }

        let listing = candidates
            .iter()
            .map(|c| format!("- {} (route {})", c.path, c.route.as_deref().unwrap_or("?")))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!(
            "{base}\n\nFor the pages phase, only treat these components as candidates — \
             archive references that name a page_identifier are bound to that page alone:\n{listing}"
        ))
    }

    async fn run_phase_agent(
        &self,
        project: &Project,
        session_id: Uuid,
        base_prompt: &str,
        mcp_command: String,
        mcp_args: Vec<String>,
    ) -> Result<()> {
        let system_prompt = render_prompt(base_prompt, &project.agent_settings, AgentMode::Redesign, &self.skills);
        let spawned = self
            .supervisor
            .spawn_run(
                project.id,
                RunKind::Redesign,
                None,
                &project.agent_settings,
                system_prompt,
                base_prompt.to_string(),
                mcp_command,
                mcp_args,
                None,
                PathBuf::from(&project.workspace_path),
            )
            .await?;
        let outcome = spawned.join.await.map_err(|e| EngineError::Internal(format!("join error: {e}")))?;
        // A cancelled session's waiters must not be left hanging even if the
        // run itself exits uncancelled for some other reason.
        if let Err(EngineError::Cancelled) = &outcome {
            self.waiters.cancel_session(session_id).await;
        }
        outcome
    }
}
