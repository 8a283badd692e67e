//! The MCP Tool Surface: the fifteen tools a Claude Code CLI
//! subprocess calls back into the harness through.
//!
//! Grounded on `sdlc-cli::tools::{SdlcTool, all_tools}`'s shape — one
//! struct per tool, a flat catalog function, `name`/`description`/`schema`
//! plus a call method — generalized from sync `fn call(args, root) ->
//! Result<Value, String>` to `async fn call(args, ctx) -> Result<Value,
//! ToolError>`, since `require_phase_approval` must suspend the in-flight
//! call without blocking the socket server's other connections, and every
//! tool needs live engine state (`Registry`, `EventBus`, `Supervisor`,
//! `RedesignEngine`) rather than just a workspace root.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use harness_core::config::IngestConfig;
use harness_core::entities::{ChangePlan, DesignTokens};
use harness_core::registry::Registry;
use harness_core::types::{FeatureStatus, RedesignPhase, ReferenceType};
use harness_engine::{ingest, EventBus, RedesignEngine, ScreenshotCollaborator, Supervisor};
use serde_json::{json, Value};
use uuid::Uuid;

/// `{code, message}` error frame shared with the CLI's own error reporting
/// — `code` is one of `HarnessError::kind()`'s taxonomy.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub code: &'static str,
    pub message: String,
}

impl From<harness_core::HarnessError> for ToolError {
    fn from(e: harness_core::HarnessError) -> Self {
        ToolError { code: e.kind(), message: e.to_string() }
    }
}

impl From<harness_engine::EngineError> for ToolError {
    fn from(e: harness_engine::EngineError) -> Self {
        ToolError { code: e.kind(), message: e.to_string() }
    }
}

fn bad_args(message: impl Into<String>) -> ToolError {
    ToolError { code: "invariant_violation", message: message.into() }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| bad_args(format!("missing or non-string argument: {key}")))
}

fn require_uuid(args: &Value, key: &str) -> Result<Uuid, ToolError> {
    Uuid::parse_str(require_str(args, key)?).map_err(|e| bad_args(format!("invalid uuid for {key}: {e}")))
}

/// Run a blocking `Registry` call on the blocking thread pool, flattening
/// the join error into the same `ToolError` shape as a registry failure.
async fn blocking<F, T>(f: F) -> Result<T, ToolError>
where
    F: FnOnce() -> harness_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ToolError { code: "internal", message: format!("join error: {e}") })?
        .map_err(ToolError::from)
}

/// Everything a tool call needs, assembled fresh per request by the socket
/// server from the run it was dispatched for.
pub struct ToolContext {
    pub registry: Arc<Registry>,
    pub bus: EventBus,
    pub supervisor: Arc<Supervisor>,
    pub redesign: Arc<RedesignEngine>,
    pub screenshot: Arc<ScreenshotCollaborator>,
    pub ingest_cfg: IngestConfig,
    pub project_id: Uuid,
    pub run_id: Uuid,
    pub feature_id: Option<Uuid>,
    pub workspace: PathBuf,
}

/// Builds a [`ToolContext`] for whichever run connects next. One factory
/// is shared by every connection the socket server accepts for a project,
/// since `Orchestrator::run` reuses the same `mcp_command`/`mcp_args`
/// across every run it spawns (initializer, every feature, regression) —
/// the run a given connection belongs to is only known once the relay's
/// handshake line arrives (see `socket_server::serve`).
pub struct ToolContextFactory {
    pub registry: Arc<Registry>,
    pub bus: EventBus,
    pub supervisor: Arc<Supervisor>,
    pub redesign: Arc<RedesignEngine>,
    pub screenshot: Arc<ScreenshotCollaborator>,
    pub ingest_cfg: IngestConfig,
    pub project_id: Uuid,
    pub workspace: PathBuf,
}

impl ToolContextFactory {
    pub async fn build(&self, run_id: Uuid) -> Result<ToolContext, ToolError> {
        let registry = self.registry.clone();
        let run = blocking(move || registry.get_run(run_id)).await?;
        Ok(ToolContext {
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            supervisor: self.supervisor.clone(),
            redesign: self.redesign.clone(),
            screenshot: self.screenshot.clone(),
            ingest_cfg: self.ingest_cfg.clone(),
            project_id: self.project_id,
            run_id,
            feature_id: run.feature_id,
            workspace: self.workspace.clone(),
        })
    }
}

#[async_trait]
pub trait HarnessTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

// ---------------------------------------------------------------------------
// Feature lifecycle
// ---------------------------------------------------------------------------

pub struct ListFeaturesTool;

#[async_trait]
impl HarnessTool for ListFeaturesTool {
    fn name(&self) -> &str {
        "list_features"
    }
    fn description(&self) -> &str {
        "List every feature in the current project's backlog."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let registry = ctx.registry.clone();
        let project_id = ctx.project_id;
        let features = blocking(move || registry.list_features(project_id)).await?;
        Ok(json!(features))
    }
}

pub struct ClaimFeatureTool;

#[async_trait]
impl HarnessTool for ClaimFeatureTool {
    fn name(&self) -> &str {
        "claim_feature"
    }
    fn description(&self) -> &str {
        "Claim a pending feature, transitioning it to in_progress."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "required": ["feature_id"], "properties": { "feature_id": { "type": "string" } } })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let feature_id = require_uuid(&args, "feature_id")?;
        let registry = ctx.registry.clone();
        let feature = blocking(move || registry.transition_feature(feature_id, FeatureStatus::InProgress, None)).await?;
        ctx.bus.publish_feature_event(ctx.project_id, feature_id, "in_progress").await;
        Ok(json!(feature))
    }
}

pub struct MarkCompleteTool;

#[async_trait]
impl HarnessTool for MarkCompleteTool {
    fn name(&self) -> &str {
        "mark_complete"
    }
    fn description(&self) -> &str {
        "Mark the run's feature done, or (for initializer/regression runs with no feature) \
         simply acknowledge the run is finished."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        match ctx.feature_id {
            Some(feature_id) => {
                let registry = ctx.registry.clone();
                let run_id = ctx.run_id;
                let (feature, _run) =
                    blocking(move || registry.complete_feature_and_finish_run(feature_id, run_id)).await?;
                ctx.bus.publish_feature_event(ctx.project_id, feature_id, "done").await;
                Ok(json!(feature))
            }
            None => Ok(json!({ "acknowledged": true })),
        }
    }
}

pub struct MarkNeedsReviewTool;

#[async_trait]
impl HarnessTool for MarkNeedsReviewTool {
    fn name(&self) -> &str {
        "mark_needs_review"
    }
    fn description(&self) -> &str {
        "Mark the run's feature as needing human review, with a reason."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "required": ["reason"], "properties": { "reason": { "type": "string" } } })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let feature_id = ctx
            .feature_id
            .ok_or_else(|| bad_args("this run has no associated feature to mark needs_review"))?;
        let reason = require_str(&args, "reason")?.to_string();
        let registry = ctx.registry.clone();
        let feature = blocking(move || {
            registry.transition_feature(feature_id, FeatureStatus::NeedsReview, Some(&reason))
        })
        .await?;
        ctx.bus.publish_feature_event(ctx.project_id, feature_id, "needs_review").await;
        Ok(json!(feature))
    }
}

pub struct MarkBlockedTool;

#[async_trait]
impl HarnessTool for MarkBlockedTool {
    fn name(&self) -> &str {
        "mark_blocked"
    }
    fn description(&self) -> &str {
        "Mark the run's feature as blocked, with a reason."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "required": ["reason"], "properties": { "reason": { "type": "string" } } })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let feature_id = ctx
            .feature_id
            .ok_or_else(|| bad_args("this run has no associated feature to mark blocked"))?;
        let reason = require_str(&args, "reason")?.to_string();
        let registry = ctx.registry.clone();
        let feature =
            blocking(move || registry.transition_feature(feature_id, FeatureStatus::Blocked, Some(&reason))).await?;
        ctx.bus.publish_feature_event(ctx.project_id, feature_id, "blocked").await;
        Ok(json!(feature))
    }
}

pub struct UnclaimTool;

#[async_trait]
impl HarnessTool for UnclaimTool {
    fn name(&self) -> &str {
        "unclaim"
    }
    fn description(&self) -> &str {
        "Return a feature to pending — releasing a claim taken in error, or reopening a \
         done feature a regression run found broken."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["feature_id", "reason"],
            "properties": { "feature_id": { "type": "string" }, "reason": { "type": "string" } }
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let feature_id = require_uuid(&args, "feature_id")?;
        let reason = require_str(&args, "reason")?.to_string();
        let registry = ctx.registry.clone();
        let feature =
            blocking(move || registry.transition_feature(feature_id, FeatureStatus::Pending, Some(&reason))).await?;
        ctx.bus.publish_feature_event(ctx.project_id, feature_id, "pending").await;
        Ok(json!(feature))
    }
}

// ---------------------------------------------------------------------------
// Observability and spec access
// ---------------------------------------------------------------------------

pub struct AppendLogTool;

#[async_trait]
impl HarnessTool for AppendLogTool {
    fn name(&self) -> &str {
        "append_log"
    }
    fn description(&self) -> &str {
        "Append a structured log line to the run's event-bus topic."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["level", "message"],
            "properties": { "level": { "type": "string" }, "message": { "type": "string" } }
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let level = require_str(&args, "level")?;
        let message = require_str(&args, "message")?;
        ctx.supervisor.touch(ctx.run_id).await;
        ctx.bus.publish_run_log(ctx.run_id, level, message).await;
        Ok(json!({ "acknowledged": true }))
    }
}

pub struct ReadSpecTool;

#[async_trait]
impl HarnessTool for ReadSpecTool {
    fn name(&self) -> &str {
        "read_spec"
    }
    fn description(&self) -> &str {
        "Read the project's current application spec text."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let registry = ctx.registry.clone();
        let project_id = ctx.project_id;
        let version = blocking(move || registry.latest_spec_version(project_id)).await?;
        match version {
            Some(v) => Ok(json!({ "version_id": v.version_id, "text": v.source_text })),
            None => Err(bad_args("project has no spec version")),
        }
    }
}

pub struct ReadAgentSettingsTool;

#[async_trait]
impl HarnessTool for ReadAgentSettingsTool {
    fn name(&self) -> &str {
        "read_agent_settings"
    }
    fn description(&self) -> &str {
        "Read the project's agent settings (model, yolo_mode, require_tdd, env_config_policy)."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let registry = ctx.registry.clone();
        let project_id = ctx.project_id;
        let project = blocking(move || registry.get_project(project_id)).await?;
        Ok(json!(project.agent_settings))
    }
}

// ---------------------------------------------------------------------------
// Redesign pipeline
// ---------------------------------------------------------------------------

pub struct ListReferencesTool;

#[async_trait]
impl HarnessTool for ListReferencesTool {
    fn name(&self) -> &str {
        "list_references"
    }
    fn description(&self) -> &str {
        "List the style references attached to a redesign session (metadata only, no payload bytes)."
    }
    fn schema(&self) -> Value {
        json!({ "type": "object", "required": ["session_id"], "properties": { "session_id": { "type": "string" } } })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let session_id = require_uuid(&args, "session_id")?;
        let registry = ctx.registry.clone();
        let references = blocking(move || registry.list_references(session_id)).await?;
        let summaries: Vec<Value> = references
            .iter()
            .map(|r| json!({ "id": r.id, "kind": r.kind, "metadata": r.metadata }))
            .collect();
        Ok(json!(summaries))
    }
}

pub struct WriteTokensTool;

#[async_trait]
impl HarnessTool for WriteTokensTool {
    fn name(&self) -> &str {
        "write_tokens"
    }
    fn description(&self) -> &str {
        "Record the extracted design tokens for a redesign session."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "tokens"],
            "properties": { "session_id": { "type": "string" }, "tokens": { "type": "object" } }
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let session_id = require_uuid(&args, "session_id")?;
        let tokens: DesignTokens = serde_json::from_value(
            args.get("tokens").cloned().ok_or_else(|| bad_args("missing tokens"))?,
        )
        .map_err(|e| bad_args(format!("invalid tokens: {e}")))?;
        let registry = ctx.registry.clone();
        let session = blocking(move || registry.set_design_tokens(session_id, tokens)).await?;
        Ok(json!(session))
    }
}

pub struct WritePlanTool;

#[async_trait]
impl HarnessTool for WritePlanTool {
    fn name(&self) -> &str {
        "write_plan"
    }
    fn description(&self) -> &str {
        "Record the change plan for a redesign session."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "plan"],
            "properties": { "session_id": { "type": "string" }, "plan": { "type": "object" } }
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let session_id = require_uuid(&args, "session_id")?;
        let plan: ChangePlan = serde_json::from_value(
            args.get("plan").cloned().ok_or_else(|| bad_args("missing plan"))?,
        )
        .map_err(|e| bad_args(format!("invalid plan: {e}")))?;
        let registry = ctx.registry.clone();
        let session = blocking(move || registry.set_change_plan(session_id, plan)).await?;
        Ok(json!(session))
    }
}

pub struct RequirePhaseApprovalTool;

#[async_trait]
impl HarnessTool for RequirePhaseApprovalTool {
    fn name(&self) -> &str {
        "require_phase_approval"
    }
    fn description(&self) -> &str {
        "Suspend until the given redesign phase is approved (or the session is cancelled). \
         Call before touching any file in that phase's scope."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "phase"],
            "properties": { "session_id": { "type": "string" }, "phase": { "type": "string" } }
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let session_id = require_uuid(&args, "session_id")?;
        let phase: RedesignPhase = require_str(&args, "phase")?
            .parse()
            .map_err(|_| bad_args("invalid phase"))?;
        ctx.redesign.waiters.wait_for(ctx.registry.clone(), session_id, phase).await?;
        Ok(json!({ "approved": true }))
    }
}

// ---------------------------------------------------------------------------
// Reference ingest
// ---------------------------------------------------------------------------

pub struct CaptureUrlTool;

#[async_trait]
impl HarnessTool for CaptureUrlTool {
    fn name(&self) -> &str {
        "capture_url"
    }
    fn description(&self) -> &str {
        "Capture a screenshot of a URL and attach it as a style reference to a redesign session."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_id", "url"],
            "properties": {
                "session_id": { "type": "string" },
                "url": { "type": "string" },
                "width": { "type": "integer" },
                "height": { "type": "integer" }
            }
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let session_id = require_uuid(&args, "session_id")?;
        let url = require_str(&args, "url")?.to_string();
        let width = args.get("width").and_then(Value::as_u64).unwrap_or(1280) as u32;
        let height = args.get("height").and_then(Value::as_u64).unwrap_or(720) as u32;

        let (bytes, metadata) =
            ingest::ingest_url(&ctx.screenshot, &url, (width, height), &ctx.ingest_cfg).await?;

        let reference = harness_core::entities::Reference {
            id: Uuid::new_v4(),
            session_id,
            kind: ReferenceType::Url,
            payload: bytes,
            metadata,
            created_at: chrono::Utc::now(),
        };

        let registry = ctx.registry.clone();
        let reference = blocking(move || registry.create_reference(reference)).await?;
        let registry = ctx.registry.clone();
        blocking(move || registry.attach_reference(session_id, reference.id)).await?;

        Ok(json!({ "reference_id": reference.id }))
    }
}

pub struct RenderComponentTool;

#[async_trait]
impl HarnessTool for RenderComponentTool {
    fn name(&self) -> &str {
        "render_component"
    }
    fn description(&self) -> &str {
        "Render one component from an archive reference in isolation, returning a base64 PNG — \
         used during verification, not persisted as a new reference."
    }
    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["archive_ref", "selector"],
            "properties": { "archive_ref": { "type": "string" }, "selector": { "type": "string" } }
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let archive_ref = require_str(&args, "archive_ref")?;
        let selector = require_str(&args, "selector")?;
        let bytes = ctx.screenshot.render_component(archive_ref, selector).await?;
        Ok(json!({ "image_base64": BASE64_STANDARD.encode(&bytes) }))
    }
}

pub fn all_tools() -> Vec<Box<dyn HarnessTool>> {
    vec![
        Box::new(ListFeaturesTool),
        Box::new(ClaimFeatureTool),
        Box::new(MarkCompleteTool),
        Box::new(MarkNeedsReviewTool),
        Box::new(MarkBlockedTool),
        Box::new(UnclaimTool),
        Box::new(AppendLogTool),
        Box::new(ReadSpecTool),
        Box::new(ReadAgentSettingsTool),
        Box::new(ListReferencesTool),
        Box::new(WriteTokensTool),
        Box::new(WritePlanTool),
        Box::new(RequirePhaseApprovalTool),
        Box::new(CaptureUrlTool),
        Box::new(RenderComponentTool),
    ]
}
