//! Request routing for the MCP Tool Surface.
//!
//! Generalized from `sdlc-cli::cmd::mcp::handle_request` — the three
//! methods (`initialize`, `tools/list`, `tools/call`) and their JSON-RPC
//! error codes are unchanged, only `tools/call` now awaits its tool
//! instead of calling it synchronously.

use serde_json::Value;

use super::protocol::{JsonRpcRequest, JsonRpcResponse, ToolCallResult};
use super::tools::{HarnessTool, ToolContext};

pub async fn handle_request(
    req: &JsonRpcRequest,
    tools: &[Box<dyn HarnessTool>],
    ctx: &ToolContext,
) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => JsonRpcResponse::ok(
            req.id.clone(),
            serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "harness", "version": env!("CARGO_PKG_VERSION") }
            }),
        ),

        "tools/list" => {
            let tool_list: Vec<Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name(),
                        "description": t.description(),
                        "inputSchema": t.schema()
                    })
                })
                .collect();
            JsonRpcResponse::ok(req.id.clone(), serde_json::json!({ "tools": tool_list }))
        }

        "tools/call" => {
            let Some(params) = &req.params else {
                return JsonRpcResponse::err(req.id.clone(), -32602, "missing params");
            };
            let Some(tool_name) = params["name"].as_str() else {
                return JsonRpcResponse::err(req.id.clone(), -32602, "missing tool name in params");
            };
            let args = params.get("arguments").cloned().unwrap_or(Value::Null);

            match tools.iter().find(|t| t.name() == tool_name) {
                None => JsonRpcResponse::err(req.id.clone(), -32601, format!("tool not found: {tool_name}")),
                Some(tool) => {
                    let call_result = match tool.call(args, ctx).await {
                        Ok(v) => ToolCallResult::success(&v),
                        Err(e) => ToolCallResult::failure(e.code, &e.message),
                    };
                    JsonRpcResponse::ok(
                        req.id.clone(),
                        serde_json::to_value(&call_result)
                            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
                    )
                }
            }
        }

        other => JsonRpcResponse::err(req.id.clone(), -32601, format!("method not found: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use std::time::Duration;

    use harness_core::config::IngestConfig;
    use harness_core::registry::Registry;
    use harness_engine::{EventBus, IdleWindows, RedesignEngine, ScreenshotCollaborator, Supervisor};
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::super::tools::all_tools;
    use super::*;

    async fn test_ctx(dir: &TempDir) -> (ToolContext, harness_core::entities::Project) {
        let registry = Arc::new(Registry::open(&dir.path().join("registry.redb")).unwrap());
        let project = registry
            .create_project("demo", dir.path().to_str().unwrap())
            .unwrap();
        let bus = EventBus::default();
        let supervisor = Arc::new(Supervisor::new(registry.clone(), bus.clone(), IdleWindows::default()));
        let skills = Arc::new(harness_core::guardrail::SkillManifest::default());
        let redesign = Arc::new(RedesignEngine::new(registry.clone(), supervisor.clone(), bus.clone(), skills));
        let screenshot = Arc::new(ScreenshotCollaborator::new(
            "http://127.0.0.1:1/unused".to_string(),
            Duration::from_secs(5),
        ));
        let ctx = ToolContext {
            registry: registry.clone(),
            bus,
            supervisor,
            redesign,
            screenshot,
            ingest_cfg: IngestConfig::default(),
            project_id: project.id,
            run_id: Uuid::new_v4(),
            feature_id: None,
            workspace: PathBuf::from(project.workspace_path.clone()),
        };
        (ctx, project)
    }

    fn make_req(id: i64, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest { jsonrpc: "2.0".into(), id: Some(Value::Number(id.into())), method: method.into(), params }
    }

    #[tokio::test]
    async fn initialize_returns_capabilities() {
        let dir = TempDir::new().unwrap();
        let (ctx, _project) = test_ctx(&dir).await;
        let tools = all_tools();
        let req = make_req(1, "initialize", Some(serde_json::json!({})));

        let resp = handle_request(&req, &tools, &ctx).await;
        assert!(resp.error.is_none());
        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "harness");
    }

    #[tokio::test]
    async fn tools_list_returns_all_fifteen() {
        let dir = TempDir::new().unwrap();
        let (ctx, _project) = test_ctx(&dir).await;
        let tools = all_tools();
        let req = make_req(2, "tools/list", Some(serde_json::json!({})));

        let resp = handle_request(&req, &tools, &ctx).await;
        let result = resp.result.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 15);
    }

    #[tokio::test]
    async fn tools_call_unknown_tool_returns_error() {
        let dir = TempDir::new().unwrap();
        let (ctx, _project) = test_ctx(&dir).await;
        let tools = all_tools();
        let req = make_req(3, "tools/call", Some(serde_json::json!({ "name": "nope", "arguments": {} })));

        let resp = handle_request(&req, &tools, &ctx).await;
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn tools_call_list_features_on_empty_project_succeeds() {
        let dir = TempDir::new().unwrap();
        let (ctx, _project) = test_ctx(&dir).await;
        let tools = all_tools();
        let req = make_req(4, "tools/call", Some(serde_json::json!({ "name": "list_features", "arguments": {} })));

        let resp = handle_request(&req, &tools, &ctx).await;
        let result = resp.result.unwrap();
        assert_eq!(result["isError"], false);
        assert!(result["content"][0]["text"].as_str().unwrap().contains('['));
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let dir = TempDir::new().unwrap();
        let (ctx, _project) = test_ctx(&dir).await;
        let tools = all_tools();
        let req = make_req(5, "bogus", None);

        let resp = handle_request(&req, &tools, &ctx).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32601);
    }
}
