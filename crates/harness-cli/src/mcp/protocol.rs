//! JSON-RPC 2.0 framing for the MCP Tool Surface.
//!
//! Grounded on `sdlc-cli::cmd::mcp`'s request/response structs; the error
//! frame is widened from a single `String` to the `{code, message}` shape
//! a `HarnessTool` error carries, since callers need the error *kind*
//! (`not_found`, `conflict`, ...) to decide whether to retry.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into() }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolContent {
    pub r#type: &'static str,
    pub text: String,
}

/// `{content:[{type:"text",text}], isError}` — the `tools/call` result
/// envelope every MCP tool response is wrapped in.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn success(value: &serde_json::Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        ToolCallResult {
            content: vec![ToolContent { r#type: "text", text }],
            is_error: false,
        }
    }

    /// Errors render as `{code, message}` JSON text rather than a bare
    /// string — the coding agent on the other end needs the kind to
    /// decide whether retrying makes sense at all.
    pub fn failure(code: &str, message: &str) -> Self {
        let text = serde_json::json!({ "code": code, "message": message }).to_string();
        ToolCallResult {
            content: vec![ToolContent { r#type: "text", text }],
            is_error: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_notification_without_id() {
        let req: JsonRpcRequest = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(req.id.is_none());
        assert_eq!(req.method, "ping");
    }

    #[test]
    fn tool_call_result_failure_carries_kind_and_message() {
        let result = ToolCallResult::failure("not_found", "feature not found: abc");
        assert!(result.is_error);
        assert!(result.content[0].text.contains("not_found"));
    }
}
