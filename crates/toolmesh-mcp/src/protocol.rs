//! MCP (Model Context Protocol) JSON-RPC 2.0 message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params: params.unwrap_or_else(|| serde_json::json!({})),
        }
    }

    /// `notifications/cancelled` for a request the client gave up on.
    pub fn cancelled(request_id: u64, reason: &str) -> Self {
        Self::new(
            "notifications/cancelled",
            Some(serde_json::json!({ "requestId": request_id, "reason": reason })),
        )
    }
}

/// Any message a server sends: a response, or a request/notification of its own.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The numeric id of a response to one of our requests.
    ///
    /// Server-initiated requests carry a `method` and are not responses.
    pub fn response_id(&self) -> Option<u64> {
        if self.method.is_some() {
            return None;
        }
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// One capability from a `tools/list` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A page of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsPage {
    #[serde(default)]
    pub tools: Vec<Capability>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP server capabilities from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub prompts: Option<Value>,
}

/// MCP initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parameters of the `initialize` request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "toolmesh",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Parameters of a `tools/list` request for the given page.
pub fn list_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|c| serde_json::json!({ "cursor": c }))
}

/// Parameters of a `tools/call` request.
pub fn call_params(name: &str, arguments: Value) -> Value {
    serde_json::json!({
        "name": name,
        "arguments": arguments,
    })
}

/// If a `tools/call` result reports `isError: true`, the joined text content.
pub fn tool_error_text(result: &Value) -> Option<String> {
    if !result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if text.is_empty() {
        Some("tool reported an error without details".to_string())
    } else {
        Some(text)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "test/method", Some(serde_json::json!({"key": "value"})));
        let parsed = serde_json::to_value(&req).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["method"], "test/method");
        assert_eq!(parsed["params"]["key"], "value");
    }

    #[test]
    fn test_json_rpc_request_no_params() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let parsed = serde_json::to_value(&req).unwrap();
        assert!(parsed.get("params").is_none());
    }

    #[test]
    fn test_response_id_numeric_and_string() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        assert_eq!(resp.response_id(), Some(7));
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"8","result":{}}"#).unwrap();
        assert_eq!(resp.response_id(), Some(8));
    }

    #[test]
    fn test_server_request_is_not_a_response() {
        let msg: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert_eq!(msg.response_id(), None);
    }

    #[test]
    fn test_json_rpc_error_parse() {
        let json =
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid request"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32600);
        assert_eq!(err.message, "Invalid request");
    }

    #[test]
    fn test_capability_defaults_schema() {
        let cap: Capability = serde_json::from_str(r#"{"name":"list_schemas"}"#).unwrap();
        assert_eq!(cap.name, "list_schemas");
        assert!(cap.description.is_empty());
        assert_eq!(cap.input_schema["type"], "object");
    }

    #[test]
    fn test_tools_page_cursor() {
        let page: ToolsPage =
            serde_json::from_str(r#"{"tools":[{"name":"a"}],"nextCursor":"p2"}"#).unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
    }

    #[test]
    fn test_initialize_result_parse() {
        let json = r#"{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"test-server","version":"1.0"}}"#;
        let result: InitializeResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.protocol_version, "2024-11-05");
        assert!(result.capabilities.tools.is_some());
        assert_eq!(result.server_info.unwrap().name, "test-server");
    }

    #[test]
    fn test_tool_error_text() {
        let ok = serde_json::json!({"content":[{"type":"text","text":"fine"}],"isError":false});
        assert!(tool_error_text(&ok).is_none());
        let bad = serde_json::json!({"content":[{"type":"text","text":"relation missing"}],"isError":true});
        assert_eq!(tool_error_text(&bad).unwrap(), "relation missing");
    }

    #[test]
    fn test_cancelled_notification() {
        let n = JsonRpcNotification::cancelled(4, "caller cancelled");
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["method"], "notifications/cancelled");
        assert_eq!(v["params"]["requestId"], 4);
        assert!(v.get("id").is_none());
    }
}
