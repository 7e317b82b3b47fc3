//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ─── Inbound Classification ──────────────────────────────────────────────────

/// Any JSON-RPC value read off a connection, before classification.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// An inbound JSON-RPC value, classified by which of `id` and `method` it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Has an id and no method.
    Response(JsonRpcResponse),
    /// Has a method and no id.
    Notification(JsonRpcNotification),
    /// Has both: a server-initiated request, which this client does not serve.
    Request { id: Value, method: String },
}

impl IncomingMessage {
    /// Classify a single decoded JSON value.
    pub fn classify(value: Value) -> Result<Self, String> {
        let raw: RawMessage =
            serde_json::from_value(value).map_err(|e| format!("not a JSON-RPC message: {e}"))?;

        match (raw.id.filter(|v| !v.is_null()), raw.method) {
            (Some(id), Some(method)) => Ok(IncomingMessage::Request { id, method }),
            (Some(id), None) => {
                let id = id
                    .as_u64()
                    .ok_or_else(|| format!("response id is not an unsigned integer: {id}"))?;
                Ok(IncomingMessage::Response(JsonRpcResponse {
                    jsonrpc: default_jsonrpc(),
                    id,
                    result: raw.result,
                    error: raw.error,
                }))
            }
            (None, Some(method)) => Ok(IncomingMessage::Notification(JsonRpcNotification {
                jsonrpc: default_jsonrpc(),
                method,
                params: raw.params,
            })),
            (None, None) => Err("message has neither id nor method".into()),
        }
    }

    /// Parse and classify one line of text.
    pub fn parse(line: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
        Self::classify(value)
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision announced on stdio connections.
pub const STDIO_PROTOCOL_VERSION: &str = "2024-11-05";

/// Protocol revision announced on streaming HTTP connections.
pub const HTTP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Name this client reports in `clientInfo`.
pub const CLIENT_NAME: &str = "toolwire";

/// MCP tool definition as returned by `tools/list`.
///
/// Unknown fields are preserved so a definition relayed through the tunnel
/// arrives intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl McpToolDefinition {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            extra: serde_json::Map::new(),
        }
    }
}

/// Build the `initialize` params for a given protocol revision.
pub fn initialize_params(protocol_version: &str) -> Value {
    serde_json::json!({
        "protocolVersion": protocol_version,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// `prompts/list` result. Prompt shapes are relayed as-is.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptsListResult {
    #[serde(default)]
    pub prompts: Vec<Value>,
}

/// `resources/list` result. Resource shapes are relayed as-is.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesListResult {
    #[serde(default)]
    pub resources: Vec<Value>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"tools/list\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_classify_response() {
        let msg = IncomingMessage::parse(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#)
            .unwrap();
        match msg {
            IncomingMessage::Response(resp) => {
                assert_eq!(resp.id, 3);
                assert_eq!(resp.result.unwrap()["ok"], true);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        let msg = IncomingMessage::parse(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        let IncomingMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_classify_notification() {
        let msg = IncomingMessage::parse(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            IncomingMessage::Notification(ref n) if n.method == "notifications/tools/list_changed"
        ));
    }

    #[test]
    fn test_classify_null_id_is_notification() {
        let msg = IncomingMessage::parse(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert!(matches!(msg, IncomingMessage::Notification(_)));
    }

    #[test]
    fn test_classify_server_request() {
        let msg =
            IncomingMessage::parse(r#"{"jsonrpc":"2.0","id":"abc","method":"sampling/create"}"#)
                .unwrap();
        assert!(matches!(msg, IncomingMessage::Request { .. }));
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(IncomingMessage::parse("server booting...").is_err());
        assert!(IncomingMessage::parse(r#"{"jsonrpc":"2.0"}"#).is_err());
    }

    #[test]
    fn test_tool_definition_preserves_unknown_fields() {
        let json = r#"{"name":"search","inputSchema":{"type":"object"},"annotations":{"readOnly":true}}"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.description, "");
        assert_eq!(tool.extra["annotations"]["readOnly"], true);

        let back = serde_json::to_value(&tool).unwrap();
        assert_eq!(back["inputSchema"]["type"], "object");
        assert_eq!(back["annotations"]["readOnly"], true);
    }

    #[test]
    fn test_initialize_params() {
        let params = initialize_params(STDIO_PROTOCOL_VERSION);
        assert_eq!(params["protocolVersion"], "2024-11-05");
        assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
    }
}
