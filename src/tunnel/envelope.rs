//! Tunnel wire envelopes.
//!
//! On the wire every frame is `{"type", "id", "timestamp", "data"}`. The
//! `type` string selects the payload shape, and decoding validates `data`
//! against it once so handlers only ever see typed payloads.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::TunnelError;
use crate::mcp_client::McpToolDefinition;

// ─── Payloads ────────────────────────────────────────────────────────────────

/// Sent by the slave right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterData {
    pub hostname: String,
    pub version: String,
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// Sent by the slave when its local catalog changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUpdateData {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// Master asks the slave to run one of its tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub tool: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

/// Outcome of a `tool_call` or `master_tool_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawResponse")]
pub struct ResponseData {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseData {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// The result value, or the error message for a failed call.
    pub fn into_result(self) -> Result<Value, String> {
        match (self.success, self.error) {
            (true, None) => Ok(self.result.unwrap_or(Value::Null)),
            (_, Some(error)) => Err(error),
            (false, None) => Err("tool call failed".to_string()),
        }
    }
}

/// Error reported by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: String,
}

/// The master's catalog, grouped by upstream server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterToolsData {
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<McpToolDefinition>>,
    /// Context name → server names enabled for that context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_mappings: Option<HashMap<String, Vec<String>>>,
}

/// Slave asks the master to run a tool on one of the master's servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterToolCallData {
    pub server: String,
    pub tool: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ─── Response Decoding ───────────────────────────────────────────────────────

/// Lenient shape for incoming responses.
///
/// `error` may be a plain string or a JSON-RPC style `{code, message}`
/// object, and `success` may be missing.
#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorField>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Message(String),
    Rpc { code: i64, message: String },
}

impl ErrorField {
    fn into_message(self) -> Option<String> {
        match self {
            Self::Message(m) if m.is_empty() => None,
            Self::Message(m) => Some(m),
            Self::Rpc { code, message } => Some(format!("{message} (code {code})")),
        }
    }
}

impl RawResponse {
    fn flatten(self) -> ResponseData {
        let error = self.error.and_then(ErrorField::into_message);
        ResponseData {
            success: self.success.unwrap_or(error.is_none()),
            result: self.result.filter(|r| !r.is_null()),
            error,
        }
    }
}

impl From<RawResponse> for ResponseData {
    fn from(raw: RawResponse) -> Self {
        let outer = raw.flatten();
        if outer.error.is_some() {
            return outer;
        }
        // A response may wrap another `{success, result, error}` object one level down.
        let nested = match &outer.result {
            Some(inner @ Value::Object(map)) if map.get("success").is_some_and(Value::is_boolean) => {
                serde_json::from_value::<RawResponse>(inner.clone()).ok()
            }
            _ => None,
        };
        nested.map(RawResponse::flatten).unwrap_or(outer)
    }
}

// ─── Envelope ────────────────────────────────────────────────────────────────

/// Typed payload, one variant per envelope `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Register(RegisterData),
    Heartbeat,
    ToolUpdate(ToolUpdateData),
    ToolCall(ToolCallData),
    Response(ResponseData),
    Error(ErrorData),
    Restart,
    Upgrade,
    MasterTools(MasterToolsData),
    MasterToolCall(MasterToolCallData),
}

impl Payload {
    /// The wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Heartbeat => "heartbeat",
            Self::ToolUpdate(_) => "tool_update",
            Self::ToolCall(_) => "tool_call",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
            Self::Restart => "restart",
            Self::Upgrade => "upgrade",
            Self::MasterTools(_) => "master_tools",
            Self::MasterToolCall(_) => "master_tool_call",
        }
    }

    fn to_data(&self) -> Result<Option<Value>, serde_json::Error> {
        let value = match self {
            Self::Register(d) => serde_json::to_value(d)?,
            Self::ToolUpdate(d) => serde_json::to_value(d)?,
            Self::ToolCall(d) => serde_json::to_value(d)?,
            Self::Response(d) => serde_json::to_value(d)?,
            Self::Error(d) => serde_json::to_value(d)?,
            Self::MasterTools(d) => serde_json::to_value(d)?,
            Self::MasterToolCall(d) => serde_json::to_value(d)?,
            Self::Heartbeat | Self::Restart | Self::Upgrade => return Ok(None),
        };
        Ok(Some(value))
    }

    fn from_data(kind: &str, data: Option<Value>) -> Result<Self, TunnelError> {
        fn typed<T: serde::de::DeserializeOwned>(
            kind: &str,
            data: Option<Value>,
        ) -> Result<T, TunnelError> {
            let data = data.ok_or_else(|| TunnelError::envelope(kind, "missing data"))?;
            serde_json::from_value(data).map_err(|e| TunnelError::envelope(kind, e))
        }

        Ok(match kind {
            "register" => Self::Register(typed(kind, data)?),
            "heartbeat" => Self::Heartbeat,
            "tool_update" => Self::ToolUpdate(typed(kind, data)?),
            "tool_call" => Self::ToolCall(typed(kind, data)?),
            "response" => Self::Response(typed(kind, data)?),
            "error" => Self::Error(typed(kind, data)?),
            "restart" => Self::Restart,
            "upgrade" => Self::Upgrade,
            "master_tools" => Self::MasterTools(typed(kind, data)?),
            "master_tool_call" => Self::MasterToolCall(typed(kind, data)?),
            other => return Err(TunnelError::envelope(other, "unknown envelope type")),
        })
    }
}

/// One tunnel frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Correlation id. Empty for frames that need no reply.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

/// Untyped wire form.
#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl Envelope {
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// An envelope with no correlation id.
    pub fn notice(payload: Payload) -> Self {
        Self::new(String::new(), payload)
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Best-effort id of a frame that failed to decode, so the sender can be
    /// answered anyway.
    pub fn peek_id(text: &str) -> Option<String> {
        let value: Value = serde_json::from_str(text).ok()?;
        value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(String::from)
    }

    /// Best-effort `type` of a frame that failed to decode.
    pub fn peek_kind(text: &str) -> Option<String> {
        let value: Value = serde_json::from_str(text).ok()?;
        value.get("type").and_then(Value::as_str).map(String::from)
    }

    pub fn decode(text: &str) -> Result<Self, TunnelError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| TunnelError::envelope("frame", e))?;
        let payload = Payload::from_data(&raw.kind, raw.data)?;
        Ok(Self {
            id: raw.id,
            timestamp: raw.timestamp,
            payload,
        })
    }

    pub fn encode(&self) -> Result<String, TunnelError> {
        let kind = self.kind();
        let raw = RawEnvelope {
            kind: kind.to_string(),
            id: self.id.clone(),
            timestamp: self.timestamp,
            data: self
                .payload
                .to_data()
                .map_err(|e| TunnelError::envelope(kind, e))?,
        };
        serde_json::to_string(&raw).map_err(|e| TunnelError::envelope(kind, e))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_tool_call() {
        let text = r#"{"type":"tool_call","id":"42","timestamp":"2024-05-01T12:00:00Z",
                       "data":{"tool":"files_read","arguments":{"path":"/etc/hosts"}}}"#;
        let env = Envelope::decode(text).unwrap();
        assert_eq!(env.id, "42");
        assert_eq!(env.kind(), "tool_call");
        match env.payload {
            Payload::ToolCall(call) => {
                assert_eq!(call.tool, "files_read");
                assert_eq!(call.arguments["path"], "/etc/hosts");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_tool_call_without_arguments_gets_empty_object() {
        let env = Envelope::decode(r#"{"type":"tool_call","id":"1","data":{"tool":"x"}}"#).unwrap();
        let Payload::ToolCall(call) = env.payload else {
            panic!("expected tool_call");
        };
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Envelope::decode(r#"{"type":"teleport","id":"1"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown envelope type"));
        assert_eq!(Envelope::peek_kind(r#"{"type":"teleport"}"#).as_deref(), Some("teleport"));
    }

    #[test]
    fn test_missing_or_malformed_data_is_rejected() {
        assert!(Envelope::decode(r#"{"type":"tool_call","id":"1"}"#).is_err());
        let bad = r#"{"type":"tool_call","id":"9","data":{"arguments":{}}}"#;
        assert!(Envelope::decode(bad).is_err());
        assert_eq!(Envelope::peek_id(bad).as_deref(), Some("9"));
    }

    #[test]
    fn test_unit_envelopes_omit_data_and_empty_id() {
        let text = Envelope::notice(Payload::Heartbeat).encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value.get("id").is_none());
        assert!(value.get("data").is_none());
        assert!(value["timestamp"].is_string());

        // Restart carries no data, extra fields are ignored.
        let env = Envelope::decode(r#"{"type":"restart","data":{"reason":"deploy"}}"#).unwrap();
        assert_eq!(env.payload, Payload::Restart);
    }

    #[test]
    fn test_response_error_shapes() {
        let plain: ResponseData =
            serde_json::from_value(json!({"success": false, "error": "no such tool"})).unwrap();
        assert_eq!(plain.into_result().unwrap_err(), "no such tool");

        let rpc: ResponseData =
            serde_json::from_value(json!({"error": {"code": -32601, "message": "missing"}}))
                .unwrap();
        assert!(!rpc.success);
        assert_eq!(rpc.into_result().unwrap_err(), "missing (code -32601)");

        let ok: ResponseData = serde_json::from_value(json!({"result": {"n": 1}})).unwrap();
        assert!(ok.success);
        assert_eq!(ok.into_result().unwrap(), json!({"n": 1}));
    }

    #[test]
    fn test_nested_response_is_unwrapped() {
        let nested: ResponseData = serde_json::from_value(json!({
            "result": {"success": false, "error": "upstream timeout"}
        }))
        .unwrap();
        assert_eq!(nested.into_result().unwrap_err(), "upstream timeout");

        let nested_ok: ResponseData = serde_json::from_value(json!({
            "result": {"success": true, "result": {"content": []}}
        }))
        .unwrap();
        assert_eq!(nested_ok.into_result().unwrap(), json!({"content": []}));
    }

    #[test]
    fn test_master_tools_with_context_mappings() {
        let text = r#"{"type":"master_tools","data":{
            "servers":{"mail":[{"name":"send","description":"Send mail"}],"calendar":[]},
            "context_mappings":{"work":["mail","calendar"]}}}"#;
        let Payload::MasterTools(data) = Envelope::decode(text).unwrap().payload else {
            panic!("expected master_tools");
        };
        assert_eq!(data.servers.len(), 2);
        assert_eq!(data.servers["mail"][0].name, "send");
        assert_eq!(data.context_mappings.unwrap()["work"], vec!["mail", "calendar"]);
    }

    #[test]
    fn test_encode_master_tool_call() {
        let env = Envelope::new(
            "abc",
            Payload::MasterToolCall(MasterToolCallData {
                server: "mail".into(),
                tool: "send".into(),
                arguments: json!({"to": "ops"}),
            }),
        );
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.id, "abc");
        assert_eq!(decoded.payload, env.payload);
    }
}
