//! Response body decoding for the streaming HTTP transport.
//!
//! A server may answer a POST with plain JSON or with an event stream. Both
//! forms decode to the same `JsonRpcResponse`.

use super::types::JsonRpcResponse;

// ─── Detection ───────────────────────────────────────────────────────────────

/// Whether a body should be treated as event-stream framed.
///
/// The content type wins; bodies that start with an SSE field are also
/// accepted because some servers mislabel them.
pub fn is_event_stream(content_type: Option<&str>, body: &str) -> bool {
    if content_type.is_some_and(|ct| ct.contains("text/event-stream")) {
        return true;
    }
    let head = body.trim_start();
    head.starts_with("event:") || head.starts_with("data:")
}

// ─── Extraction ──────────────────────────────────────────────────────────────

/// Concatenate the payload of every `data:` line.
///
/// Returns `None` when the body has no data lines at all.
pub fn extract_data(body: &str) -> Option<String> {
    let mut payload = String::new();
    let mut found = false;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            found = true;
            payload.push_str(data.trim());
        }
    }

    found.then_some(payload)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Decode a response body into a JSON-RPC response.
pub fn decode_body(content_type: Option<&str>, body: &str) -> Result<JsonRpcResponse, String> {
    let json = if is_event_stream(content_type, body) {
        extract_data(body).unwrap_or_else(|| body.to_string())
    } else {
        body.to_string()
    };

    serde_json::from_str(&json).map_err(|e| format!("invalid JSON-RPC response: {e}"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
