//! Streamable HTTP transport.
//!
//! Each JSON-RPC request is one POST to the server's endpoint. Responses may
//! come back as plain JSON or as an event stream; see [`super::sse`]. The
//! session id handed out by `initialize` is echoed on every later request,
//! and an OAuth bearer token is attached when the backend requires one.
//!
//! Decoded replies go through the same [`Correlator`] the other transports
//! use, so the caller's timeout, connection close and stray responses are
//! handled in one place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde_json::Value;

use super::contract::{ClientState, TransportClient};
use super::correlator::{Correlator, WaitOutcome};
use super::errors::McpError;
use super::sse;
use super::stdio::{decode_result, extract_result};
use super::types::{
    initialize_params, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    McpToolDefinition,
    PromptsListResult, ResourcesListResult, ToolsListResult, HTTP_PROTOCOL_VERSION,
};
use crate::oauth::TokenStore;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header carrying the session id, in both directions.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

const PROTOCOL_HEADER: &str = "MCP-Protocol-Version";

const ACCEPT: &str = "application/json, text/event-stream";

/// Connection establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

// ─── Retry Policy ────────────────────────────────────────────────────────────

/// Bounded exponential retry for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, doubled after each.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpOptions {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// When set, requests carry the token stored under the server's name.
    pub tokens: Option<Arc<TokenStore>>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl HttpOptions {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            headers: HashMap::new(),
            tokens: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_oauth(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

// ─── HttpClient ──────────────────────────────────────────────────────────────

/// MCP client for a remote streamable-HTTP server.
pub struct HttpClient {
    name: String,
    endpoint: url::Url,
    http: reqwest::Client,
    headers: HashMap<String, String>,
    tokens: Option<Arc<TokenStore>>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
    pending: Correlator<u64, JsonRpcResponse>,
    connected: AtomicBool,
    request_timeout: Duration,
    retry: RetryPolicy,
    state: ClientState,
}

/// A successful POST, before JSON-RPC decoding.
struct RawReply {
    status: StatusCode,
    content_type: Option<String>,
    body: String,
}

impl HttpClient {
    /// Build the client and run the `initialize` handshake.
    pub async fn connect(name: &str, options: HttpOptions) -> Result<Self, McpError> {
        let endpoint = url::Url::parse(&options.url).map_err(|e| McpError::ConfigError {
            reason: format!("invalid URL for server '{name}': {e}"),
        })?;

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(options.request_timeout)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .build()
            .map_err(|e| McpError::InitFailed {
                name: name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let client = Self {
            name: name.to_string(),
            endpoint,
            http,
            headers: options.headers,
            tokens: options.tokens,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
            pending: Correlator::new(),
            connected: AtomicBool::new(false),
            request_timeout: options.request_timeout,
            retry: options.retry,
            state: ClientState::new(),
        };

        client.initialize().await?;
        client.connected.store(true, Ordering::Release);
        tracing::info!(
            server = name,
            url = %client.endpoint,
            session = client.session_id().is_some(),
            "connected to HTTP MCP server"
        );
        Ok(client)
    }

    /// Session id captured from `initialize`, if the server issued one.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// Requests still waiting for their reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Whether this backend sends OAuth bearer tokens.
    pub fn requires_auth(&self) -> bool {
        self.tokens.is_some()
    }

    /// Whether a usable token is on hand for this backend.
    pub fn has_valid_auth(&self) -> bool {
        match &self.tokens {
            Some(tokens) => tokens.has_valid_token(&self.name),
            None => true,
        }
    }

    /// Send a request with retry, waiting at most `timeout` per attempt.
    ///
    /// A timeout is final; only network-class failures and 5xx are retried.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(McpError::NotConnected {
                server: self.name.clone(),
            });
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.send_once(method, params.clone(), timeout).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if matches!(
                err,
                McpError::Network { .. } | McpError::HttpStatus { .. } | McpError::AuthRequired { .. }
            ) {
                self.state.set_error(&err.to_string());
            }

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt > self.retry.max_retries {
                return Err(McpError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                server = %self.name,
                method,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "HTTP request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn initialize(&self) -> Result<(), McpError> {
        let req = JsonRpcRequest::new(
            0,
            "initialize",
            Some(initialize_params(HTTP_PROTOCOL_VERSION)),
        );
        let (reply, session) = self.post(&req).await?;
        if let Some(session) = session {
            tracing::debug!(server = %self.name, session = %session, "captured session id");
            *self.session_id.write() = Some(session);
        }

        let resp = sse::decode_body(reply.content_type.as_deref(), &reply.body).map_err(|reason| {
            McpError::InitFailed {
                name: self.name.clone(),
                reason,
            }
        })?;
        let result = extract_result(resp).map_err(|e| McpError::InitFailed {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        tracing::debug!(server = %self.name, protocol = ?init.protocol_version, "initialize complete");

        let initialized = JsonRpcNotification::new("notifications/initialized", None);
        if let Err(e) = self.post(&initialized).await {
            tracing::debug!(server = %self.name, error = %e, "initialized notification failed");
        }
        Ok(())
    }

    async fn send_once(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id).ok_or_else(|| McpError::TransportError {
            server: self.name.clone(),
            reason: format!("request id {id} already pending"),
        })?;
        let req = JsonRpcRequest::new(id, method, params);

        let reply = match tokio::time::timeout(timeout, self.exchange(&req)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.pending.remove(&id);
                return Err(e);
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let Some(resp) = reply else {
            // 202 with an empty body: accepted, nothing to return.
            self.pending.remove(&id);
            return Ok(Value::Null);
        };
        let answered = resp.id;
        if !self.pending.deliver(&answered, resp) {
            tracing::debug!(server = %self.name, id = answered, "response for unknown or expired request");
        }
        if answered != id {
            self.pending.remove(&id);
            return Err(McpError::Decode {
                server: self.name.clone(),
                reason: format!("response id {answered} does not match request id {id}"),
            });
        }

        match self.pending.wait(&id, rx, timeout).await {
            WaitOutcome::Delivered(resp) => extract_result(resp),
            WaitOutcome::TimedOut => Err(McpError::Timeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            WaitOutcome::Closed => Err(McpError::ConnectionClosed {
                server: self.name.clone(),
            }),
        }
    }

    /// POST a request and decode its reply. `None` for an empty 202.
    async fn exchange(&self, req: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>, McpError> {
        let (reply, _) = self.post(req).await?;
        if reply.status == StatusCode::ACCEPTED && reply.body.trim().is_empty() {
            return Ok(None);
        }
        sse::decode_body(reply.content_type.as_deref(), &reply.body)
            .map(Some)
            .map_err(|reason| McpError::Decode {
                server: self.name.clone(),
                reason,
            })
    }

    /// POST one JSON body. Returns the reply and any session header.
    async fn post<T: serde::Serialize>(
        &self,
        body: &T,
    ) -> Result<(RawReply, Option<String>), McpError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header("Accept", ACCEPT)
            .header(PROTOCOL_HEADER, HTTP_PROTOCOL_VERSION)
            .json(body);

        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }
        if let Some(token) = self.tokens.as_ref().and_then(|t| t.get_token(&self.name)) {
            request = request.header("Authorization", token.authorization_header());
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = response.text().await.map_err(|e| McpError::Network {
            server: self.name.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        if status == StatusCode::UNAUTHORIZED && self.requires_auth() {
            return Err(McpError::AuthRequired {
                server: self.name.clone(),
            });
        }
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(McpError::HttpStatus {
                server: self.name.clone(),
                status: status.as_u16(),
                body: text,
            });
        }

        Ok((
            RawReply {
                status,
                content_type,
                body: text,
            },
            session,
        ))
    }

    fn map_send_error(&self, e: reqwest::Error) -> McpError {
        if e.is_builder() {
            return McpError::TransportError {
                server: self.name.clone(),
                reason: e.to_string(),
            };
        }
        let kind = if e.is_connect() {
            "connect"
        } else if e.is_timeout() {
            "timeout"
        } else {
            "request"
        };
        McpError::Network {
            server: self.name.clone(),
            reason: format!("{kind}: {e}"),
        }
    }
}

// ─── Contract ────────────────────────────────────────────────────────────────

#[async_trait]
impl TransportClient for HttpClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &ClientState {
        &self.state
    }

    fn default_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn list_tools_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<McpToolDefinition>, McpError> {
        let result = self.request_with_timeout("tools/list", None, timeout).await?;
        let list: ToolsListResult = decode_result(&self.name, result)?;
        self.state.record_tools(list.tools.len());
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.request_with_timeout("tools/call", Some(params), self.request_timeout)
            .await
    }

    async fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
        let result = self
            .request_with_timeout("prompts/list", None, self.request_timeout)
            .await?;
        let list: PromptsListResult = decode_result(&self.name, result)?;
        self.state.record_prompts(list.prompts.len());
        Ok(list.prompts)
    }

    async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.request_with_timeout("prompts/get", Some(params), self.request_timeout)
            .await
    }

    async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        let result = self
            .request_with_timeout("resources/list", None, self.request_timeout)
            .await?;
        let list: ResourcesListResult = decode_result(&self.name, result)?;
        self.state.record_resources(list.resources.len());
        Ok(list.resources)
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let params = serde_json::json!({ "uri": uri });
        self.request_with_timeout("resources/read", Some(params), self.request_timeout)
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), McpError> {
        self.connected.store(false, Ordering::Release);
        let drained = self.pending.close_all();
        if self.state.mark_disconnected() {
            tracing::debug!(server = %self.name, pending = drained, "closed HTTP client");
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use serde_json::json;

    use super::*;
    use crate::oauth::OAuthToken;

    const INIT_OK: &str = r#"{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2025-03-26"}}"#;

    async fn mock_initialize(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("mcp-session-id", "sess-42")
            .with_body(INIT_OK)
            .create_async()
            .await
    }

    async fn mock_initialized(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "notifications/initialized"})))
            .with_status(202)
            .create_async()
            .await
    }

    fn fast_retry(url: &str) -> HttpOptions {
        let mut options = HttpOptions::new(url);
        options.retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
        };
        options
    }

    #[test]
    fn test_retry_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_session_id_is_echoed_and_sse_decoded() {
        let mut server = mockito::Server::new_async().await;
        let _init = mock_initialize(&mut server).await;
        let _initialized = mock_initialized(&mut server).await;
        let list = server
            .mock("POST", "/mcp")
            .match_header("mcp-session-id", "sess-42")
            .match_header("accept", "application/json, text/event-stream")
            .match_body(Matcher::PartialJson(json!({"method": "tools/list"})))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[{\"name\":\"search\"}]}}\n\n")
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::connect("remote", fast_retry(&format!("{}/mcp", server.url())))
            .await
            .unwrap();
        assert_eq!(client.session_id().as_deref(), Some("sess-42"));
        assert_eq!(client.cached_tool_count(), -1);

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "search");
        assert_eq!(client.cached_tool_count(), 1);
        list.assert_async().await;
    }

    #[tokio::test]
    async fn test_bearer_token_attached() {
        let tmp = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::open(tmp.path()).unwrap());
        tokens.set_token("secure", OAuthToken::bearer("tok-1")).unwrap();

        let mut server = mockito::Server::new_async().await;
        let init = server
            .mock("POST", "/mcp")
            .match_header("authorization", "Bearer tok-1")
            .match_body(Matcher::PartialJson(json!({"method": "initialize"})))
            .with_status(200)
            .with_body(INIT_OK)
            .create_async()
            .await;
        let _initialized = mock_initialized(&mut server).await;

        let options = fast_retry(&format!("{}/mcp", server.url())).with_oauth(tokens);
        let client = HttpClient::connect("secure", options).await.unwrap();
        assert!(client.requires_auth());
        assert!(client.has_valid_auth());
        init.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_required() {
        let tmp = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::open(tmp.path()).unwrap());

        let mut server = mockito::Server::new_async().await;
        let _init = server
            .mock("POST", "/mcp")
            .with_status(401)
            .with_body("unauthorized")
            .create_async()
            .await;

        let options = fast_retry(&format!("{}/mcp", server.url())).with_oauth(tokens);
        let err = HttpClient::connect("secure", options).await.err().unwrap();
        assert!(matches!(err, McpError::AuthRequired { ref server } if server == "secure"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_up_to_cap() {
        let mut server = mockito::Server::new_async().await;
        let _init = mock_initialize(&mut server).await;
        let _initialized = mock_initialized(&mut server).await;
        let failing = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/call"})))
            .with_status(503)
            .with_body("overloaded")
            .expect(4)
            .create_async()
            .await;

        let client = HttpClient::connect("flaky", fast_retry(&format!("{}/mcp", server.url())))
            .await
            .unwrap();
        let err = client.call_tool("search", json!({})).await.unwrap_err();
        match err {
            McpError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, McpError::HttpStatus { status: 503, .. }));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert!(client.last_error().unwrap().contains("503"));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let _init = mock_initialize(&mut server).await;
        let _initialized = mock_initialized(&mut server).await;
        let rejected = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/call"})))
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::connect("strict", fast_retry(&format!("{}/mcp", server.url())))
            .await
            .unwrap();
        let err = client.call_tool("search", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::HttpStatus { status: 400, .. }));
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn test_protocol_errors_are_returned_unretried() {
        let mut server = mockito::Server::new_async().await;
        let _init = mock_initialize(&mut server).await;
        let _initialized = mock_initialized(&mut server).await;
        let call = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/call"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"missing query"}}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::connect("strict", fast_retry(&format!("{}/mcp", server.url())))
            .await
            .unwrap();
        let err = client.call_tool("search", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));
        call.assert_async().await;
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_class() {
        // Bind then drop to get a port nobody is listening on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = HttpClient::connect("down", fast_retry(&format!("http://127.0.0.1:{port}/mcp")))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let mut server = mockito::Server::new_async().await;
        let _init = mock_initialize(&mut server).await;
        let _initialized = mock_initialized(&mut server).await;

        let client = HttpClient::connect("remote", fast_retry(&format!("{}/mcp", server.url())))
            .await
            .unwrap();
        assert!(client.is_connected());
        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert!(client.disconnected().is_cancelled());
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_accepted_without_body_yields_null() {
        let mut server = mockito::Server::new_async().await;
        let _init = mock_initialize(&mut server).await;
        let _initialized = mock_initialized(&mut server).await;
        let call = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/call"})))
            .with_status(202)
            .expect(1)
            .create_async()
            .await;

        let client = HttpClient::connect("async", fast_retry(&format!("{}/mcp", server.url())))
            .await
            .unwrap();
        let result = client.call_tool("enqueue", json!({})).await.unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(client.pending_requests(), 0);
        call.assert_async().await;
    }

    #[tokio::test]
    async fn test_reply_for_another_id_is_discarded() {
        let mut server = mockito::Server::new_async().await;
        let _init = mock_initialize(&mut server).await;
        let _initialized = mock_initialized(&mut server).await;
        let _call = server
            .mock("POST", "/mcp")
            .match_body(Matcher::PartialJson(json!({"method": "tools/call"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":99,"result":{"late":true}}"#)
            .create_async()
            .await;

        let client = HttpClient::connect("remote", fast_retry(&format!("{}/mcp", server.url())))
            .await
            .unwrap();
        let err = client.call_tool("search", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Decode { .. }), "got {err:?}");
        assert_eq!(client.pending_requests(), 0);
    }

    /// Answers the handshake, then holds every other request open forever.
    async fn stalling_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(answer_handshake_only(socket));
            }
        });
        format!("http://{addr}/mcp")
    }

    async fn answer_handshake_only(mut socket: tokio::net::TcpStream) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let header_end = loop {
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
            let length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < header_end + length {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let body = String::from_utf8_lossy(&buf[header_end..header_end + length]).to_string();
            buf.drain(..header_end + length);

            let (status, reply) = if body.contains(r#""method":"initialize""#) {
                (200, INIT_OK)
            } else if body.contains("notifications/initialized") {
                (202, "")
            } else {
                std::future::pending::<()>().await;
                return;
            };
            let response = format!(
                "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{reply}",
                reply.len()
            );
            if socket.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_pending_entry() {
        let url = stalling_server().await;
        let client = HttpClient::connect("slow", fast_retry(&url)).await.unwrap();

        let err = client
            .list_tools_with_timeout(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(
            matches!(err, McpError::Timeout { ref method, timeout_ms: 200 } if method == "tools/list"),
            "got {err:?}"
        );
        assert_eq!(client.pending_requests(), 0);
        assert_eq!(client.cached_tool_count(), -1);
    }
}
