//! JSON-RPC over stdio transport.
//!
//! Spawns an MCP server as a child process and speaks line-delimited JSON-RPC
//! over its stdin/stdout:
//! - the `initialize` handshake runs inline before the reader task starts
//! - one reader task then owns stdout and routes responses and notifications
//! - process death drains every pending request with "connection closed"

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::contract::{ClientState, TransportClient};
use super::correlator::{Correlator, WaitOutcome};
use super::errors::McpError;
use super::types::{
    error_codes, initialize_params, IncomingMessage, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, McpToolDefinition, PromptsListResult, ResourcesListResult,
    ToolsListResult, STDIO_PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Search path given to every child process.
pub const CHILD_SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin:/opt/homebrew/bin";

/// Timeout for the initialize handshake.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between closing stdin and force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for requests that do not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How many trailing stderr lines are kept for diagnostics.
const STDERR_TAIL_LINES: usize = 10;

/// Request id reserved for the handshake.
const INITIALIZE_ID: u64 = 0;

// ─── Spawn Options ───────────────────────────────────────────────────────────

/// What to run and how.
#[derive(Debug, Clone)]
pub struct StdioOptions {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl StdioOptions {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

// ─── StdioClient ─────────────────────────────────────────────────────────────

/// A running MCP server process.
pub struct StdioClient {
    inner: Arc<StdioShared>,
    request_timeout: Duration,
}

/// State shared with the reader task.
struct StdioShared {
    name: String,
    writer: tokio::sync::Mutex<Option<ChildStdin>>,
    process: Mutex<Option<Child>>,
    pending: Correlator<u64, JsonRpcResponse>,
    next_id: AtomicU64,
    connected: AtomicBool,
    stderr_tail: Mutex<VecDeque<String>>,
    state: ClientState,
}

impl StdioClient {
    /// Spawn the process and complete the `initialize` handshake.
    pub async fn spawn(name: &str, options: StdioOptions) -> Result<Self, McpError> {
        let mut cmd = Command::new(&options.command);
        cmd.args(&options.args);

        // Fixed search path first, then per-server overrides.
        cmd.env("PATH", CHILD_SEARCH_PATH);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{}: {e}", options.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::info!(
            server = name,
            command = %options.command,
            pid = child.id(),
            "spawned MCP server"
        );

        let inner = Arc::new(StdioShared {
            name: name.to_string(),
            writer: tokio::sync::Mutex::new(Some(stdin)),
            process: Mutex::new(Some(child)),
            pending: Correlator::new(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            stderr_tail: Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)),
            state: ClientState::new(),
        });

        if let Some(stderr) = stderr {
            tokio::spawn(capture_stderr(inner.clone(), stderr));
        }

        let mut reader = BufReader::new(stdout);
        let handshake =
            tokio::time::timeout(INIT_TIMEOUT, inner.initialize(&mut reader)).await;

        let failure = match handshake {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "initialization timed out after {}s",
                INIT_TIMEOUT.as_secs()
            )),
        };

        if let Some(reason) = failure {
            // Give the stderr task a moment to collect the crash output.
            tokio::time::sleep(Duration::from_millis(100)).await;
            let stderr_ctx = inner.stderr_output();
            inner.kill().await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{reason}{}", format_stderr_suffix(&stderr_ctx)),
            });
        }

        inner.connected.store(true, Ordering::Release);
        tokio::spawn(read_loop(inner.clone(), reader));

        let notify = JsonRpcNotification::new("notifications/initialized", None);
        inner.write_line(&notify).await?;

        Ok(Self {
            inner,
            request_timeout: options.request_timeout,
        })
    }

    /// Send a request and wait for its response, or until `timeout` elapses.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        self.inner.request(method, params, timeout).await
    }

    /// Last lines the process wrote to stderr, oldest first.
    pub fn stderr_output(&self) -> String {
        self.inner.stderr_output()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn notification_overflow_count(&self) -> u64 {
        self.inner.state.notifications().overflow_count()
    }
}

impl StdioShared {
    async fn initialize(
        &self,
        reader: &mut BufReader<ChildStdout>,
    ) -> Result<(), McpError> {
        let req = JsonRpcRequest::new(
            INITIALIZE_ID,
            "initialize",
            Some(initialize_params(STDIO_PROTOCOL_VERSION)),
        );
        self.write_line(&req).await?;

        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;
            if bytes_read == 0 {
                return Err(self.transport_error("server stdout closed during initialize".into()));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match IncomingMessage::parse(trimmed) {
                Ok(IncomingMessage::Response(resp)) if resp.id == INITIALIZE_ID => {
                    let result = extract_result(resp)?;
                    let init: InitializeResult =
                        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                            name: self.name.clone(),
                            reason: format!("failed to parse initialize response: {e}"),
                        })?;
                    tracing::debug!(
                        server = %self.name,
                        protocol = ?init.protocol_version,
                        peer = ?init.server_info.as_ref().and_then(|s| s.name.clone()),
                        "initialize handshake complete"
                    );
                    return Ok(());
                }
                Ok(IncomingMessage::Notification(n)) => {
                    self.state.notifications().push(n);
                }
                Ok(_) => {}
                Err(_) => {
                    // Not JSON-RPC; probably log output on stdout.
                    tracing::debug!(server = %self.name, line = trimmed, "skipping non-JSON line");
                }
            }
        }
    }

    async fn request(
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

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self
            .pending
            .register(id)
            .ok_or_else(|| self.transport_error(format!("request id {id} already pending")))?;

        let req = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.write_line(&req).await {
            self.pending.remove(&id);
            return Err(e);
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

    async fn write_line<T: serde::Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| McpError::NotConnected {
            server: self.name.clone(),
        })?;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.name.clone(),
            reason,
        }
    }

    fn is_alive(&self) -> bool {
        let mut process = self.process.lock();
        match process.as_mut().map(|child| child.try_wait()) {
            Some(Ok(None)) => true,
            _ => false,
        }
    }

    fn stderr_output(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Close stdin, wait for a cooperative exit, then force-kill.
    async fn shutdown(&self) {
        self.connected.store(false, Ordering::Release);
        // Dropping stdin is the exit signal.
        self.writer.lock().await.take();

        let child = self.process.lock().take();
        let Some(mut child) = child else {
            return;
        };

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.name, %status, "MCP server exited");
            }
            _ => {
                tracing::warn!(server = %self.name, "MCP server did not exit, killing");
                let _ = child.kill().await;
            }
        }
    }

    async fn kill(&self) {
        self.connected.store(false, Ordering::Release);
        self.writer.lock().await.take();
        let child = self.process.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn read_loop(shared: Arc<StdioShared>, mut reader: BufReader<ChildStdout>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %shared.name, error = %e, "stdout read failed");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match IncomingMessage::parse(trimmed) {
            Ok(IncomingMessage::Response(resp)) => {
                let id = resp.id;
                if !shared.pending.deliver(&id, resp) {
                    tracing::debug!(server = %shared.name, id, "response for unknown or expired request");
                }
            }
            Ok(IncomingMessage::Notification(n)) => {
                shared.state.notifications().push(n);
            }
            Ok(IncomingMessage::Request { id, method }) => {
                tracing::debug!(server = %shared.name, %method, "rejecting server-initiated request");
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": error_codes::METHOD_NOT_FOUND,
                        "message": format!("method '{method}' not supported by client"),
                    },
                });
                if let Err(e) = shared.write_line(&reply).await {
                    tracing::debug!(server = %shared.name, error = %e, "failed to reject request");
                }
            }
            Err(reason) => {
                tracing::debug!(server = %shared.name, %reason, "skipping undecodable line");
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    let drained = shared.pending.close_all();
    shared.state.set_error("server stdout closed (process may have exited)");
    shared.state.mark_disconnected();
    tracing::warn!(
        server = %shared.name,
        pending = drained,
        "MCP server stdout closed"
    );
}

async fn capture_stderr(shared: Arc<StdioShared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %shared.name, stderr = %line, "server stderr");
        let mut tail = shared.stderr_tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Decode a typed result, attributing failures to `server`.
pub(crate) fn decode_result<T: serde::de::DeserializeOwned>(
    server: &str,
    value: Value,
) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::Decode {
        server: server.to_string(),
        reason: e.to_string(),
    })
}

// ─── Contract ────────────────────────────────────────────────────────────────

#[async_trait]
impl TransportClient for StdioClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> &ClientState {
        &self.inner.state
    }

    fn default_timeout(&self) -> Duration {
        self.request_timeout
    }

    async fn list_tools_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<McpToolDefinition>, McpError> {
        let result = self.inner.request("tools/list", None, timeout).await?;
        let list: ToolsListResult = decode_result(&self.inner.name, result)?;
        self.inner.state.record_tools(list.tools.len());
        Ok(list.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.inner
            .request("tools/call", Some(params), self.request_timeout)
            .await
    }

    async fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
        let result = self
            .inner
            .request("prompts/list", None, self.request_timeout)
            .await?;
        let list: PromptsListResult = decode_result(&self.inner.name, result)?;
        self.inner.state.record_prompts(list.prompts.len());
        Ok(list.prompts)
    }

    async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.inner
            .request("prompts/get", Some(params), self.request_timeout)
            .await
    }

    async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        let result = self
            .inner
            .request("resources/list", None, self.request_timeout)
            .await?;
        let list: ResourcesListResult = decode_result(&self.inner.name, result)?;
        self.inner.state.record_resources(list.resources.len());
        Ok(list.resources)
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let params = serde_json::json!({ "uri": uri });
        self.inner
            .request("resources/read", Some(params), self.request_timeout)
            .await
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && self.inner.is_alive()
    }

    async fn close(&self) -> Result<(), McpError> {
        self.inner.shutdown().await;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny line-oriented MCP server written in POSIX sh.
    ///
    /// `initialize` → empty result; `tools/list` → a list_changed notification
    /// then two tools; `tools/call` → echoes a fixed text; `slow/never` is
    /// never answered; `crash/now` exits the process.
    const FAKE_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '%s\n' 'booting fake server'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo"},{"name":"sum"}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
    *'"method":"prompts/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
    *'"method":"crash/now"'*)
      echo 'fatal: crashing on purpose' >&2
      exit 3 ;;
  esac
done
"#;

    async fn spawn_fake() -> StdioClient {
        let options = StdioOptions::new("sh").args(["-c", FAKE_SERVER]);
        StdioClient::spawn("fake", options).await.unwrap()
    }

    #[tokio::test]
    async fn test_handshake_then_list_tools() {
        let client = spawn_fake().await;
        assert!(client.is_connected());
        assert_eq!(client.cached_tool_count(), -1);

        let mut notifications = client.take_notifications().unwrap();
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(client.cached_tool_count(), 2);

        let note = notifications.recv().await.unwrap();
        assert_eq!(note.method, "notifications/tools/list_changed");

        client.invalidate_tool_cache();
        assert_eq!(client.cached_tool_count(), -1);

        client.close().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let client = Arc::new(spawn_fake().await);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = client.clone();
            handles.push(tokio::spawn(async move {
                c.call_tool("echo", serde_json::json!({})).await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result["content"][0]["text"], "pong");
        }
        assert_eq!(client.pending_requests(), 0);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_protocol_error_is_returned_verbatim() {
        let client = spawn_fake().await;
        let err = client.list_prompts().await.unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
        assert_eq!(client.cached_prompt_count(), -1);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_cleans_up_pending_entry() {
        let client = spawn_fake().await;
        let err = client
            .request_with_timeout("slow/never", None, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 200, .. }));
        assert_eq!(client.pending_requests(), 0);

        // The client stays usable after a timeout.
        assert!(client.call_tool("echo", serde_json::json!({})).await.is_ok());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_death_closes_pending_requests() {
        let client = spawn_fake().await;
        let disconnected = client.disconnected();

        let err = client
            .request_with_timeout("crash/now", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));

        tokio::time::timeout(Duration::from_secs(5), disconnected.cancelled())
            .await
            .unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.pending_requests(), 0);
        assert!(client.last_error().is_some());

        // Let the stderr task drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.stderr_output().contains("crashing on purpose"));

        let err = client.call_tool("echo", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let options = StdioOptions::new("definitely-not-a-real-binary-xyz");
        let err = StdioClient::spawn("missing", options).await.err().unwrap();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_init_failure_includes_stderr() {
        let options = StdioOptions::new("sh").args(["-c", "echo 'missing module' >&2; exit 1"]);
        let err = StdioClient::spawn("broken", options).await.err().unwrap();
        match err {
            McpError::InitFailed { name, reason } => {
                assert_eq!(name, "broken");
                assert!(reason.contains("missing module"), "reason: {reason}");
            }
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }
}
