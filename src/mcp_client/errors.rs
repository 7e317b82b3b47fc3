//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The connection died while the request was in flight.
    #[error("connection to '{server}' closed")]
    ConnectionClosed {
        server: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// No client registered under this server name.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// A request timed out waiting for its response.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The backend requires OAuth and rejected our credentials.
    #[error("server '{server}' requires authentication")]
    AuthRequired {
        server: String,
    },

    /// HTTP endpoint answered with a non-success status.
    #[error("HTTP {status} from '{server}': {body}")]
    HttpStatus {
        server: String,
        status: u16,
        body: String,
    },

    /// Network-level failure (refused, reset, timeout, EOF, DNS).
    #[error("network error for server '{server}': {reason}")]
    Network {
        server: String,
        reason: String,
    },

    /// A response body could not be decoded.
    #[error("failed to decode response from '{server}': {reason}")]
    Decode {
        server: String,
        reason: String,
    },

    /// Retry budget used up; carries the last failure.
    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<McpError>,
    },

    /// The client is closed or was never connected.
    #[error("server '{server}' is not connected")]
    NotConnected {
        server: String,
    },

    /// The transport does not implement this operation.
    #[error("'{operation}' is not supported by '{server}'")]
    Unsupported {
        server: String,
        operation: String,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// Token store failure while preparing an authenticated request.
    #[error(transparent)]
    OAuth(#[from] crate::oauth::OAuthError),
}

impl McpError {
    /// Whether the HTTP transport may retry after this failure.
    ///
    /// Network-class failures and 5xx statuses are retryable. Protocol
    /// errors, 4xx, auth and decode failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            McpError::Network { .. } => true,
            McpError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
