use thiserror::Error;

use crate::mcp_client::McpError;

/// Errors from the slave→master tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS setup failed: {reason}")]
    Tls { reason: String },

    #[error("failed to dial master at {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("invalid '{kind}' envelope: {reason}")]
    Envelope { kind: String, reason: String },

    #[error("not connected to master")]
    NotConnected,

    #[error("I/O error on '{path}': {reason}")]
    Io { path: String, reason: String },
}

impl TunnelError {
    pub(crate) fn envelope(kind: &str, reason: impl ToString) -> Self {
        Self::Envelope {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<TunnelError> for McpError {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::NotConnected => McpError::NotConnected {
                server: "master".into(),
            },
            other => McpError::TransportError {
                server: "master".into(),
                reason: other.to_string(),
            },
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
