//! Physical connection to the master.
//!
//! The tunnel client only sees a [`WsConnection`], a boxed sink and stream of
//! WebSocket frames, so tests can hand it an in-memory socket instead of a
//! real mTLS dial.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, WebSocketStream};

use super::errors::TunnelError;
use super::tls::load_client_config;
use crate::mcp_client::TunnelSettings;

/// Timeout for the TCP + TLS + WebSocket handshake.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Path the master serves slave connections on.
const SLAVE_CONNECT_PATH: &str = "/slave/connect";

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Write and read halves of one connection.
pub struct WsConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl WsConnection {
    pub fn from_stream<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens connections to the master.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Where this dialer connects, for logs.
    fn address(&self) -> &str;

    async fn dial(&self) -> Result<WsConnection, TunnelError>;
}

// ─── TlsDialer ───────────────────────────────────────────────────────────────

/// Dials `wss://<master>/slave/connect` with a client certificate.
pub struct TlsDialer {
    master_addr: String,
    url: String,
    tls: Arc<rustls::ClientConfig>,
}

impl TlsDialer {
    pub fn new(master_addr: &str, tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            master_addr: master_addr.to_string(),
            url: format!("wss://{master_addr}{SLAVE_CONNECT_PATH}"),
            tls,
        }
    }

    /// Load certificates from the configured paths.
    pub fn from_settings(settings: &TunnelSettings) -> Result<Self, TunnelError> {
        let tls = load_client_config(&settings.cert_path, &settings.key_path, &settings.ca_path)?;
        Ok(Self::new(&settings.master_addr, tls))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    fn address(&self) -> &str {
        &self.master_addr
    }

    async fn dial(&self) -> Result<WsConnection, TunnelError> {
        let dial_error = |reason: String| TunnelError::Dial {
            addr: self.master_addr.clone(),
            reason,
        };

        let connect = tokio_tungstenite::connect_async_tls_with_config(
            self.url.as_str(),
            None,
            false,
            Some(Connector::Rustls(self.tls.clone())),
        );
        let (ws, _response) = tokio::time::timeout(DIAL_TIMEOUT, connect)
            .await
            .map_err(|_| dial_error(format!("timed out after {}s", DIAL_TIMEOUT.as_secs())))?
            .map_err(|e| dial_error(e.to_string()))?;

        tracing::debug!(url = %self.url, "WebSocket handshake complete");
        Ok(WsConnection::from_stream(ws))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[tokio::test]
    async fn test_connection_halves_carry_frames() {
        let (a, b) = tokio::io::duplex(4096);
        let mut client =
            WsConnection::from_stream(WebSocketStream::from_raw_socket(a, Role::Client, None).await);
        let mut server =
            WsConnection::from_stream(WebSocketStream::from_raw_socket(b, Role::Server, None).await);

        client.sink.send(Message::Text("ping".into())).await.unwrap();
        let frame = server.stream.next().await.unwrap().unwrap();
        assert_eq!(frame, Message::Text("ping".into()));
    }

    #[test]
    fn test_url_uses_slave_connect_path() {
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();

        let dialer = TlsDialer::new("master.internal:8443", Arc::new(tls));
        assert_eq!(dialer.url(), "wss://master.internal:8443/slave/connect");
        assert_eq!(dialer.address(), "master.internal:8443");
    }
}
