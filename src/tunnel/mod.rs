//! Slave→master tunnel over mutual-TLS WebSocket.
//!
//! The slave dials out, registers its local catalog and then serves the
//! master's `tool_call`s while re-publishing the master's own servers locally
//! as [`MasterProxyClient`]s.

pub mod backoff;
pub mod client;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod lifecycle;
pub mod proxy;
pub mod tls;

pub use backoff::Backoff;
pub use client::{TunnelClient, TunnelOptions};
pub use connection::{Dialer, TlsDialer, WsConnection};
pub use envelope::{Envelope, Payload};
pub use errors::TunnelError;
pub use lifecycle::{AdminCommand, LifecycleHook, ProcessExitHook};
pub use proxy::{MasterCaller, MasterProxyClient};
