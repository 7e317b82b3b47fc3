//! MCP client: JSON-RPC transports for tool servers.
//!
//! This module handles:
//! - The capability contract every transport implements
//! - Spawning stdio servers and speaking JSON-RPC over their pipes
//! - Streamable HTTP servers (JSON or SSE bodies, sessions, OAuth)
//! - Per-request correlation and timeouts
//! - The registry of named clients and the backend pool built on it
//!
//! The tunnel module reuses the contract and registry to re-publish tools
//! between a slave node and its master.

pub mod client;
pub mod config;
pub mod contract;
pub mod correlator;
pub mod errors;
pub mod http;
pub mod registry;
pub mod sse;
pub mod stdio;
pub mod types;

// Re-exports for convenience
pub use client::{McpClient, ServerStatus};
pub use config::{load_node_config, NodeConfig, ServerConfig, TransportKind, TunnelSettings};
pub use contract::{ClientState, TransportClient, COUNT_UNKNOWN};
pub use correlator::{Correlator, WaitOutcome};
pub use errors::McpError;
pub use http::{HttpClient, HttpOptions, RetryPolicy};
pub use registry::{SlaveRegistry, ToolProvider, ToolRegistry};
pub use stdio::{StdioClient, StdioOptions};
pub use types::McpToolDefinition;
