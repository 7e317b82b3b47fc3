//! Local stand-in for one of the master's servers.
//!
//! A `MasterProxyClient` is registered under the master server's name and
//! forwards every call back through the tunnel as `master_tool_call`.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::mcp_client::contract::ClientState;
use crate::mcp_client::{McpError, McpToolDefinition, TransportClient};

/// The tunnel side of a proxy: sends the call and waits for the answer.
#[async_trait]
pub trait MasterCaller: Send + Sync + 'static {
    async fn call_master_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError>;

    fn is_connected(&self) -> bool;

    fn call_timeout(&self) -> Duration;
}

pub struct MasterProxyClient {
    server: String,
    tools: RwLock<Vec<McpToolDefinition>>,
    caller: Weak<dyn MasterCaller>,
    state: ClientState,
}

impl MasterProxyClient {
    pub fn new(server: &str, tools: Vec<McpToolDefinition>, caller: Weak<dyn MasterCaller>) -> Self {
        let state = ClientState::new();
        state.record_tools(tools.len());
        state.record_prompts(0);
        state.record_resources(0);
        Self {
            server: server.to_string(),
            tools: RwLock::new(tools),
            caller,
            state,
        }
    }

    /// Replace the announced tool list.
    pub fn update_tools(&self, tools: Vec<McpToolDefinition>) {
        self.state.record_tools(tools.len());
        *self.tools.write() = tools;
    }

    /// The tools as last announced by the master.
    pub fn announced_tools(&self) -> Vec<McpToolDefinition> {
        self.tools.read().clone()
    }

    fn is_closed(&self) -> bool {
        self.state.disconnected().is_cancelled()
    }

    fn unsupported(&self, operation: &str) -> McpError {
        McpError::Unsupported {
            server: self.server.clone(),
            operation: operation.to_string(),
        }
    }
}

#[async_trait]
impl TransportClient for MasterProxyClient {
    fn name(&self) -> &str {
        &self.server
    }

    fn state(&self) -> &ClientState {
        &self.state
    }

    fn default_timeout(&self) -> Duration {
        self.caller
            .upgrade()
            .map(|c| c.call_timeout())
            .unwrap_or(Duration::from_secs(60))
    }

    async fn list_tools_with_timeout(
        &self,
        _timeout: Duration,
    ) -> Result<Vec<McpToolDefinition>, McpError> {
        let tools = self.tools.read().clone();
        self.state.record_tools(tools.len());
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let not_connected = || McpError::NotConnected {
            server: self.server.clone(),
        };
        if self.is_closed() {
            return Err(not_connected());
        }
        let caller = self.caller.upgrade().ok_or_else(not_connected)?;
        caller.call_master_tool(&self.server, name, arguments).await
    }

    async fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
        Ok(Vec::new())
    }

    async fn get_prompt(&self, _name: &str, _arguments: Value) -> Result<Value, McpError> {
        Err(self.unsupported("prompts/get"))
    }

    async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        Ok(Vec::new())
    }

    async fn read_resource(&self, _uri: &str) -> Result<Value, McpError> {
        Err(self.unsupported("resources/read"))
    }

    fn is_connected(&self) -> bool {
        !self.is_closed() && self.caller.upgrade().is_some_and(|c| c.is_connected())
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.state.mark_disconnected() {
            tracing::debug!(server = %self.server, "closed master proxy client");
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
