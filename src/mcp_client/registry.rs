//! Tool registry: named clients and dispatch by server name.
//!
//! Provides:
//! - Lookup of a client by server name
//! - Fully-qualified tool names (`server_tool`) and their parsing
//! - The seams the tunnel drives: [`ToolProvider`] for the local catalog and
//!   [`SlaveRegistry`] for re-published master tools

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::contract::TransportClient;
use super::errors::McpError;
use super::types::McpToolDefinition;

// ─── Collaborator Traits ─────────────────────────────────────────────────────

/// Source of the tools this node offers to its peer.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;
}

/// Registration hooks for clients that proxy to the master.
pub trait SlaveRegistry: Send + Sync {
    fn register_slave_client(&self, name: &str, client: Arc<dyn TransportClient>);

    fn unregister_slave_client(&self, name: &str);

    /// Context name → server names to route to.
    fn set_master_context_mappings(&self, mappings: HashMap<String, Vec<String>>);
}

// ─── Tool Names ──────────────────────────────────────────────────────────────

/// Joins a server name and a tool name.
pub const TOOL_NAME_SEPARATOR: char = '_';

/// Join a server and tool into `server_tool`.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_NAME_SEPARATOR}{tool}")
}

/// Split a qualified name against the known server names.
///
/// Server names may themselves contain the separator, so the longest matching
/// server wins. E.g., with servers `my` and `my_files`, `"my_files_read"` →
/// `("my_files", "read")`.
pub fn split_tool_name<'a, S: AsRef<str>>(
    name: &'a str,
    servers: &[S],
) -> Option<(&'a str, &'a str)> {
    servers
        .iter()
        .map(AsRef::<str>::as_ref)
        .filter(|server| !server.is_empty())
        .filter_map(|server| {
            let tool = name.strip_prefix(server)?.strip_prefix(TOOL_NAME_SEPARATOR)?;
            (!tool.is_empty()).then(|| (&name[..server.len()], tool))
        })
        .max_by_key(|(server, _)| server.len())
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Where a registered client came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOrigin {
    /// Configured on this node.
    Local,
    /// Re-published from the master through the tunnel.
    Master,
}

struct Entry {
    client: Arc<dyn TransportClient>,
    origin: ClientOrigin,
}

/// Named clients, local and master-proxied.
#[derive(Default)]
pub struct ToolRegistry {
    clients: RwLock<HashMap<String, Entry>>,
    context_mappings: RwLock<HashMap<String, Vec<String>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locally configured client, replacing any previous one.
    pub fn register(&self, name: &str, client: Arc<dyn TransportClient>) {
        self.insert(name, client, ClientOrigin::Local);
    }

    /// Remove a client. Returns it so the caller can close it.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn TransportClient>> {
        self.clients.write().remove(name).map(|e| e.client)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TransportClient>> {
        self.clients.read().get(name).map(|e| e.client.clone())
    }

    pub fn origin(&self, name: &str) -> Option<ClientOrigin> {
        self.clients.read().get(name).map(|e| e.origin)
    }

    /// All registered server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names registered with the given origin, sorted.
    pub fn server_names_from(&self, origin: ClientOrigin) -> Vec<String> {
        let mut names: Vec<String> = self
            .clients
            .read()
            .iter()
            .filter(|(_, e)| e.origin == origin)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn context_mappings(&self) -> HashMap<String, Vec<String>> {
        self.context_mappings.read().clone()
    }

    /// Servers routed for a context, or an empty list if the context is unmapped.
    pub fn servers_for_context(&self, context: &str) -> Vec<String> {
        self.context_mappings
            .read()
            .get(context)
            .cloned()
            .unwrap_or_default()
    }

    /// Call `tool` on the client registered as `server`.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let client = self.get(server).ok_or_else(|| McpError::UnknownServer {
            name: server.to_string(),
        })?;
        client.call_tool(tool, arguments).await
    }

    fn insert(&self, name: &str, client: Arc<dyn TransportClient>, origin: ClientOrigin) {
        let previous = self
            .clients
            .write()
            .insert(name.to_string(), Entry { client, origin });
        if previous.is_some() {
            tracing::debug!(server = name, ?origin, "replaced registered client");
        } else {
            tracing::info!(server = name, ?origin, "registered client");
        }
    }

    /// Snapshot of local clients, sorted by name.
    fn local_clients(&self) -> Vec<(String, Arc<dyn TransportClient>)> {
        let mut clients: Vec<_> = self
            .clients
            .read()
            .iter()
            .filter(|(_, e)| e.origin == ClientOrigin::Local)
            .map(|(name, e)| (name.clone(), e.client.clone()))
            .collect();
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        clients
    }
}

impl SlaveRegistry for ToolRegistry {
    /// A master server never replaces a local one of the same name.
    fn register_slave_client(&self, name: &str, client: Arc<dyn TransportClient>) {
        if self.origin(name) == Some(ClientOrigin::Local) {
            tracing::warn!(server = name, "master server shadows a local server, keeping the local one");
            return;
        }
        self.insert(name, client, ClientOrigin::Master);
    }

    fn unregister_slave_client(&self, name: &str) {
        let mut clients = self.clients.write();
        if clients.get(name).is_some_and(|e| e.origin == ClientOrigin::Master) {
            clients.remove(name);
            tracing::info!(server = name, "unregistered master proxy client");
        }
    }

    fn set_master_context_mappings(&self, mappings: HashMap<String, Vec<String>>) {
        tracing::debug!(contexts = mappings.len(), "updated master context mappings");
        *self.context_mappings.write() = mappings;
    }
}

/// The local catalog, as offered to the master.
///
/// Tools are exposed as `server_tool`. Master-proxied clients are left out so
/// the master never sees its own tools announced back.
#[async_trait]
impl ToolProvider for ToolRegistry {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut all = Vec::new();
        for (server, client) in self.local_clients() {
            if !client.is_connected() {
                continue;
            }
            match client.list_tools().await {
                Ok(tools) => {
                    all.extend(tools.into_iter().map(|mut tool| {
                        tool.name = qualify(&server, &tool.name);
                        tool
                    }));
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "skipping server in catalog");
                }
            }
        }
        Ok(all)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let servers = self.server_names_from(ClientOrigin::Local);
        let (server, tool) =
            split_tool_name(name, servers.as_slice()).ok_or_else(|| McpError::UnknownTool {
                name: name.to_string(),
            })?;
        self.call(server, tool, arguments).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mcp_client::contract::ClientState;

    struct StaticClient {
        name: String,
        tools: Vec<&'static str>,
        state: ClientState,
    }

    impl StaticClient {
        fn arc(name: &str, tools: Vec<&'static str>) -> Arc<dyn TransportClient> {
            Arc::new(Self {
                name: name.to_string(),
                tools,
                state: ClientState::new(),
            })
        }
    }

    #[async_trait]
    impl TransportClient for StaticClient {
        fn name(&self) -> &str {
            &self.name
        }
        fn state(&self) -> &ClientState {
            &self.state
        }
        fn default_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        async fn list_tools_with_timeout(
            &self,
            _timeout: Duration,
        ) -> Result<Vec<McpToolDefinition>, McpError> {
            Ok(self.tools.iter().map(|t| McpToolDefinition::new(t, "")).collect())
        }
        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
            if !self.tools.iter().any(|t| *t == name) {
                return Err(McpError::UnknownTool { name: name.into() });
            }
            Ok(serde_json::json!({ "server": self.name, "tool": name, "args": arguments }))
        }
        async fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
            Ok(vec![])
        }
        async fn get_prompt(&self, _name: &str, _arguments: Value) -> Result<Value, McpError> {
            Ok(Value::Null)
        }
        async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
            Ok(vec![])
        }
        async fn read_resource(&self, _uri: &str) -> Result<Value, McpError> {
            Ok(Value::Null)
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    #[test]
    fn test_split_tool_name() {
        let servers = ["files", "my", "my_files"];
        assert_eq!(split_tool_name("files_list_dir", &servers[..]), Some(("files", "list_dir")));
        assert_eq!(split_tool_name("my_files_read", &servers[..]), Some(("my_files", "read")));
        assert_eq!(split_tool_name("my_read", &servers[..]), Some(("my", "read")));
        assert_eq!(split_tool_name("files_", &servers[..]), None);
        assert_eq!(split_tool_name("filesread", &servers[..]), None);
        assert_eq!(split_tool_name("other_read", &servers[..]), None);
        assert_eq!(qualify("files", "read"), "files_read");
    }

    #[tokio::test]
    async fn test_provider_lists_only_local_tools() {
        let registry = ToolRegistry::new();
        registry.register("files", StaticClient::arc("files", vec!["read", "write"]));
        registry.register_slave_client("upstream", StaticClient::arc("upstream", vec!["mail"]));

        let tools = ToolProvider::list_tools(&registry).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["files_read", "files_write"]);
        assert_eq!(registry.server_names(), vec!["files", "upstream"]);
        assert_eq!(registry.server_names_from(ClientOrigin::Master), vec!["upstream"]);
    }

    #[tokio::test]
    async fn test_provider_routes_by_prefix() {
        let registry = ToolRegistry::new();
        registry.register("files", StaticClient::arc("files", vec!["read"]));
        registry.register_slave_client("upstream", StaticClient::arc("upstream", vec!["mail"]));

        let result = ToolProvider::call_tool(&registry, "files_read", serde_json::json!({"p": 1}))
            .await
            .unwrap();
        assert_eq!(result["tool"], "read");
        assert_eq!(result["args"]["p"], 1);

        let err = ToolProvider::call_tool(&registry, "upstream_mail", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));

        let err = ToolProvider::call_tool(&registry, "missing_read", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }));

        // Direct dispatch reaches master-proxied clients too.
        let result = registry.call("upstream", "mail", Value::Null).await.unwrap();
        assert_eq!(result["server"], "upstream");
    }

    #[test]
    fn test_unregister_slave_leaves_local_clients() {
        let registry = ToolRegistry::new();
        registry.register("files", StaticClient::arc("files", vec![]));
        registry.unregister_slave_client("files");
        assert!(registry.get("files").is_some());

        registry.register_slave_client("upstream", StaticClient::arc("upstream", vec![]));
        registry.unregister_slave_client("upstream");
        assert!(registry.get("upstream").is_none());
    }

    #[test]
    fn test_master_server_never_replaces_local() {
        let registry = ToolRegistry::new();
        let local = StaticClient::arc("files", vec!["read"]);
        registry.register("files", local.clone());

        registry.register_slave_client("files", StaticClient::arc("files", vec!["mail"]));
        assert_eq!(registry.origin("files"), Some(ClientOrigin::Local));
        assert!(Arc::ptr_eq(&registry.get("files").unwrap(), &local));

        registry.unregister_slave_client("files");
        assert_eq!(registry.origin("files"), Some(ClientOrigin::Local));
        assert!(Arc::ptr_eq(&registry.get("files").unwrap(), &local));
    }

    #[test]
    fn test_context_mappings() {
        let registry = ToolRegistry::new();
        assert!(registry.servers_for_context("work").is_empty());
        let mut mappings = HashMap::new();
        mappings.insert("work".to_string(), vec!["mail".to_string(), "calendar".to_string()]);
        registry.set_master_context_mappings(mappings);
        assert_eq!(registry.servers_for_context("work"), vec!["mail", "calendar"]);
    }
}
