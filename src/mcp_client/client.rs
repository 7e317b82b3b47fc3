//! MCP client: the pool of configured backends.
//!
//! Creates stdio and HTTP transports on first use, registers them with the
//! shared [`ToolRegistry`] and reports per-server status.
//!
//! Every client gets a monitor task that drains its notifications. A
//! `notifications/tools/list_changed` drops the cached tool count, starts a
//! refresh and is announced on [`McpClient::catalog_changes`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::config::{ServerConfig, TransportKind};
use super::contract::TransportClient;
use super::errors::McpError;
use super::http::{HttpClient, HttpOptions};
use super::registry::ToolRegistry;
use super::stdio::{StdioClient, StdioOptions};
use crate::oauth::TokenStore;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for background refreshes started by [`McpClient::server_status`].
const STATUS_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the refresh that follows a tool list change.
const CATALOG_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Name announced on [`McpClient::catalog_changes`] after [`McpClient::reload`].
pub const CONFIG_RELOAD: &str = "config-reload";

const CATALOG_CHANGE_CAPACITY: usize = 64;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Snapshot of one configured backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub connected: bool,
    /// `-1` until the first successful tool listing.
    pub tool_count: i64,
    pub last_error: Option<String>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Named backends, created lazily from configuration.
pub struct McpClient {
    configs: RwLock<HashMap<String, ServerConfig>>,
    clients: tokio::sync::Mutex<HashMap<String, Arc<dyn TransportClient>>>,
    /// Last creation failure per server, cleared on success.
    init_errors: Mutex<HashMap<String, String>>,
    registry: Arc<ToolRegistry>,
    tokens: Option<Arc<TokenStore>>,
    working_dir: Option<PathBuf>,
    changes: broadcast::Sender<String>,
}

impl McpClient {
    pub fn new(configs: HashMap<String, ServerConfig>, registry: Arc<ToolRegistry>) -> Self {
        let (changes, _) = broadcast::channel(CATALOG_CHANGE_CAPACITY);
        Self {
            configs: RwLock::new(configs),
            clients: tokio::sync::Mutex::new(HashMap::new()),
            init_errors: Mutex::new(HashMap::new()),
            registry,
            tokens: None,
            working_dir: None,
            changes,
        }
    }

    /// Token store for backends that declare OAuth.
    pub fn with_token_store(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Working directory for stdio servers without their own `cwd`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Names of all configured servers, enabled or not, sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Server names whose tools changed, or [`CONFIG_RELOAD`].
    pub fn catalog_changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .read()
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    fn announce(&self, name: &str) {
        if self.changes.send(name.to_string()).is_err() {
            tracing::debug!(server = name, "catalog change with no subscribers");
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// The client for `name`, creating it on first use.
    ///
    /// A client that has lost its connection is replaced by a fresh one.
    pub async fn get_client(&self, name: &str) -> Result<Arc<dyn TransportClient>, McpError> {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(name) {
            if existing.is_connected() {
                return Ok(existing.clone());
            }
            tracing::info!(server = name, "replacing disconnected client");
        }

        let config = self
            .configs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;
        if !config.enabled {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' is disabled"),
            });
        }

        let client = match self.create_client(name, &config).await {
            Ok(client) => client,
            Err(e) => {
                self.init_errors.lock().insert(name.to_string(), e.to_string());
                return Err(e);
            }
        };
        self.init_errors.lock().remove(name);

        if let Some(stale) = clients.insert(name.to_string(), client.clone()) {
            close_quietly(stale.as_ref()).await;
        }
        self.registry.register(name, client.clone());
        self.monitor(name, &client);
        Ok(client)
    }

    /// Drain `client`'s notifications until it disconnects.
    fn monitor(&self, name: &str, client: &Arc<dyn TransportClient>) {
        let Some(mut notifications) = client.take_notifications() else {
            tracing::debug!(server = name, "notifications already taken, not monitoring");
            return;
        };
        let disconnected = client.disconnected();
        let weak = Arc::downgrade(client);
        let changes = self.changes.clone();
        let server = name.to_string();

        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = disconnected.cancelled() => break,
                    next = notifications.recv() => match next {
                        Some(n) => n,
                        None => break,
                    },
                };
                if notification.method != TOOLS_LIST_CHANGED {
                    tracing::debug!(server = %server, method = %notification.method, "ignoring notification");
                    continue;
                }
                let Some(client) = weak.upgrade() else {
                    break;
                };
                tracing::info!(server = %server, "tool list changed");
                client.invalidate_tool_cache();
                client.trigger_async_refresh(CATALOG_REFRESH_TIMEOUT);
                if changes.send(server.clone()).is_err() {
                    tracing::debug!(server = %server, "catalog change with no subscribers");
                }
            }
            tracing::debug!(server = %server, "notification monitor stopped");
        });
    }

    /// Create every enabled server. Returns the ones that failed to start;
    /// partial startup is fine.
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let mut errors = Vec::new();
        for name in self.enabled_names() {
            if let Err(e) = self.get_client(&name).await {
                tracing::warn!(server = %name, error = %e, "failed to start server");
                errors.push((name, e));
            }
        }
        errors
    }

    /// Close `name` and start it again from its configuration.
    pub async fn restart_server(&self, name: &str) -> Result<(), McpError> {
        if !self.configs.read().contains_key(name) {
            return Err(McpError::UnknownServer {
                name: name.to_string(),
            });
        }
        tracing::info!(server = name, "restarting server");
        self.close(name).await;
        let result = self.get_client(name).await.map(|_| ());
        self.announce(name);
        result
    }

    /// Swap in a new server configuration.
    ///
    /// Running servers that are gone or disabled are stopped and newly
    /// enabled ones started. Servers present in both keep running. Returns
    /// the ones that failed to start.
    pub async fn reload(&self, configs: HashMap<String, ServerConfig>) -> Vec<(String, McpError)> {
        let running: Vec<String> = self.clients.lock().await.keys().cloned().collect();
        for name in running {
            if !configs.get(&name).is_some_and(|c| c.enabled) {
                tracing::info!(server = %name, "stopping removed server");
                self.close(&name).await;
            }
        }
        *self.configs.write() = configs;
        self.init_errors.lock().clear();

        let mut errors = Vec::new();
        for name in self.enabled_names() {
            if self.clients.lock().await.contains_key(&name) {
                continue;
            }
            tracing::info!(server = %name, "starting new server");
            if let Err(e) = self.get_client(&name).await {
                tracing::warn!(server = %name, error = %e, "failed to start server");
                errors.push((name, e));
            }
        }

        self.announce(CONFIG_RELOAD);
        tracing::info!(failed = errors.len(), "configuration reloaded");
        errors
    }

    /// Close one server and drop it from the registry.
    pub async fn close(&self, name: &str) {
        let removed = self.clients.lock().await.remove(name);
        if let Some(client) = removed {
            self.registry.unregister(name);
            close_quietly(client.as_ref()).await;
        }
    }

    /// Close every server.
    pub async fn shutdown_all(&self) {
        let drained: Vec<_> = self.clients.lock().await.drain().collect();
        for (name, client) in drained {
            self.registry.unregister(&name);
            close_quietly(client.as_ref()).await;
        }
        tracing::info!("all MCP servers shut down");
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call `tool` on `server`, starting the server if needed.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let client = self.get_client(server).await?;
        client.call_tool(tool, arguments).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Status of every enabled server, sorted by name.
    ///
    /// Servers whose tool count is still unknown get a background refresh so
    /// the next call reports a real number.
    pub async fn server_status(&self) -> Vec<ServerStatus> {
        let names = self.enabled_names();
        let clients = self.clients.lock().await;
        let init_errors = self.init_errors.lock().clone();

        names
            .into_iter()
            .map(|name| match clients.get(&name) {
                Some(client) => {
                    let tool_count = client.cached_tool_count();
                    if tool_count < 0 && client.is_connected() {
                        client.clone().trigger_async_refresh(STATUS_REFRESH_TIMEOUT);
                    }
                    ServerStatus {
                        connected: client.is_connected(),
                        tool_count,
                        last_error: client.last_error(),
                        name,
                    }
                }
                None => ServerStatus {
                    connected: false,
                    tool_count: super::contract::COUNT_UNKNOWN,
                    last_error: init_errors.get(&name).cloned(),
                    name,
                },
            })
            .collect()
    }

    pub async fn running_server_count(&self) -> usize {
        self.clients
            .lock()
            .await
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    async fn create_client(
        &self,
        name: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn TransportClient>, McpError> {
        config.validate(name)?;
        match config.transport {
            TransportKind::Stdio => {
                let mut options = StdioOptions::new(&config.command).args(config.args.clone());
                options.env = config.env.clone();
                options.cwd = config.cwd.clone().or_else(|| self.working_dir.clone());
                if let Some(timeout) = config.request_timeout() {
                    options.request_timeout = timeout;
                }
                Ok(Arc::new(StdioClient::spawn(name, options).await?))
            }
            TransportKind::Http => {
                let url = config.url.as_deref().unwrap_or_default();
                let mut options = HttpOptions::new(url);
                options.headers = config.headers.clone();
                if let Some(timeout) = config.request_timeout() {
                    options.request_timeout = timeout;
                }
                if config.oauth.is_some() {
                    let tokens = self.tokens.clone().ok_or_else(|| McpError::ConfigError {
                        reason: format!("server '{name}' uses OAuth but no token store is set"),
                    })?;
                    options = options.with_oauth(tokens);
                }
                Ok(Arc::new(HttpClient::connect(name, options).await?))
            }
        }
    }
}

async fn close_quietly(client: &dyn TransportClient) {
    if let Err(e) = client.close().await {
        tracing::debug!(server = client.name(), error = %e, "error while closing client");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
