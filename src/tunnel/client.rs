//! Slave side of the master tunnel.
//!
//! One outbound mTLS WebSocket carries two call directions:
//! - `tool_call` from the master runs against the local [`ToolProvider`]
//! - `master_tool_call` from this node runs on one of the master's servers
//!
//! Local catalog changes fed to [`TunnelClient::forward_catalog_changes`] go
//! out as `tool_update`.
//!
//! Every connection generation gets its own reader and heartbeat task. A read
//! failure tears the generation down exactly once and starts the reconnect
//! loop, which runs until [`TunnelClient::close`] cancels it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::connection::{Dialer, FrameSink, FrameStream};
use super::envelope::{
    Envelope, MasterToolCallData, MasterToolsData, Payload, RegisterData, ResponseData,
    ToolCallData, ToolUpdateData,
};
use super::errors::TunnelError;
use super::lifecycle::{AdminCommand, LifecycleHook};
use super::proxy::{MasterCaller, MasterProxyClient};
use crate::mcp_client::config::{DEFAULT_HEARTBEAT_SECS, DEFAULT_MASTER_CALL_TIMEOUT_SECS};
use crate::mcp_client::contract::ClientState;
use crate::mcp_client::correlator::{Correlator, WaitOutcome};
use crate::mcp_client::registry::{qualify, split_tool_name};
use crate::mcp_client::types::error_codes;
use crate::mcp_client::{
    McpError, McpToolDefinition, SlaveRegistry, ToolProvider, TransportClient, TunnelSettings,
};

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Name this client is known by locally.
    pub name: String,
    /// Announced to the master in `register`.
    pub hostname: String,
    pub version: String,
    pub heartbeat_interval: Duration,
    pub call_timeout: Duration,
    pub backoff: Backoff,
}

impl TunnelOptions {
    pub fn new(hostname: &str) -> Self {
        Self {
            name: "master".to_string(),
            hostname: hostname.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            call_timeout: Duration::from_secs(DEFAULT_MASTER_CALL_TIMEOUT_SECS),
            backoff: Backoff::default(),
        }
    }

    pub fn from_settings(settings: &TunnelSettings) -> Self {
        let hostname = settings.hostname.clone().unwrap_or_else(local_hostname);
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            call_timeout: settings.master_call_timeout(),
            ..Self::new(&hostname)
        }
    }
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

// ─── TunnelClient ────────────────────────────────────────────────────────────

/// Persistent connection from this slave to its master.
pub struct TunnelClient {
    shared: Arc<TunnelShared>,
}

/// State shared with the per-generation tasks.
struct TunnelShared {
    options: TunnelOptions,
    dialer: Arc<dyn Dialer>,
    provider: Arc<dyn ToolProvider>,
    registry: RwLock<Option<Arc<dyn SlaveRegistry>>>,
    hook: Arc<dyn LifecycleHook>,
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    connected: AtomicBool,
    generation: AtomicU64,
    pending: Correlator<String, ResponseData>,
    master_clients: Mutex<HashMap<String, Arc<MasterProxyClient>>>,
    shutdown: CancellationToken,
    state: ClientState,
}

impl TunnelClient {
    pub fn new(
        options: TunnelOptions,
        dialer: Arc<dyn Dialer>,
        provider: Arc<dyn ToolProvider>,
        hook: Arc<dyn LifecycleHook>,
    ) -> Self {
        Self {
            shared: Arc::new(TunnelShared {
                options,
                dialer,
                provider,
                registry: RwLock::new(None),
                hook,
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                pending: Correlator::new(),
                master_clients: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                state: ClientState::new(),
            }),
        }
    }

    /// Registry that receives proxy clients for the master's servers.
    pub fn set_registry(&self, registry: Arc<dyn SlaveRegistry>) {
        *self.shared.registry.write() = Some(registry);
    }

    /// One connection attempt: dial, register, start the workers.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        self.shared.connect().await
    }

    /// Connect, falling back to the reconnect loop if the first attempt fails.
    pub async fn start(&self) {
        if let Err(e) = self.shared.connect().await {
            tracing::warn!(master = self.shared.dialer.address(), error = %e, "initial connect failed");
            self.shared.state.set_error(&e.to_string());
            tokio::spawn(self.shared.clone().reconnect_loop());
        }
    }

    /// Announce a changed local catalog.
    pub async fn send_tool_update(&self) -> Result<(), TunnelError> {
        self.shared.send_tool_update().await
    }

    /// Send a `tool_update` for every change received, until closed.
    ///
    /// Changes while disconnected are skipped, the next `register` carries
    /// the current catalog.
    pub fn forward_catalog_changes(&self, mut changes: broadcast::Receiver<String>) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                let source = tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    next = changes.recv() => match next {
                        Ok(source) => source,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!(missed, "catalog changes lagged");
                            "lagged".to_string()
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if !shared.connected.load(Ordering::Acquire) {
                    tracing::debug!(%source, "not connected, skipping tool update");
                    continue;
                }
                match shared.send_tool_update().await {
                    Ok(()) => tracing::info!(%source, "sent tool update to master"),
                    Err(e) => tracing::warn!(%source, error = %e, "failed to send tool update"),
                }
            }
            tracing::debug!("catalog change forwarding stopped");
        });
    }

    /// Run `tool` on the master's `server`.
    pub async fn call_master_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        self.shared.call_master_tool(server, tool, arguments).await
    }

    /// Master servers currently proxied, sorted.
    pub fn master_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.master_clients.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Locate the master server that announced `name`.
    fn resolve_tool(&self, name: &str) -> Option<(String, String)> {
        let clients = self.shared.master_clients.lock();
        let names: Vec<&str> = clients.keys().map(String::as_str).collect();
        if let Some((server, tool)) = split_tool_name(name, names.as_slice()) {
            return Some((server.to_string(), tool.to_string()));
        }
        let mut servers: Vec<_> = clients.iter().collect();
        servers.sort_by(|a, b| a.0.cmp(b.0));
        servers.into_iter().find_map(|(server, client)| {
            client
                .announced_tools()
                .iter()
                .any(|t| t.name == name)
                .then(|| (server.clone(), name.to_string()))
        })
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl TunnelShared {
    // ─── Connection ──────────────────────────────────────────────────────

    async fn connect(self: &Arc<Self>) -> Result<(), TunnelError> {
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::NotConnected);
        }

        let connection = self.dialer.dial().await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.writer.lock().await = Some(connection.sink);
        self.connected.store(true, Ordering::Release);

        if let Err(e) = self.register().await {
            self.connected.store(false, Ordering::Release);
            self.close_writer().await;
            return Err(e);
        }

        tokio::spawn(self.clone().read_loop(generation, connection.stream));
        tokio::spawn(self.clone().heartbeat_loop(generation));

        tracing::info!(
            master = self.dialer.address(),
            hostname = %self.options.hostname,
            generation,
            "connected to master"
        );
        Ok(())
    }

    async fn register(&self) -> Result<(), TunnelError> {
        let tools = self.local_tools().await;
        let count = tools.len();
        self.send(Envelope::new(
            uuid::Uuid::new_v4().to_string(),
            Payload::Register(RegisterData {
                hostname: self.options.hostname.clone(),
                version: self.options.version.clone(),
                tools,
            }),
        ))
        .await?;
        tracing::debug!(tools = count, "sent registration");
        Ok(())
    }

    async fn send_tool_update(&self) -> Result<(), TunnelError> {
        let tools = self.local_tools().await;
        self.send(Envelope::notice(Payload::ToolUpdate(ToolUpdateData { tools })))
            .await
    }

    async fn local_tools(&self) -> Vec<McpToolDefinition> {
        match self.provider.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list local tools, announcing none");
                Vec::new()
            }
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TunnelError> {
        let text = envelope.encode()?;
        self.send_frame(Message::Text(text)).await
    }

    /// Write one frame. All writers share this lock so frames never interleave.
    async fn send_frame(&self, frame: Message) -> Result<(), TunnelError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TunnelError::NotConnected)?;
        sink.send(frame).await.map_err(|e| TunnelError::Io {
            path: self.dialer.address().to_string(),
            reason: e.to_string(),
        })
    }

    async fn close_writer(&self) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(e) = sink.close().await {
                tracing::debug!(error = %e, "error closing master connection");
            }
        }
    }

    // ─── Workers ─────────────────────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, generation: u64, mut stream: FrameStream) {
        let reason = loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.dispatch(text).await,
                    Err(_) => tracing::warn!("ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.send_frame(Message::Pong(data)).await {
                        tracing::debug!(error = %e, "failed to answer ping");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break "connection closed by master".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            }
        };
        self.handle_disconnect(generation, &reason).await;
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let mut ticker = tokio::time::interval(self.options.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.generation.load(Ordering::Acquire) != generation
                || !self.connected.load(Ordering::Acquire)
            {
                return;
            }
            if let Err(e) = self.send(Envelope::notice(Payload::Heartbeat)).await {
                tracing::warn!(error = %e, "failed to send heartbeat");
            }
        }
    }

    /// Tear down `generation` and schedule a reconnect. Later calls for the
    /// same or an older generation do nothing.
    ///
    /// Proxy clients stay registered and report not connected until the
    /// master's next `master_tools` reconciles them.
    async fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.generation.load(Ordering::Acquire) != generation
            || !self.connected.swap(false, Ordering::AcqRel)
        {
            return;
        }

        self.close_writer().await;
        let failed = self.pending.close_all();
        self.state.set_error(&format!("disconnected from master: {reason}"));
        tracing::warn!(
            master = self.dialer.address(),
            generation,
            failed_requests = failed,
            %reason,
            "disconnected from master"
        );

        if !self.shutdown.is_cancelled() {
            tokio::spawn(self.clone().reconnect_loop());
        }
    }

    /// Retry until connected or shut down.
    ///
    /// Boxed to break the reconnect → connect → reader → reconnect type cycle.
    fn reconnect_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.reconnect_until_connected().await })
    }

    async fn reconnect_until_connected(self: Arc<Self>) {
        let mut backoff = self.options.backoff.clone();
        backoff.reset();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let delay = backoff.current();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("reconnect loop stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            tracing::info!(
                master = self.dialer.address(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to master"
            );
            match self.connect().await {
                Ok(()) => {
                    self.state.clear_error();
                    tracing::info!(master = self.dialer.address(), attempt, "reconnected to master");
                    return;
                }
                Err(e) => {
                    let next = backoff.record_failure();
                    self.state
                        .set_error(&format!("reconnect failed (attempt {attempt}): {e}"));
                    tracing::warn!(
                        error = %e,
                        attempt,
                        next_retry_ms = next.as_millis() as u64,
                        "reconnect failed"
                    );
                }
            }
        }
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    async fn dispatch(self: &Arc<Self>, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable envelope");
                self.answer_malformed(text, &e).await;
                return;
            }
        };

        let id = envelope.id;
        match envelope.payload {
            Payload::ToolCall(call) => {
                let this = self.clone();
                tokio::spawn(async move { this.handle_tool_call(id, call).await });
            }
            Payload::Response(response) => {
                if !self.pending.deliver(&id, response) {
                    tracing::warn!(%id, "response for unknown request");
                }
            }
            Payload::Error(error) => {
                tracing::error!(error = %error.error, "error from master");
                self.state.set_error(&error.error);
            }
            Payload::Restart => self.schedule_admin(AdminCommand::Restart),
            Payload::Upgrade => self.schedule_admin(AdminCommand::Upgrade),
            Payload::MasterTools(data) => self.reconcile_master_tools(data).await,
            Payload::Heartbeat => tracing::trace!("heartbeat from master"),
            other => tracing::warn!(kind = other.kind(), "unexpected envelope from master"),
        }
    }

    /// A `tool_call` that failed to decode still gets a failed response.
    async fn answer_malformed(&self, text: &str, error: &TunnelError) {
        if Envelope::peek_kind(text).as_deref() != Some("tool_call") {
            return;
        }
        let Some(id) = Envelope::peek_id(text) else {
            return;
        };
        let reply = Envelope::new(id, Payload::Response(ResponseData::failed(error.to_string())));
        if let Err(e) = self.send(reply).await {
            tracing::warn!(error = %e, "failed to answer malformed tool call");
        }
    }

    async fn handle_tool_call(&self, id: String, call: ToolCallData) {
        tracing::debug!(%id, tool = %call.tool, "tool call from master");
        let response = match self.provider.call_tool(&call.tool, call.arguments).await {
            Ok(result) => ResponseData::ok(result),
            Err(e) => {
                tracing::warn!(%id, tool = %call.tool, error = %e, "tool call failed");
                ResponseData::failed(e.to_string())
            }
        };
        if let Err(e) = self.send(Envelope::new(id, Payload::Response(response))).await {
            tracing::error!(error = %e, "failed to send tool response");
        }
    }

    fn schedule_admin(self: &Arc<Self>, command: AdminCommand) {
        tracing::info!(?command, "administrative command from master");
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(command.grace()).await;
            this.shutdown.cancel();
            this.connected.store(false, Ordering::Release);
            this.close_writer().await;
            let failed = this.pending.close_all();
            if failed > 0 {
                tracing::info!(failed_requests = failed, "released in-flight calls before shutdown");
            }
            this.hook.on_command(command).await;
        });
    }

    /// Bring the proxy clients in line with the master's catalog.
    async fn reconcile_master_tools(self: &Arc<Self>, data: MasterToolsData) {
        let Some(registry) = self.registry.read().clone() else {
            tracing::warn!("received master tools but no registry is set, ignoring");
            return;
        };

        if let Some(mappings) = data.context_mappings {
            registry.set_master_context_mappings(mappings);
        }

        let announced: BTreeSet<String> = data.servers.keys().cloned().collect();
        let total: usize = data.servers.values().map(Vec::len).sum();
        let caller: Weak<dyn MasterCaller> = Arc::downgrade(self) as Weak<dyn MasterCaller>;

        let mut removed = Vec::new();
        {
            let mut clients = self.master_clients.lock();
            for (server, tools) in data.servers {
                if let Some(existing) = clients.get(&server) {
                    tracing::debug!(server = %server, tools = tools.len(), "updated master tools");
                    existing.update_tools(tools);
                } else {
                    tracing::info!(server = %server, tools = tools.len(), "registered master tools");
                    let proxy = Arc::new(MasterProxyClient::new(&server, tools, caller.clone()));
                    registry.register_slave_client(&server, proxy.clone());
                    clients.insert(server, proxy);
                }
            }
            clients.retain(|server, client| {
                let keep = announced.contains(server);
                if !keep {
                    removed.push((server.clone(), client.clone()));
                }
                keep
            });
        }

        for (server, client) in removed {
            if let Err(e) = client.close().await {
                tracing::warn!(server = %server, error = %e, "failed to close master proxy client");
            }
            registry.unregister_slave_client(&server);
            tracing::info!(server = %server, "removed master tools, server no longer present");
        }

        self.state.record_tools(total);
        tracing::info!(servers = announced.len(), total_tools = total, "master tools synchronized");
    }

    /// Close every proxy client and drop it from the registry.
    async fn drop_master_clients(&self) {
        let registry = self.registry.read().clone();
        let drained: Vec<_> = self.master_clients.lock().drain().collect();
        for (server, client) in drained {
            if let Err(e) = client.close().await {
                tracing::warn!(server = %server, error = %e, "failed to close master proxy client");
            }
            if let Some(registry) = &registry {
                registry.unregister_slave_client(&server);
            }
        }
    }
}

#[async_trait]
impl MasterCaller for TunnelShared {
    async fn call_master_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(McpError::NotConnected {
                server: self.options.name.clone(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let rx = self.pending.register(id.clone()).ok_or_else(|| McpError::TransportError {
            server: self.options.name.clone(),
            reason: format!("duplicate request id {id}"),
        })?;

        let envelope = Envelope::new(
            id.clone(),
            Payload::MasterToolCall(MasterToolCallData {
                server: server.to_string(),
                tool: tool.to_string(),
                arguments,
            }),
        );
        if let Err(e) = self.send(envelope).await {
            self.pending.remove(&id);
            return Err(e.into());
        }

        let timeout = self.options.call_timeout;
        match self.pending.wait(&id, rx, timeout).await {
            WaitOutcome::Delivered(response) => {
                response.into_result().map_err(|message| McpError::ServerError {
                    code: error_codes::INTERNAL_ERROR,
                    message,
                    data: None,
                })
            }
            WaitOutcome::TimedOut => Err(McpError::Timeout {
                method: "master_tool_call".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            WaitOutcome::Closed => Err(McpError::ConnectionClosed {
                server: self.options.name.clone(),
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn call_timeout(&self) -> Duration {
        self.options.call_timeout
    }
}

// ─── TransportClient ─────────────────────────────────────────────────────────

/// The tunnel as a client of the master's catalog.
#[async_trait]
impl TransportClient for TunnelClient {
    fn name(&self) -> &str {
        &self.shared.options.name
    }

    fn state(&self) -> &ClientState {
        &self.shared.state
    }

    fn default_timeout(&self) -> Duration {
        self.shared.options.call_timeout
    }

    async fn list_tools_with_timeout(
        &self,
        _timeout: Duration,
    ) -> Result<Vec<McpToolDefinition>, McpError> {
        let clients: Vec<_> = {
            let map = self.shared.master_clients.lock();
            let mut clients: Vec<_> = map.iter().map(|(n, c)| (n.clone(), c.clone())).collect();
            clients.sort_by(|a, b| a.0.cmp(&b.0));
            clients
        };

        let mut tools = Vec::new();
        for (server, client) in clients {
            tools.extend(client.announced_tools().into_iter().map(|mut tool| {
                tool.name = qualify(&server, &tool.name);
                tool
            }));
        }
        self.shared.state.record_tools(tools.len());
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let (server, tool) = self.resolve_tool(name).ok_or_else(|| McpError::UnknownTool {
            name: name.to_string(),
        })?;
        self.shared.call_master_tool(&server, &tool, arguments).await
    }

    async fn list_prompts(&self) -> Result<Vec<Value>, McpError> {
        self.shared.state.record_prompts(0);
        Ok(Vec::new())
    }

    async fn get_prompt(&self, _name: &str, _arguments: Value) -> Result<Value, McpError> {
        Err(McpError::Unsupported {
            server: self.shared.options.name.clone(),
            operation: "prompts/get".into(),
        })
    }

    async fn list_resources(&self) -> Result<Vec<Value>, McpError> {
        self.shared.state.record_resources(0);
        Ok(Vec::new())
    }

    async fn read_resource(&self, _uri: &str) -> Result<Value, McpError> {
        Err(McpError::Unsupported {
            server: self.shared.options.name.clone(),
            operation: "resources/read".into(),
        })
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Stop reconnecting, close the socket and withdraw every proxy client.
    async fn close(&self) -> Result<(), McpError> {
        let shared = &self.shared;
        shared.shutdown.cancel();
        shared.connected.store(false, Ordering::Release);
        shared.close_writer().await;
        shared.pending.close_all();
        shared.drop_master_clients().await;
        if shared.state.mark_disconnected() {
            tracing::info!(master = shared.dialer.address(), "tunnel closed");
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
