//! The capability contract shared by every transport.
//!
//! A caller holds one `TransportClient` per configured backend and never needs
//! to know whether the tools behind it live in a child process, an HTTP
//! service, or on the far side of the tunnel.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::types::{JsonRpcNotification, McpToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Capacity of the per-client notification queue.
pub const NOTIFICATION_CAPACITY: usize = 10;

/// Value returned by the cached-count getters before the first successful list.
pub const COUNT_UNKNOWN: i64 = -1;

// ─── Contract ────────────────────────────────────────────────────────────────

/// Operations every transport supports.
///
/// Concurrent calls on one client are safe; each request is correlated
/// independently.
#[async_trait]
pub trait TransportClient: Send + Sync + 'static {
    /// Server name this client was configured under.
    fn name(&self) -> &str;

    /// Shared bookkeeping (counts, last error, notifications).
    fn state(&self) -> &ClientState;

    /// Timeout applied when the caller does not pick one.
    fn default_timeout(&self) -> Duration;

    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.list_tools_with_timeout(self.default_timeout()).await
    }

    async fn list_tools_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Vec<McpToolDefinition>, McpError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;

    async fn list_prompts(&self) -> Result<Vec<Value>, McpError>;

    async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpError>;

    async fn list_resources(&self) -> Result<Vec<Value>, McpError>;

    async fn read_resource(&self, uri: &str) -> Result<Value, McpError>;

    fn is_connected(&self) -> bool;

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<(), McpError>;

    fn cached_tool_count(&self) -> i64 {
        self.state().cached_tool_count()
    }

    fn cached_prompt_count(&self) -> i64 {
        self.state().cached_prompt_count()
    }

    fn cached_resource_count(&self) -> i64 {
        self.state().cached_resource_count()
    }

    fn invalidate_tool_cache(&self) {
        self.state().invalidate_tools();
    }

    fn last_error(&self) -> Option<String> {
        self.state().last_error()
    }

    fn set_error(&self, message: &str) {
        self.state().set_error(message);
    }

    /// Take the receiving end of the notification queue. Only the first call
    /// gets it.
    fn take_notifications(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.state().notifications().take_receiver()
    }

    /// Token cancelled when the client's connection is gone for good.
    fn disconnected(&self) -> CancellationToken {
        self.state().disconnected()
    }

    /// Start a background re-list of tools, prompts and resources.
    ///
    /// Returns `false` without starting anything when a refresh for this
    /// client is already running.
    fn trigger_async_refresh(self: Arc<Self>, timeout: Duration) -> bool {
        let Some(guard) = self.state().begin_refresh() else {
            return false;
        };

        tokio::spawn(async move {
            let _guard = guard;
            let server = self.name().to_string();

            match self.list_tools_with_timeout(timeout).await {
                Ok(tools) => tracing::debug!(server = %server, count = tools.len(), "refreshed tools"),
                Err(e) => tracing::warn!(server = %server, error = %e, "tool refresh failed"),
            }
            if let Err(e) = self.list_prompts().await {
                tracing::debug!(server = %server, error = %e, "prompt refresh failed");
            }
            if let Err(e) = self.list_resources().await {
                tracing::debug!(server = %server, error = %e, "resource refresh failed");
            }
        });

        true
    }
}

// ─── Client State ────────────────────────────────────────────────────────────

/// Bookkeeping every transport client carries.
pub struct ClientState {
    tool_count: AtomicI64,
    prompt_count: AtomicI64,
    resource_count: AtomicI64,
    refreshing: Arc<AtomicBool>,
    last_error: Mutex<Option<String>>,
    notifications: NotificationQueue,
    disconnected: CancellationToken,
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            tool_count: AtomicI64::new(COUNT_UNKNOWN),
            prompt_count: AtomicI64::new(COUNT_UNKNOWN),
            resource_count: AtomicI64::new(COUNT_UNKNOWN),
            refreshing: Arc::new(AtomicBool::new(false)),
            last_error: Mutex::new(None),
            notifications: NotificationQueue::new(NOTIFICATION_CAPACITY),
            disconnected: CancellationToken::new(),
        }
    }

    pub fn cached_tool_count(&self) -> i64 {
        self.tool_count.load(Ordering::Acquire)
    }

    pub fn cached_prompt_count(&self) -> i64 {
        self.prompt_count.load(Ordering::Acquire)
    }

    pub fn cached_resource_count(&self) -> i64 {
        self.resource_count.load(Ordering::Acquire)
    }

    pub fn record_tools(&self, count: usize) {
        self.tool_count.store(count as i64, Ordering::Release);
    }

    pub fn record_prompts(&self, count: usize) {
        self.prompt_count.store(count as i64, Ordering::Release);
    }

    pub fn record_resources(&self, count: usize) {
        self.resource_count.store(count as i64, Ordering::Release);
    }

    pub fn invalidate_tools(&self) {
        self.tool_count.store(COUNT_UNKNOWN, Ordering::Release);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_error(&self, message: &str) {
        *self.last_error.lock() = Some(message.to_string());
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    pub fn disconnected(&self) -> CancellationToken {
        self.disconnected.clone()
    }

    /// Fire the disconnect signal. Returns `true` only for the first call.
    pub fn mark_disconnected(&self) -> bool {
        if self.disconnected.is_cancelled() {
            return false;
        }
        self.disconnected.cancel();
        true
    }

    /// Claim the single-flight refresh slot.
    pub fn begin_refresh(&self) -> Option<RefreshGuard> {
        self.refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard {
                flag: self.refreshing.clone(),
            })
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }
}

/// Releases the refresh slot on drop.
pub struct RefreshGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// ─── Notification Queue ──────────────────────────────────────────────────────

/// Bounded queue for server-pushed notifications.
///
/// Overflow policy is drop-newest: when the queue is full the incoming
/// notification is discarded, the overflow counter is bumped and a warning is
/// logged. Pushing never blocks the decode loop.
pub struct NotificationQueue {
    tx: mpsc::Sender<JsonRpcNotification>,
    rx: Mutex<Option<mpsc::Receiver<JsonRpcNotification>>>,
    overflow: AtomicU64,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            overflow: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Returns whether the notification was kept.
    pub fn push(&self, notification: JsonRpcNotification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                let total = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    method = %dropped.method,
                    dropped_total = total,
                    "notification queue full, dropping notification"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                tracing::debug!(method = %dropped.method, "notification receiver gone");
                false
            }
        }
    }

    pub fn take_receiver(&self) -> Option<mpsc::Receiver<JsonRpcNotification>> {
        self.rx.lock().take()
    }

    /// Number of notifications dropped because the queue was full.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
