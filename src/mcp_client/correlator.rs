//! Request/response correlation.
//!
//! Every transport keeps one `Correlator` per connection. A caller registers
//! its request id before writing the request, then waits on the returned
//! mailbox. The reader side delivers into the mailbox and removes the entry in
//! the same step, so a response reaches at most one waiter.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// How a wait on a pending entry ended.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<V> {
    /// The matching response arrived.
    Delivered(V),
    /// The timeout fired first. The entry has been removed.
    TimedOut,
    /// The connection died and the mailbox was closed without a value.
    Closed,
}

// ─── Correlator ──────────────────────────────────────────────────────────────

/// Table of outstanding request ids and their single-delivery mailboxes.
pub struct Correlator<K, V> {
    pending: Mutex<HashMap<K, oneshot::Sender<V>>>,
}

impl<K, V> Default for Correlator<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Correlator<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh mailbox for `id`.
    ///
    /// Returns `None` if `id` is already pending; ids are registered at most
    /// once at a time.
    pub fn register(&self, id: K) -> Option<oneshot::Receiver<V>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Some(rx)
    }

    /// Deliver a response to the waiter for `id` and remove the entry.
    ///
    /// Returns `false` when nobody is waiting (already timed out, never
    /// registered, or the waiter was dropped).
    pub fn deliver(&self, id: &K, value: V) -> bool {
        let sender = self.pending.lock().remove(id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Remove an entry without delivering. Returns whether it was present.
    pub fn remove(&self, id: &K) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Close every pending mailbox. Each waiter observes [`WaitOutcome::Closed`].
    ///
    /// Returns how many entries were drained.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained.len()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Wait for the response to `id`, removing the entry on timeout.
    pub async fn wait(
        &self,
        id: &K,
        rx: oneshot::Receiver<V>,
        timeout: Duration,
    ) -> WaitOutcome<V> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => WaitOutcome::Delivered(value),
            Ok(Err(_)) => WaitOutcome::Closed,
            Err(_) => {
                self.remove(id);
                WaitOutcome::TimedOut
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
