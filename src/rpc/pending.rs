//! Pending request table.
//!
//! Maps an outstanding request id to the channel its caller is waiting on.
//! Every path that completes a request (response, timeout, exit sweep)
//! goes through `remove`, so an entry resolves at most once.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use super::errors::RpcError;

/// Outcome delivered to a waiting caller.
pub type PendingOutcome = Result<Value, RpcError>;

/// Request id → resolver, owned by a single RPC client.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<u64, oneshot::Sender<PendingOutcome>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` and return the receiver its caller awaits.
    pub fn register(&self, id: u64) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        if entries.insert(id, tx).is_some() {
            tracing::warn!(id, "request id reused while still pending");
        }
        rx
    }

    /// Resolve `id` with `outcome`. Returns `false` if nothing was waiting.
    pub fn resolve(&self, id: u64, outcome: PendingOutcome) -> bool {
        match self.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forget `id` without resolving it (its caller has already given up).
    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Reject every pending request with an error built by `make_error`.
    ///
    /// Returns how many requests were rejected. The table is empty afterwards.
    pub fn fail_all(&self, make_error: impl Fn() -> RpcError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<PendingOutcome>>> {
        // A poisoned table still holds valid senders; keep using it.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
