//! Correlated request/response client.
//!
//! `RpcClient` owns a pending table and an outbound sink. Whoever reads the
//! peer's inbound frames hands them to `dispatch`; responses resolve their
//! waiters, anything else is handed back to the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use super::errors::RpcError;
use super::framing::FrameWriter;
use super::pending::PendingRequests;
use super::types::Message;

// ─── Outbound ────────────────────────────────────────────────────────────────

/// Where a client writes its frames (a child's stdin, an HTTP endpoint, ...).
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), RpcError>;
}

/// Outbound sink over any byte pipe. Frames are written in call order.
pub struct PipeOutbound<W> {
    peer: String,
    writer: Mutex<FrameWriter<W>>,
}

impl<W> PipeOutbound<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(peer: &str, writer: W) -> Self {
        Self {
            peer: peer.to_string(),
            writer: Mutex::new(FrameWriter::new(writer)),
        }
    }
}

#[async_trait]
impl<W> Outbound for PipeOutbound<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&self, message: &Message) -> Result<(), RpcError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(message)
            .await
            .map_err(|e| RpcError::Transport {
                peer: self.peer.clone(),
                reason: format!("failed to write frame: {e}"),
            })
    }
}

// ─── RpcClient ───────────────────────────────────────────────────────────────

pub struct RpcClient {
    peer: String,
    next_id: AtomicU64,
    pending: PendingRequests,
    outbound: Arc<dyn Outbound>,
    closed: AtomicBool,
}

impl RpcClient {
    pub fn new(peer: &str, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            peer: peer.to_string(),
            next_id: AtomicU64::new(1),
            pending: PendingRequests::new(),
            outbound,
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send `method` and wait up to `timeout` for the correlated response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed {
                peer: self.peer.clone(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id);
        // Removes the entry however this future ends, including when the
        // caller drops it.
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        let exchange = async {
            let message = Message::request(id, method, params);
            if let Err(e) = self.outbound.send(&message).await {
                return Err(e);
            }
            rx.await.unwrap_or_else(|_| {
                Err(RpcError::Closed {
                    peer: self.peer.clone(),
                })
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    peer = %self.peer,
                    method,
                    id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(RpcError::Timeout {
                    peer: self.peer.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a one-way notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.outbound
            .send(&Message::notification(method, params))
            .await
    }

    /// Route one inbound message.
    ///
    /// Responses are consumed; requests and notifications from the peer are
    /// returned so the owner can decide what to do with them.
    pub fn dispatch(&self, message: Message) -> Option<Message> {
        let Message::Response(response) = message else {
            return Some(message);
        };

        let Some(id) = response.id.as_u64() else {
            tracing::warn!(peer = %self.peer, id = %response.id, "dropping uncorrelatable response");
            return None;
        };

        let outcome = response.outcome.map_err(|e| RpcError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        });
        if !self.pending.resolve(id, outcome) {
            tracing::warn!(peer = %self.peer, id, "response for unknown or expired request");
        }
        None
    }

    /// Parse and route a raw frame. Malformed frames are logged and dropped.
    pub fn dispatch_value(&self, value: Value) -> Option<Message> {
        match Message::from_value(value) {
            Ok(message) => self.dispatch(message),
            Err(invalid) => {
                tracing::warn!(
                    peer = %self.peer,
                    id = %invalid.id,
                    reason = %invalid.reason,
                    "dropping invalid frame"
                );
                None
            }
        }
    }

    /// Reject everything pending with `make_error`.
    pub fn fail_all(&self, make_error: impl Fn() -> RpcError) -> usize {
        self.pending.fail_all(make_error)
    }

    /// Refuse new requests and reject pending ones. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peer = self.peer.clone();
        self.pending.fail_all(|| RpcError::Closed { peer: peer.clone() });
    }
}

struct PendingEntry<'a> {
    pending: &'a PendingRequests,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
