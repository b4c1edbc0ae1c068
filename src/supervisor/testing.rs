//! Scriptable in-memory connector for supervisor tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::connection::{Connector, ToolServerConnection};
use super::errors::SupervisorError;
use super::types::{ServerConfigEntry, ToolDefinition, TransportKind};

/// Counters and switches shared by a connector and all its connections.
#[derive(Default)]
pub struct Script {
    pub opens: AtomicUsize,
    pub handshakes: AtomicUsize,
    pub closes: AtomicUsize,
    pub calls: AtomicUsize,
    pub open_delay_ms: AtomicUsize,
    pub hang_handshake: AtomicBool,
    pub fail_handshake: AtomicBool,
    pub hang_calls: AtomicBool,
    pub fail_calls: AtomicBool,
}

pub struct FakeConnector {
    script: Arc<Script>,
}

impl FakeConnector {
    pub fn new(script: Arc<Script>) -> Self {
        Self { script }
    }
}

struct FakeConnection {
    script: Arc<Script>,
    server_id: String,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        entry: &ServerConfigEntry,
    ) -> Result<Arc<dyn ToolServerConnection>, SupervisorError> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.open_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(Arc::new(FakeConnection {
            script: self.script.clone(),
            server_id: entry.server_id.clone(),
        }))
    }
}

#[async_trait]
impl ToolServerConnection for FakeConnection {
    async fn handshake(&self) -> Result<(), SupervisorError> {
        self.script.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.script.hang_handshake.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.script.fail_handshake.load(Ordering::SeqCst) {
            return Err(SupervisorError::Handshake {
                server_id: self.server_id.clone(),
                reason: "unsupported protocol".into(),
            });
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SupervisorError> {
        Ok(vec![ToolDefinition {
            name: "echo".into(),
            description: "Echo arguments".into(),
            input_schema: json!({"type": "object"}),
        }])
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SupervisorError> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        if self.script.hang_calls.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.script.fail_calls.load(Ordering::SeqCst) {
            return Err(SupervisorError::ToolCall {
                server_id: self.server_id.clone(),
                tool: tool.to_string(),
                reason: "broken pipe".into(),
            });
        }
        Ok(json!({"tool": tool, "echo": arguments}))
    }

    fn diagnostics(&self) -> Vec<String> {
        vec!["fake server log".into()]
    }

    async fn close(&self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A valid stdio entry for `id`.
pub fn entry(id: &str) -> ServerConfigEntry {
    ServerConfigEntry {
        server_id: id.into(),
        server_name: format!("Server {id}"),
        description: "test server".into(),
        transport: TransportKind::Stdio,
        command: Some("fake-server".into()),
        args: vec![],
        env: BTreeMap::new(),
        url: None,
        runtime: "node".into(),
    }
}
