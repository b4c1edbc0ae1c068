//! Tool-server connections.
//!
//! A `Connector` opens the transport for a config entry; the resulting
//! `ToolServerConnection` speaks MCP over it (`initialize`, `tools/list`,
//! `tools/call`). The supervisor bounds every step with its own timeout and
//! calls `close` on anything it gives up on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::errors::SupervisorError;
use super::types::{ServerConfigEntry, ToolDefinition, TransportKind};
use crate::process::child::ChildControl;
use crate::process::{
    format_stderr_suffix, spawn_child, ChildIo, ChildSpec, ExitWatch, StderrMode, StderrRing,
};
use crate::rpc::{FrameReader, Message, Outbound, PipeOutbound, RpcClient, RpcError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision we announce.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on any single request inside a connection. The supervisor's
/// own watchdog is normally much shorter.
const REQUEST_CEILING: Duration = Duration::from_secs(600);

/// Most `tools/list` pages followed before giving up on a cursor chain.
const MAX_TOOL_PAGES: usize = 50;

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A live, handshaken-or-handshaking tool server.
#[async_trait]
pub trait ToolServerConnection: Send + Sync {
    /// MCP `initialize` followed by `notifications/initialized`.
    async fn handshake(&self) -> Result<(), SupervisorError>;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SupervisorError>;

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SupervisorError>;

    /// Recent stderr lines, for error messages.
    fn diagnostics(&self) -> Vec<String> {
        Vec::new()
    }

    /// Tear the transport down. Must be safe to call more than once.
    async fn close(&self);
}

/// Opens connections for config entries.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        entry: &ServerConfigEntry,
    ) -> Result<Arc<dyn ToolServerConnection>, SupervisorError>;
}

/// Picks stdio or SSE based on the entry's transport.
pub struct DefaultConnector {
    stdio: StdioConnector,
    sse: SseConnector,
}

impl DefaultConnector {
    pub fn new(stderr_lines: usize) -> Self {
        Self {
            stdio: StdioConnector::new(stderr_lines),
            sse: SseConnector::new(),
        }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(
        &self,
        entry: &ServerConfigEntry,
    ) -> Result<Arc<dyn ToolServerConnection>, SupervisorError> {
        match entry.transport {
            TransportKind::Stdio => self.stdio.open(entry).await,
            TransportKind::Sse => self.sse.open(entry).await,
        }
    }
}

// ─── MCP session (shared by both transports) ─────────────────────────────────

/// MCP requests over an `RpcClient`, whatever carries its frames.
struct McpSession {
    server_id: String,
    rpc: Arc<RpcClient>,
}

impl McpSession {
    fn failure(&self, e: RpcError) -> SupervisorError {
        SupervisorError::Handshake {
            server_id: self.server_id.clone(),
            reason: e.to_string(),
        }
    }

    async fn handshake(&self) -> Result<(), SupervisorError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self
            .rpc
            .request("initialize", Some(params), REQUEST_CEILING)
            .await
            .map_err(|e| self.failure(e))?;
        tracing::debug!(
            server = %self.server_id,
            server_info = %result.get("serverInfo").cloned().unwrap_or(serde_json::Value::Null),
            "tool server initialized"
        );
        self.rpc
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| self.failure(e))
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SupervisorError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self
                .rpc
                .request("tools/list", Some(params), REQUEST_CEILING)
                .await
                .map_err(|e| self.failure(e))?;

            let page: Vec<ToolDefinition> = result
                .get("tools")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| SupervisorError::Handshake {
                    server_id: self.server_id.clone(),
                    reason: format!("malformed tools/list response: {e}"),
                })?
                .unwrap_or_default();
            tools.extend(page);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(tools);
            }
        }

        tracing::warn!(server = %self.server_id, "tools/list cursor chain too long, truncating");
        Ok(tools)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SupervisorError> {
        let params = json!({ "name": tool, "arguments": arguments });
        self.rpc
            .request("tools/call", Some(params), REQUEST_CEILING)
            .await
            .map_err(|e| SupervisorError::ToolCall {
                server_id: self.server_id.clone(),
                tool: tool.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Route inbound frames; tool servers rarely send us requests, and we do
/// not serve any.
async fn pump_frames(rpc: Arc<RpcClient>, mut reader: FrameReader) {
    while let Some(value) = reader.recv().await {
        if let Some(Message::Request(req)) = rpc.dispatch_value(value) {
            tracing::debug!(peer = %rpc.peer(), method = %req.method, "ignoring server-initiated request");
        }
    }
    let peer = rpc.peer().to_string();
    rpc.fail_all(|| RpcError::Transport {
        peer: peer.clone(),
        reason: "output stream closed".into(),
    });
}

fn abort_all(tasks: &Mutex<Vec<JoinHandle<()>>>) {
    let drained: Vec<_> = tasks
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain(..)
        .collect();
    for task in drained {
        task.abort();
    }
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

/// Spawns tool servers as child processes.
pub struct StdioConnector {
    stderr_lines: usize,
}

impl StdioConnector {
    pub fn new(stderr_lines: usize) -> Self {
        Self { stderr_lines }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn open(
        &self,
        entry: &ServerConfigEntry,
    ) -> Result<Arc<dyn ToolServerConnection>, SupervisorError> {
        let command = entry.command.clone().ok_or_else(|| SupervisorError::InvalidConfig {
            server_id: entry.server_id.clone(),
            reason: "stdio transport requires a command".into(),
        })?;
        let mut spec = ChildSpec::new(command)
            .args(entry.args.iter().cloned())
            .stderr(StderrMode::Capture);
        spec.env = entry.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let child = spawn_child(&entry.server_id, &spec).map_err(|e| SupervisorError::Connect {
            server_id: entry.server_id.clone(),
            reason: e.to_string(),
        })?;
        tracing::info!(server = %entry.server_id, pid = ?child.pid, "tool server spawned");
        Ok(Arc::new(StdioConnection::attach(
            &entry.server_id,
            child,
            self.stderr_lines,
        )))
    }
}

/// Tool server running as our child process.
pub struct StdioConnection {
    session: McpSession,
    control: ChildControl,
    exit: ExitWatch,
    stderr: StderrRing,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StdioConnection {
    pub fn attach(server_id: &str, child: ChildIo, stderr_lines: usize) -> Self {
        let ChildIo {
            stdin,
            stdout,
            stderr,
            exit,
            control,
            ..
        } = child;

        let rpc = Arc::new(RpcClient::new(
            server_id,
            Arc::new(PipeOutbound::new(server_id, stdin)),
        ));
        let ring = StderrRing::new(stderr_lines);
        let mut tasks = vec![tokio::spawn(pump_frames(
            rpc.clone(),
            FrameReader::start(server_id, stdout),
        ))];
        if let Some(stderr) = stderr {
            tasks.push(ring.capture(server_id, stderr));
        }

        let mut exit_watch = exit.clone();
        let exit_rpc = rpc.clone();
        let peer = server_id.to_string();
        tasks.push(tokio::spawn(async move {
            let report = exit_watch.wait().await;
            let rejected = exit_rpc.fail_all(|| RpcError::SubprocessExited {
                peer: peer.clone(),
                detail: report.detail.clone(),
            });
            tracing::info!(server = %peer, code = ?report.code, rejected, "tool server exited");
        }));

        Self {
            session: McpSession {
                server_id: server_id.to_string(),
                rpc,
            },
            control,
            exit,
            stderr: ring,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit.try_get().is_some()
    }
}

#[async_trait]
impl ToolServerConnection for StdioConnection {
    async fn handshake(&self) -> Result<(), SupervisorError> {
        self.session.handshake().await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SupervisorError> {
        self.session.list_tools().await
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SupervisorError> {
        self.session.call_tool(tool, arguments).await
    }

    fn diagnostics(&self) -> Vec<String> {
        self.stderr.snapshot()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.kill();
        self.session.rpc.close();
        abort_all(&self.tasks);
        tracing::debug!(server = %self.session.server_id, "stdio connection closed");
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        self.control.kill();
        abort_all(&self.tasks);
    }
}

// ─── SSE ─────────────────────────────────────────────────────────────────────

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Works on raw bytes and decodes only whole lines, so a multi-byte character
/// split across network chunks survives.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                if let Some(event) = parse_block(&self.lines) {
                    events.push(event);
                }
                self.lines.clear();
            } else {
                self.lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        events
    }
}

fn parse_block(lines: &[String]) -> Option<SseEvent> {
    let mut event = String::from("message");
    let mut data: Vec<&str> = Vec::new();
    for line in lines {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line.as_str(), ""),
        };
        match field {
            "event" => event = value.to_string(),
            "data" => data.push(value),
            _ => {}
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Connects to tool servers over HTTP + server-sent events.
pub struct SseConnector {
    http: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for SseConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn open(
        &self,
        entry: &ServerConfigEntry,
    ) -> Result<Arc<dyn ToolServerConnection>, SupervisorError> {
        let server_id = entry.server_id.clone();
        let connect_err = |reason: String| SupervisorError::Connect {
            server_id: server_id.clone(),
            reason,
        };

        let raw_url = entry
            .url
            .as_deref()
            .ok_or_else(|| connect_err("sse transport requires a url".into()))?;
        let base = reqwest::Url::parse(raw_url).map_err(|e| connect_err(format!("bad url: {e}")))?;

        let response = self
            .http
            .get(base.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| connect_err(e.to_string()))?;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SseEvent>();
        let stream_peer = server_id.clone();
        let stream_task = tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut parser = SseParser::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for event in parser.push(&chunk) {
                            if events_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %stream_peer, error = %e, "event stream error");
                        return;
                    }
                }
            }
        });

        // Stops the stream if we bail out (or are cancelled) before connecting.
        let mut stream_guard = AbortOnDrop(Some(stream_task.abort_handle()));

        // The first `endpoint` event tells us where to POST.
        let endpoint = loop {
            match events_rx.recv().await {
                Some(event) if event.event == "endpoint" => {
                    break base
                        .join(event.data.trim())
                        .map_err(|e| connect_err(format!("bad endpoint: {e}")))?;
                }
                Some(other) => {
                    tracing::debug!(server = %server_id, event = %other.event, "event before endpoint ignored");
                }
                None => {
                    return Err(connect_err("event stream closed before endpoint".into()));
                }
            }
        };
        stream_guard.disarm();
        tracing::info!(server = %server_id, endpoint = %endpoint, "sse tool server connected");

        let outbound = Arc::new(HttpOutbound {
            peer: server_id.clone(),
            http: self.http.clone(),
            endpoint,
        });
        let rpc = Arc::new(RpcClient::new(&server_id, outbound));

        let forward_rpc = rpc.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if event.event != "message" {
                    continue;
                }
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(value) => {
                        forward_rpc.dispatch_value(value);
                    }
                    Err(e) => {
                        tracing::warn!(peer = %forward_rpc.peer(), error = %e, "dropping malformed sse message");
                    }
                }
            }
            let peer = forward_rpc.peer().to_string();
            forward_rpc.fail_all(|| RpcError::Transport {
                peer: peer.clone(),
                reason: "event stream closed".into(),
            });
        });

        Ok(Arc::new(SseConnection {
            session: McpSession { server_id, rpc },
            tasks: Mutex::new(vec![stream_task, forward_task]),
            closed: AtomicBool::new(false),
        }))
    }
}

struct AbortOnDrop(Option<tokio::task::AbortHandle>);

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// POSTs each frame to the session endpoint.
struct HttpOutbound {
    peer: String,
    http: reqwest::Client,
    endpoint: reqwest::Url,
}

#[async_trait]
impl Outbound for HttpOutbound {
    async fn send(&self, message: &Message) -> Result<(), RpcError> {
        self.http
            .post(self.endpoint.clone())
            .json(&message.to_value())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| RpcError::Transport {
                peer: self.peer.clone(),
                reason: e.to_string(),
            })
    }
}

/// Tool server reached over SSE.
pub struct SseConnection {
    session: McpSession,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl ToolServerConnection for SseConnection {
    async fn handshake(&self) -> Result<(), SupervisorError> {
        self.session.handshake().await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, SupervisorError> {
        self.session.list_tools().await
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, SupervisorError> {
        self.session.call_tool(tool, arguments).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.rpc.close();
        abort_all(&self.tasks);
        tracing::debug!(server = %self.session.server_id, "sse connection closed");
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        abort_all(&self.tasks);
    }
}

/// Stderr suffix for an error message built from a connection's diagnostics.
pub fn diagnostics_suffix(conn: &dyn ToolServerConnection) -> String {
    format_stderr_suffix(&conn.diagnostics())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
