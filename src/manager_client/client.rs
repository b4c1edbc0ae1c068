//! Process-manager client: owns one manager subprocess.
//!
//! Requests go out over the child's stdin, responses come back over its
//! stdout and are correlated by id. When the child exits, every request
//! still waiting is rejected so no caller hangs across a crash.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::process::child::ChildControl;
use crate::process::{spawn_child, ChildIo, ChildSpec, ExitWatch, ProcessError, StderrMode};
use crate::rpc::{FrameReader, PipeOutbound, RpcClient, RpcError};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the launch spec for a manager of `runtime` using our own executable.
/// `config` overrides the manager's default server config file.
pub fn manager_spec(exe: &Path, runtime: &str, config: Option<&Path>) -> ChildSpec {
    let mut args = vec!["manager".to_string(), "--runtime".into(), runtime.to_string()];
    if let Some(config) = config {
        args.push("--config".into());
        args.push(config.to_string_lossy().into_owned());
    }
    ChildSpec::new(exe.to_string_lossy().into_owned())
        .args(args)
        .stderr(StderrMode::Inherit)
}

// ─── ProcessManagerClient ────────────────────────────────────────────────────

pub struct ProcessManagerClient {
    runtime: String,
    rpc: Arc<RpcClient>,
    exit: ExitWatch,
    control: ChildControl,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProcessManagerClient {
    /// Spawn a manager process and start talking to it.
    pub fn spawn(runtime: &str, spec: &ChildSpec) -> Result<Self, ProcessError> {
        let child = spawn_child(&format!("manager:{runtime}"), spec)?;
        tracing::info!(runtime, pid = ?child.pid, "manager process started");
        Ok(Self::attach(runtime, child))
    }

    /// Wrap an already running child (real or in-memory).
    pub fn attach(runtime: &str, child: ChildIo) -> Self {
        let ChildIo {
            stdin,
            stdout,
            stderr,
            exit,
            control,
            ..
        } = child;

        let outbound = Arc::new(PipeOutbound::new(runtime, stdin));
        let rpc = Arc::new(RpcClient::new(runtime, outbound));
        let mut tasks = Vec::new();

        let reader = FrameReader::start(runtime, stdout);
        tasks.push(tokio::spawn(read_loop(rpc.clone(), reader)));

        if let Some(stderr) = stderr {
            let source = format!("manager:{runtime}");
            tasks.push(tokio::spawn(forward_stderr(source, stderr)));
        }

        let mut exit_watch = exit.clone();
        let exit_rpc = rpc.clone();
        let exit_runtime = runtime.to_string();
        tasks.push(tokio::spawn(async move {
            let report = exit_watch.wait().await;
            let rejected = exit_rpc.fail_all(|| RpcError::SubprocessExited {
                peer: exit_runtime.clone(),
                detail: report.detail.clone(),
            });
            tracing::warn!(
                runtime = %exit_runtime,
                code = ?report.code,
                rejected,
                "manager process exited"
            );
        }));

        Self {
            runtime: runtime.to_string(),
            rpc,
            exit,
            control,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Whether the child is alive and `stop` has not been called.
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.exit.try_get().is_none()
    }

    /// Requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.rpc.pending_count()
    }

    /// Send a request with the default 60 s timeout.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.send_request_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if let Some(report) = self.exit.try_get() {
            return Err(RpcError::SubprocessExited {
                peer: self.runtime.clone(),
                detail: report.detail,
            });
        }
        tracing::debug!(runtime = %self.runtime, method, "sending manager request");
        self.rpc.request(method, Some(params), timeout).await
    }

    /// Kill the child and reject anything pending. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.control.kill();
        self.rpc.close();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        tracing::info!(runtime = %self.runtime, "manager process stopped");
    }
}

impl Drop for ProcessManagerClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop(rpc: Arc<RpcClient>, mut reader: FrameReader) {
    while let Some(value) = reader.recv().await {
        if let Some(unsolicited) = rpc.dispatch_value(value) {
            tracing::debug!(peer = %rpc.peer(), message = ?unsolicited, "ignoring unsolicited manager message");
        }
    }
    let peer = rpc.peer().to_string();
    let rejected = rpc.fail_all(|| RpcError::SubprocessExited {
        peer: peer.clone(),
        detail: "stdout closed".into(),
    });
    if rejected > 0 {
        tracing::warn!(peer = %peer, rejected, "manager stdout closed with requests pending");
    }
}

async fn forward_stderr(source: String, stderr: crate::process::child::BoxedReader) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(source = %source, "{line}");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
