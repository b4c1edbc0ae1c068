//! Typed child-process handle.
//!
//! `spawn_child` turns a `ChildSpec` into a `ChildIo`: boxed stdio pipes, an
//! exit watch, and a kill switch. The OS `Child` itself is owned by a small
//! waiter task, so any number of holders can observe the exit while one of
//! them asks for a kill. Tests build the same `ChildIo` from in-memory pipes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};

use super::errors::ProcessError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Spec ────────────────────────────────────────────────────────────────────

/// What to do with the child's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Pass straight through to our own stderr.
    Inherit,
    /// Hand the pipe back in `ChildIo::stderr`.
    Capture,
    Discard,
}

/// Everything needed to launch a child process.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stderr: StderrMode,
}

impl ChildSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stderr: StderrMode::Capture,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }
}

/// Platform-correct name for package-manager launchers.
///
/// On Windows `npx`, `npm` and friends are batch shims; `Command::new("npx")`
/// fails without the `.cmd` extension.
pub fn platform_command(command: &str) -> String {
    const SHIMS: [&str; 5] = ["npx", "npm", "pnpm", "yarn", "bunx"];
    if cfg!(target_os = "windows") && SHIMS.contains(&command) {
        format!("{command}.cmd")
    } else {
        command.to_string()
    }
}

// ─── Exit Watch ──────────────────────────────────────────────────────────────

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub detail: String,
}

impl ExitReport {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            detail: status.to_string(),
        }
    }
}

/// Observes the child's exit; cheap to clone.
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<ExitReport>>,
}

impl ExitWatch {
    /// The exit report, if the child has already exited.
    pub fn try_get(&self) -> Option<ExitReport> {
        self.rx.borrow().clone()
    }

    /// Wait until the child exits.
    pub async fn wait(&mut self) -> ExitReport {
        loop {
            if let Some(report) = self.rx.borrow_and_update().clone() {
                return report;
            }
            if self.rx.changed().await.is_err() {
                return self.try_get().unwrap_or(ExitReport {
                    code: None,
                    detail: "exit watcher dropped".into(),
                });
            }
        }
    }
}

// ─── Control ─────────────────────────────────────────────────────────────────

/// Kill switch for a child. Dropping it also kills the child.
#[derive(Debug)]
pub struct ChildControl {
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ChildControl {
    fn new(kill_tx: oneshot::Sender<()>) -> Self {
        Self {
            kill_tx: Mutex::new(Some(kill_tx)),
        }
    }

    /// Ask the child to be killed. Returns `false` if already requested.
    pub fn kill(&self) -> bool {
        let sender = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

// ─── ChildIo ─────────────────────────────────────────────────────────────────

/// A running child: pipes, exit watch, kill switch.
pub struct ChildIo {
    pub name: String,
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub exit: ExitWatch,
    pub control: ChildControl,
}

/// Spawn `spec` as an OS process with piped stdin/stdout.
pub fn spawn_child(name: &str, spec: &ChildSpec) -> Result<ChildIo, ProcessError> {
    let mut cmd = Command::new(platform_command(&spec.command));
    cmd.args(&spec.args);
    cmd.envs(&spec.env);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(match spec.stderr {
        StderrMode::Inherit => std::process::Stdio::inherit(),
        StderrMode::Capture => std::process::Stdio::piped(),
        StderrMode::Discard => std::process::Stdio::null(),
    });
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
        name: name.to_string(),
        command: spec.command.clone(),
        reason: e.to_string(),
    })?;

    let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe {
        name: name.to_string(),
        pipe: "stdin",
    })?;
    let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe {
        name: name.to_string(),
        pipe: "stdout",
    })?;
    let stderr = child
        .stderr
        .take()
        .map(|pipe| Box::new(pipe) as BoxedReader);
    let pid = child.id();

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, kill_rx) = oneshot::channel::<()>();

    let task_name = name.to_string();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(child = %task_name, error = %e, "kill failed (already exited?)");
                }
                child.wait().await
            }
        };
        let report = match status {
            Ok(status) => ExitReport::from_status(status),
            Err(e) => ExitReport {
                code: None,
                detail: format!("wait failed: {e}"),
            },
        };
        tracing::debug!(child = %task_name, code = ?report.code, "child exited");
        let _ = exit_tx.send(Some(report));
    });

    tracing::debug!(child = name, pid = ?pid, command = %spec.command, "spawned child process");

    Ok(ChildIo {
        name: name.to_string(),
        pid,
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr,
        exit: ExitWatch { rx: exit_rx },
        control: ChildControl::new(kill_tx),
    })
}

// ─── In-memory fake ──────────────────────────────────────────────────────────

/// In-memory stand-in for a child process, for tests.
#[cfg(test)]
pub mod fake {
    use std::sync::Arc;

    use tokio::io::DuplexStream;

    use super::*;

    /// The "child side" of an in-memory `ChildIo`.
    pub struct FakeChild {
        /// Reads what the parent wrote to the child's stdin.
        pub stdin: DuplexStream,
        /// Writes what the parent reads from the child's stdout.
        pub stdout: DuplexStream,
        /// Writes what the parent reads from the child's stderr.
        pub stderr: DuplexStream,
        exit_tx: Arc<watch::Sender<Option<ExitReport>>>,
    }

    impl FakeChild {
        /// Simulate the process exiting with `code`.
        pub fn exit(&self, code: i32) {
            let _ = self.exit_tx.send(Some(ExitReport {
                code: Some(code),
                detail: format!("exit status: {code}"),
            }));
        }
    }

    /// Build a connected `(ChildIo, FakeChild)` pair.
    ///
    /// A kill request makes the fake exit with `detail = "killed"`.
    pub fn in_memory(name: &str) -> (ChildIo, FakeChild) {
        let (parent_stdin, child_stdin) = tokio::io::duplex(64 * 1024);
        let (child_stdout, parent_stdout) = tokio::io::duplex(64 * 1024);
        let (child_stderr, parent_stderr) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let on_kill = exit_tx.clone();
        tokio::spawn(async move {
            if kill_rx.await.is_ok() {
                let _ = on_kill.send(Some(ExitReport {
                    code: None,
                    detail: "killed".into(),
                }));
            }
        });

        let io = ChildIo {
            name: name.to_string(),
            pid: None,
            stdin: Box::new(parent_stdin),
            stdout: Box::new(parent_stdout),
            stderr: Some(Box::new(parent_stderr)),
            exit: ExitWatch { rx: exit_rx },
            control: ChildControl::new(kill_tx),
        };
        let fake = FakeChild {
            stdin: child_stdin,
            stdout: child_stdout,
            stderr: child_stderr,
            exit_tx,
        };
        (io, fake)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
