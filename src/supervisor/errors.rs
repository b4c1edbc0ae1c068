//! Supervisor error types.
//!
//! Both enums are `Clone`: one install outcome is handed to every caller
//! that joined the same in-flight install.

use thiserror::Error;

/// Errors from the persistent configuration store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("failed to read config file '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("failed to write config file '{path}': {reason}")]
    Write { path: String, reason: String },

    #[error("failed to serialize config document: {reason}")]
    Serialize { reason: String },

    /// The writer task is gone (runtime shutting down).
    #[error("config store is not running")]
    Stopped,
}

/// Errors from supervisor operations.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("server '{server_id}' not found")]
    NotFound { server_id: String },

    #[error("invalid config for server '{server_id}': {reason}")]
    InvalidConfig { server_id: String, reason: String },

    /// The transport could not be opened (spawn failure, HTTP error).
    #[error("failed to connect to server '{server_id}': {reason}")]
    Connect { server_id: String, reason: String },

    /// The server answered the handshake or tool listing with an error.
    #[error("server '{server_id}' handshake failed: {reason}")]
    Handshake { server_id: String, reason: String },

    /// A connect, handshake, list or call did not finish in time.
    #[error("{operation} for server '{server_id}' timed out after {timeout_ms}ms{stderr}")]
    Timeout {
        server_id: String,
        operation: String,
        timeout_ms: u64,
        /// Captured stderr suffix (may be empty).
        stderr: String,
    },

    #[error("tool '{tool}' on server '{server_id}' failed: {reason}")]
    ToolCall {
        server_id: String,
        tool: String,
        reason: String,
    },

    /// The install task was cancelled or panicked.
    #[error("install of server '{server_id}' was aborted")]
    InstallAborted { server_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SupervisorError {
    /// Append a captured-stderr suffix to the error's message.
    pub fn with_stderr(self, suffix: &str) -> Self {
        if suffix.is_empty() {
            return self;
        }
        match self {
            SupervisorError::Connect { server_id, reason } => SupervisorError::Connect {
                server_id,
                reason: format!("{reason}{suffix}"),
            },
            SupervisorError::Handshake { server_id, reason } => SupervisorError::Handshake {
                server_id,
                reason: format!("{reason}{suffix}"),
            },
            SupervisorError::Timeout {
                server_id,
                operation,
                timeout_ms,
                stderr,
            } => SupervisorError::Timeout {
                server_id,
                operation,
                timeout_ms,
                stderr: format!("{stderr}{suffix}"),
            },
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SupervisorError::Timeout { .. })
    }
}
