//! RPC error types.

use thiserror::Error;

/// Errors surfaced to a caller of a correlated request.
///
/// `Clone` so one failure (e.g. a process exit) can be delivered to every
/// waiter of the pending table.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// No response arrived inside the request's timeout window.
    #[error("request '{method}' to '{peer}' timed out after {timeout_ms}ms")]
    Timeout {
        peer: String,
        method: String,
        timeout_ms: u64,
    },

    /// The peer process exited while the request was pending.
    #[error("subprocess '{peer}' exited: {detail}")]
    SubprocessExited { peer: String, detail: String },

    /// The peer answered with an error object.
    #[error("{message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Writing the request failed (broken pipe, HTTP failure).
    #[error("transport error for '{peer}': {reason}")]
    Transport { peer: String, reason: String },

    /// The client was stopped before a response arrived.
    #[error("connection to '{peer}' closed")]
    Closed { peer: String },
}

impl RpcError {
    /// Whether the error came from the watchdog rather than the peer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_message_only() {
        let err = RpcError::Remote {
            code: -1000,
            message: "server 'x' not found".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "server 'x' not found");
    }

    #[test]
    fn test_timeout_message_names_method() {
        let err = RpcError::Timeout {
            peer: "node".into(),
            method: "install".into(),
            timeout_ms: 100,
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("'install'"));
        assert!(err.to_string().contains("timed out"));
    }
}
