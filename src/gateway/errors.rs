//! Gateway error types.

use thiserror::Error;

use crate::process::ProcessError;
use crate::rpc::RpcError;

/// Errors from the remote catalog API.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// The request never got a response (DNS, connect, timeout).
    #[error("catalog request to '{endpoint}' failed: {reason}")]
    Http { endpoint: String, reason: String },

    /// Non-2xx status.
    #[error("catalog returned {status} for '{endpoint}': {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("unexpected catalog response from '{endpoint}': {reason}")]
    Decode { endpoint: String, reason: String },
}

/// Errors surfaced to the agent for one tool invocation.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Something was accessed before the registry was initialized.
    #[error("{what} accessed before initialization")]
    NotInitialized { what: &'static str },

    /// The server is on the deny list or missing from the allow list.
    #[error("server '{server_id}' is blocked by policy: {reason}")]
    PolicyBlocked { server_id: String, reason: String },

    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("no manager running for runtime '{runtime}'")]
    NoManager { runtime: String },

    /// A manager answered with an error, timed out, or died.
    #[error("{source}")]
    Manager {
        runtime: String,
        #[source]
        source: RpcError,
    },

    #[error("failed to start manager for runtime '{runtime}': {source}")]
    ManagerSpawn {
        runtime: String,
        #[source]
        source: ProcessError,
    },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("config error: {reason}")]
    Config { reason: String },
}
