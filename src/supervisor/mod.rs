//! Tool-Server Supervisor: the inner manager process.
//!
//! - `types`: config entries, tool definitions, status rows
//! - `store`: the persisted config document
//! - `connection`: stdio and SSE tool-server transports
//! - `supervisor`: install / call / uninstall state machine
//! - `service`: the manager's request loop

pub mod connection;
pub mod errors;
pub mod service;
pub mod store;
#[allow(clippy::module_inception)]
pub mod supervisor;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{Connector, DefaultConnector, ToolServerConnection};
pub use errors::{StoreError, SupervisorError};
pub use service::{run_manager, ManagerMethod, ManagerService, ManagerSettings};
pub use store::ConfigStore;
pub use supervisor::{Supervisor, SupervisorOptions};
pub use types::{
    ServerConfigEntry, ServerState, ServerStatus, ServerTools, ToolDefinition, TransportKind,
    DEFAULT_RUNTIME,
};
