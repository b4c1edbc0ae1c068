//! The outer gateway process.
//!
//! - `config`: gateway settings from `config.yaml` and the environment
//! - `policy`: blocked / allowed server lists
//! - `catalog`: remote catalog HTTP client
//! - `context`: the application context and its init/reset registry
//! - `tools`: the fixed agent tool catalog and argument validation
//! - `dispatcher`: routes tool calls to the catalog or the managers
//! - `service`: the agent-facing protocol server

pub mod catalog;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod policy;
pub mod service;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{CatalogApi, CatalogClient, InstallSpec, SearchScope, TelemetryEvent};
pub use config::GatewayConfig;
pub use context::{AppContext, AppState, Registry};
pub use dispatcher::Dispatcher;
pub use errors::{CatalogError, GatewayError};
pub use policy::{filter_servers_by_policy, ServerPolicy};
pub use service::{run_gateway, GatewayService};
pub use tools::{tool_definitions, ToolInvocation};
