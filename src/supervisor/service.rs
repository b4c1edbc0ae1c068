//! The manager process: a supervisor served over stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::connection::DefaultConnector;
use super::errors::SupervisorError;
use super::store::{ConfigStore, CONFIG_FILE_NAME};
use super::supervisor::{Supervisor, SupervisorOptions};
use super::types::ServerConfigEntry;
use crate::process::stderr::DEFAULT_STDERR_LINES;
use crate::rpc::server::{handler_error, method_not_found, parse_params};
use crate::rpc::{serve, RequestHandler, RpcErrorObject};

// ─── Methods ─────────────────────────────────────────────────────────────────

/// The manager's closed method set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerMethod {
    Install,
    Uninstall,
    CallTool,
    ListTools,
    ListServers,
    GetServerConfig,
}

impl ManagerMethod {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "install" => Self::Install,
            "uninstall" => Self::Uninstall,
            "call_tool" => Self::CallTool,
            "list_tools" => Self::ListTools,
            "list_servers" => Self::ListServers,
            "get_server_config" => Self::GetServerConfig,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::CallTool => "call_tool",
            Self::ListTools => "list_tools",
            Self::ListServers => "list_servers",
            Self::GetServerConfig => "get_server_config",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerIdParams {
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub server_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

// ─── Service ─────────────────────────────────────────────────────────────────

/// Maps manager methods onto supervisor operations.
pub struct ManagerService {
    supervisor: Supervisor,
}

impl ManagerService {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    async fn dispatch(
        &self,
        method: ManagerMethod,
        params: Option<Value>,
    ) -> Result<Value, RpcErrorObject> {
        let sup = &self.supervisor;
        match method {
            ManagerMethod::Install => {
                let entry: ServerConfigEntry = parse_params(params)?;
                encode(sup.install(entry).await.map_err(handler_error)?)
            }
            ManagerMethod::Uninstall => {
                let p: ServerIdParams = parse_params(params)?;
                let removed = sup.uninstall(&p.server_id).await.map_err(handler_error)?;
                Ok(json!({ "server_id": p.server_id, "removed": removed }))
            }
            ManagerMethod::CallTool => {
                let p: CallToolParams = parse_params(params)?;
                let arguments = if p.arguments.is_null() {
                    json!({})
                } else {
                    p.arguments
                };
                sup.call_tool(
                    &p.server_id,
                    &p.tool_name,
                    arguments,
                    p.timeout_ms.map(Duration::from_millis),
                )
                .await
                .map_err(handler_error)
            }
            ManagerMethod::ListTools => {
                let p: ListToolsParams = parse_params(params)?;
                let servers = sup
                    .list_tools(p.server_id.as_deref())
                    .await
                    .map_err(handler_error)?;
                Ok(json!({ "servers": servers }))
            }
            ManagerMethod::ListServers => Ok(json!({ "servers": sup.list_servers() })),
            ManagerMethod::GetServerConfig => {
                let p: ServerIdParams = parse_params(params)?;
                encode(sup.get_server_config(&p.server_id).map_err(handler_error)?)
            }
        }
    }
}

fn encode<T: Serialize>(value: T) -> Result<Value, RpcErrorObject> {
    serde_json::to_value(value).map_err(handler_error)
}

#[async_trait]
impl RequestHandler for ManagerService {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        let Some(parsed) = ManagerMethod::parse(method) else {
            return Err(method_not_found(method));
        };
        tracing::debug!(method, "manager request");
        self.dispatch(parsed, params).await
    }
}

// ─── Settings & entry point ──────────────────────────────────────────────────

/// Everything a manager process needs to start.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub runtime: String,
    pub config_path: PathBuf,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub stderr_lines: usize,
}

impl ManagerSettings {
    /// Defaults for `runtime`, with env overrides:
    /// `TOOLGATE_HANDSHAKE_TIMEOUT_MS`, `TOOLGATE_CALL_TIMEOUT_MS`,
    /// `TOOLGATE_STDERR_LINES`.
    pub fn from_env(runtime: &str) -> Self {
        let defaults = SupervisorOptions::default();
        Self {
            runtime: runtime.to_string(),
            config_path: Self::default_config_path(runtime),
            handshake_timeout: env_millis("TOOLGATE_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.handshake_timeout),
            call_timeout: env_millis("TOOLGATE_CALL_TIMEOUT_MS").unwrap_or(defaults.call_timeout),
            stderr_lines: std::env::var("TOOLGATE_STDERR_LINES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_STDERR_LINES),
        }
    }

    /// `<data dir>/runtimes/<runtime>/servers.json`
    pub fn default_config_path(runtime: &str) -> PathBuf {
        crate::data_dir()
            .join("runtimes")
            .join(runtime)
            .join(CONFIG_FILE_NAME)
    }

    pub fn options(&self) -> SupervisorOptions {
        SupervisorOptions {
            handshake_timeout: self.handshake_timeout,
            call_timeout: self.call_timeout,
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Run a manager on this process's stdin/stdout until stdin closes.
pub async fn run_manager(settings: ManagerSettings) -> Result<(), SupervisorError> {
    let store = ConfigStore::open(&settings.config_path);
    let connector = Arc::new(DefaultConnector::new(settings.stderr_lines));
    let supervisor = Supervisor::start(connector, store, settings.options()).await?;

    tracing::info!(
        runtime = %settings.runtime,
        config = %settings.config_path.display(),
        "manager ready"
    );

    let service = Arc::new(ManagerService::new(supervisor.clone()));
    serve(
        &format!("manager:{}", settings.runtime),
        tokio::io::stdin(),
        tokio::io::stdout(),
        service,
    )
    .await;

    supervisor.shutdown().await;
    tracing::info!(runtime = %settings.runtime, "manager stopped");
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error_codes;
    use crate::supervisor::testing::{entry, FakeConnector, Script};

    async fn service(dir: &std::path::Path) -> ManagerService {
        let connector = Arc::new(FakeConnector::new(Arc::new(Script::default())));
        let store = ConfigStore::open(dir.join(CONFIG_FILE_NAME));
        let sup = Supervisor::start(connector, store, SupervisorOptions::default())
            .await
            .unwrap();
        ManagerService::new(sup)
    }

    #[test]
    fn test_method_names_round_trip() {
        for m in [
            ManagerMethod::Install,
            ManagerMethod::Uninstall,
            ManagerMethod::CallTool,
            ManagerMethod::ListTools,
            ManagerMethod::ListServers,
            ManagerMethod::GetServerConfig,
        ] {
            assert_eq!(ManagerMethod::parse(m.as_str()), Some(m));
        }
        assert_eq!(ManagerMethod::parse("restart"), None);
    }

    #[tokio::test]
    async fn test_install_call_and_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;

        let installed = svc
            .handle("install", Some(serde_json::to_value(entry("sv_1")).unwrap()))
            .await
            .unwrap();
        assert_eq!(installed["server_id"], "sv_1");
        assert_eq!(installed["tools"][0]["name"], "echo");

        let result = svc
            .handle(
                "call_tool",
                Some(json!({"server_id": "sv_1", "tool_name": "echo", "arguments": {"q": "hi"}})),
            )
            .await
            .unwrap();
        assert_eq!(result["echo"], json!({"q": "hi"}));

        let servers = svc.handle("list_servers", None).await.unwrap();
        assert_eq!(servers["servers"][0]["connected"], true);

        let removed = svc
            .handle("uninstall", Some(json!({"server_id": "sv_1"})))
            .await
            .unwrap();
        assert_eq!(removed["removed"], true);
        let again = svc
            .handle("uninstall", Some(json!({"server_id": "sv_1"})))
            .await
            .unwrap();
        assert_eq!(again["removed"], false);
    }

    #[tokio::test]
    async fn test_errors_map_to_codes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;

        let err = svc
            .handle("get_server_config", Some(json!({"server_id": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::HANDLER_ERROR);
        assert_eq!(err.message, "server 'x' not found");

        let err = svc.handle("call_tool", Some(json!({}))).await.unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);

        let err = svc.handle("reboot", None).await.unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_tools_without_id_returns_connected_only() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let tools = svc.handle("list_tools", None).await.unwrap();
        assert_eq!(tools, json!({"servers": []}));
    }
}
