//! Agent-facing protocol server.
//!
//! Speaks the MCP subset an agent host needs (`initialize`, `ping`,
//! `tools/list`, `tools/call`) over this process's stdin/stdout. Tool
//! failures come back as tool results with `isError: true`, not as
//! protocol errors.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::config::GatewayConfig;
use super::context::{AppContext, Registry};
use super::dispatcher::Dispatcher;
use super::errors::GatewayError;
use super::tools::tool_definitions;
use crate::rpc::server::{method_not_found, parse_params};
use crate::rpc::{serve, RequestHandler, RpcErrorObject};
use crate::supervisor::connection::MCP_PROTOCOL_VERSION;

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: Option<String>,
}

pub struct GatewayService {
    dispatcher: Dispatcher,
}

impl GatewayService {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry),
        }
    }

    fn initialize(&self, params: InitializeParams) -> Value {
        let version = params
            .protocol_version
            .unwrap_or_else(|| MCP_PROTOCOL_VERSION.to_string());
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    async fn call_tool(&self, params: ToolCallParams) -> Value {
        match self.dispatcher.call(&params.name, params.arguments).await {
            Ok(result) => tool_result(&result, false),
            Err(e) => {
                tracing::warn!(tool = %params.name, error = %e, "tool call failed");
                tool_result(&Value::String(e.to_string()), true)
            }
        }
    }
}

/// Wrap a value as MCP text content.
fn tool_result(value: &Value, is_error: bool) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

#[async_trait]
impl RequestHandler for GatewayService {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, RpcErrorObject> {
        match method {
            "initialize" => Ok(self.initialize(parse_params(params)?)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_definitions() })),
            "tools/call" => Ok(self.call_tool(parse_params(params)?).await),
            _ => Err(method_not_found(method)),
        }
    }

    async fn on_notification(&self, method: &str, _params: Option<Value>) {
        tracing::debug!(method, "agent notification");
    }
}

/// Start managers, serve the agent on stdin/stdout, and stop everything at EOF.
pub async fn run_gateway(config: GatewayConfig) -> Result<(), GatewayError> {
    let registry = Arc::new(Registry::new());
    let runtimes = config.runtimes.clone();
    registry.init(AppContext::start(config)?);
    tracing::info!(runtimes = ?runtimes, "gateway ready");

    let service = Arc::new(GatewayService::new(registry.clone()));
    serve("agent", tokio::io::stdin(), tokio::io::stdout(), service).await;

    registry.reset();
    tracing::info!("gateway stopped");
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::gateway::testing::FakeCatalog;
    use crate::rpc::error_codes;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn ready_service(catalog: FakeCatalog) -> GatewayService {
        let registry = Arc::new(Registry::new());
        registry.init(AppContext::new(
            GatewayConfig::default(),
            Arc::new(catalog),
            BTreeMap::new(),
        ));
        GatewayService::new(registry)
    }

    #[tokio::test]
    async fn test_initialize_echoes_protocol_version() {
        let svc = GatewayService::new(Arc::new(Registry::new()));
        let result = svc
            .handle("initialize", Some(json!({"protocolVersion": "2025-03-26"})))
            .await
            .unwrap();
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], "toolgate");

        let result = svc.handle("initialize", None).await.unwrap();
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_tools_list_exposes_catalog() {
        let svc = GatewayService::new(Arc::new(Registry::new()));
        let result = svc.handle("tools/list", None).await.unwrap();
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 12);
        assert!(tools.iter().any(|t| t["name"] == "call_tool"));
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[tokio::test]
    async fn test_tool_errors_are_results() {
        let svc = GatewayService::new(Arc::new(Registry::new()));
        let result = svc
            .handle("tools/call", Some(json!({"name": "list_servers"})))
            .await
            .unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(
            result["content"][0]["text"],
            "application context accessed before initialization"
        );

        let result = svc
            .handle("tools/call", Some(json!({"name": "nope", "arguments": {}})))
            .await
            .unwrap();
        assert_eq!(result["isError"], true);
    }

    #[tokio::test]
    async fn test_tool_success_is_text_content() {
        let svc = ready_service(
            FakeCatalog::default().with_search_results(vec![json!({"server_id": "sv_1"})]),
        );
        let result = svc
            .handle(
                "tools/call",
                Some(json!({"name": "search", "arguments": {"query": "maps"}})),
            )
            .await
            .unwrap();
        assert_eq!(result["isError"], false);
        let text = result["content"][0]["text"].as_str().unwrap();
        let parsed: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["results"][0]["server_id"], "sv_1");
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let svc = GatewayService::new(Arc::new(Registry::new()));
        let err = svc.handle("tools/call", Some(json!({}))).await.unwrap_err();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
        let err = svc.handle("resources/list", None).await.unwrap_err();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serves_over_pipe() {
        let (mut agent, gateway) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(gateway);
        let svc = Arc::new(GatewayService::new(Arc::new(Registry::new())));
        let server = tokio::spawn(async move { serve("agent", read, write, svc).await });

        agent
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let (agent_read, mut agent_write) = tokio::io::split(agent);
        let mut lines = BufReader::new(agent_read).lines();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], json!({}));

        agent_write.shutdown().await.unwrap();
        drop(agent_write);
        drop(lines);
        server.await.unwrap();
    }
}
