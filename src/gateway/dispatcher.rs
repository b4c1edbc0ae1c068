//! Outer dispatcher: routes validated tool invocations.
//!
//! Catalog tools are relayed to the remote API. Server tools go to the
//! manager that owns the server's runtime; listing tools fan out to every
//! manager, skip the ones that fail, and merge what comes back. Policy is
//! checked before anything is spawned or looked up, and server-identifying
//! results are filtered through it before they leave the gateway.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::{json, Value};

use super::catalog::{InstallSpec, TelemetryEvent};
use super::context::{AppContext, Registry};
use super::errors::GatewayError;
use super::policy::filter_servers_by_policy;
use super::tools::ToolInvocation;
use crate::manager_client::ProcessManagerClient;
use crate::supervisor::ManagerMethod;

pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Validate and run one tool call by name.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value, GatewayError> {
        let invocation = ToolInvocation::parse(name, arguments)?;
        self.dispatch(invocation).await
    }

    pub async fn dispatch(&self, invocation: ToolInvocation) -> Result<Value, GatewayError> {
        let ctx = self.registry.get()?;
        if let Some(server_id) = invocation.server_id() {
            ctx.policy().ensure_allowed(server_id)?;
        }
        tracing::debug!(tool = invocation.name(), "dispatching tool call");

        match invocation {
            ToolInvocation::Initialize(client) => initialize(&ctx, client).await,
            ToolInvocation::Search {
                query,
                scope,
                limit,
            } => {
                let mut result = ctx.catalog().search(&query, scope, limit).await?;
                filter_result_list(&ctx, &mut result, "results");
                Ok(result)
            }
            ToolInvocation::LookupEntity { entity_id } => {
                let result = ctx.catalog().lookup_entity(&entity_id).await?;
                if let Some(server_id) = result.get("server_id").and_then(Value::as_str) {
                    ctx.policy().ensure_allowed(server_id)?;
                }
                Ok(result)
            }
            ToolInvocation::Install { server_id, env } => {
                let started = Instant::now();
                let outcome = install(&ctx, &server_id, &env).await;
                report(&ctx, "install", Some(&server_id), None, started, &outcome);
                outcome
            }
            ToolInvocation::Uninstall { server_id } => uninstall(&ctx, &server_id).await,
            ToolInvocation::CallTool {
                server_id,
                tool_name,
                arguments,
            } => {
                let started = Instant::now();
                let outcome = call_tool(&ctx, &server_id, &tool_name, arguments).await;
                report(&ctx, "call_tool", Some(&server_id), Some(&tool_name), started, &outcome);
                outcome
            }
            ToolInvocation::ListTools {
                server_id: Some(server_id),
            } => {
                let (runtime, manager) = owner(&ctx, &server_id).await?;
                request(
                    &runtime,
                    &manager,
                    ManagerMethod::ListTools,
                    json!({ "server_id": server_id }),
                    ctx.config().install_timeout,
                )
                .await
            }
            ToolInvocation::ListTools { server_id: None } => {
                let timeout = ctx.config().install_timeout;
                Ok(fan_out_servers(&ctx, ManagerMethod::ListTools, timeout).await)
            }
            ToolInvocation::ListServers {} => {
                let timeout = ctx.config().request_timeout;
                Ok(fan_out_servers(&ctx, ManagerMethod::ListServers, timeout).await)
            }
            ToolInvocation::GetServerConfig { server_id } => {
                let (runtime, manager) = owner(&ctx, &server_id).await?;
                request(
                    &runtime,
                    &manager,
                    ManagerMethod::GetServerConfig,
                    json!({ "server_id": server_id }),
                    ctx.config().request_timeout,
                )
                .await
            }
            ToolInvocation::SavePlaybook(playbook) => Ok(ctx.catalog().save_playbook(playbook).await?),
            ToolInvocation::LogPlaybookUsage(usage) => {
                Ok(ctx.catalog().log_playbook_usage(usage).await?)
            }
            ToolInvocation::SubmitFeedback(feedback) => {
                Ok(ctx.catalog().submit_feedback(feedback).await?)
            }
        }
    }
}

// ─── Catalog operations ──────────────────────────────────────────────────────

async fn initialize(ctx: &AppContext, client: Value) -> Result<Value, GatewayError> {
    let response = ctx.catalog().init(ctx.session_id(), client).await?;
    let runtimes: Vec<String> = ctx.managers().into_iter().map(|(rt, _)| rt).collect();
    Ok(json!({
        "session_id": ctx.session_id(),
        "instructions": response.get("instructions").cloned().unwrap_or(Value::Null),
        "runtimes": runtimes,
    }))
}

/// Resolve an install spec, from the session cache when possible.
async fn install_spec(ctx: &AppContext, server_id: &str) -> Result<InstallSpec, GatewayError> {
    if let Some(spec) = ctx.cached_spec(server_id) {
        return Ok(spec);
    }
    let spec = ctx.catalog().resolve_install_spec(server_id).await?;
    tracing::debug!(server = %server_id, runtime = %spec.runtime, "resolved install spec");
    ctx.cache_spec(spec.clone());
    Ok(spec)
}

// ─── Server operations ───────────────────────────────────────────────────────

async fn install(
    ctx: &AppContext,
    server_id: &str,
    env: &std::collections::BTreeMap<String, String>,
) -> Result<Value, GatewayError> {
    let entry = install_spec(ctx, server_id).await?.into_entry(env);
    let runtime = entry.runtime.clone();
    let manager = ctx.manager(&runtime)?;
    let params = serde_json::to_value(&entry).map_err(|e| GatewayError::InvalidArguments {
        tool: "install".into(),
        reason: e.to_string(),
    })?;

    let result = request(
        &runtime,
        &manager,
        ManagerMethod::Install,
        params,
        ctx.config().install_timeout,
    )
    .await?;
    ctx.record_owner(server_id, &runtime);
    tracing::info!(server = %server_id, runtime = %runtime, "server installed");
    Ok(result)
}

async fn uninstall(ctx: &AppContext, server_id: &str) -> Result<Value, GatewayError> {
    let (runtime, manager) = owner(ctx, server_id).await?;
    let result = request(
        &runtime,
        &manager,
        ManagerMethod::Uninstall,
        json!({ "server_id": server_id }),
        ctx.config().request_timeout,
    )
    .await?;
    ctx.forget_owner(server_id);
    Ok(result)
}

async fn call_tool(
    ctx: &AppContext,
    server_id: &str,
    tool_name: &str,
    arguments: Option<Value>,
) -> Result<Value, GatewayError> {
    let (runtime, manager) = owner(ctx, server_id).await?;
    let config = ctx.config();
    let params = json!({
        "server_id": server_id,
        "tool_name": tool_name,
        "arguments": arguments.unwrap_or_else(|| json!({})),
        "timeout_ms": config.call_timeout.as_millis() as u64,
    });
    // The manager may reconnect before calling, so allow for an install too.
    let timeout = config.call_timeout + config.install_timeout;
    request(&runtime, &manager, ManagerMethod::CallTool, params, timeout).await
}

/// The manager owning `server_id`.
///
/// Unknown servers are probed with `get_server_config` on every manager;
/// when nobody claims it, the default runtime is used.
async fn owner(
    ctx: &AppContext,
    server_id: &str,
) -> Result<(String, Arc<ProcessManagerClient>), GatewayError> {
    if let Some(runtime) = ctx.owner_of(server_id) {
        return Ok((runtime.clone(), ctx.manager(&runtime)?));
    }

    let timeout = ctx.config().request_timeout;
    let probes = ctx.managers().into_iter().map(|(runtime, manager)| async move {
        manager
            .send_request_with_timeout(
                ManagerMethod::GetServerConfig.as_str(),
                json!({ "server_id": server_id }),
                timeout,
            )
            .await
            .ok()
            .map(|_| runtime)
    });
    let found = join_all(probes).await.into_iter().flatten().next();

    let runtime = match found {
        Some(runtime) => {
            ctx.record_owner(server_id, &runtime);
            runtime
        }
        None => ctx.default_runtime().to_string(),
    };
    tracing::debug!(server = %server_id, runtime = %runtime, "resolved server owner");
    Ok((runtime.clone(), ctx.manager(&runtime)?))
}

async fn request(
    runtime: &str,
    manager: &ProcessManagerClient,
    method: ManagerMethod,
    params: Value,
    timeout: Duration,
) -> Result<Value, GatewayError> {
    manager
        .send_request_with_timeout(method.as_str(), params, timeout)
        .await
        .map_err(|source| GatewayError::Manager {
            runtime: runtime.to_string(),
            source,
        })
}

/// Ask every manager for its `servers` list and merge them.
async fn fan_out_servers(ctx: &AppContext, method: ManagerMethod, timeout: Duration) -> Value {
    let calls = ctx.managers().into_iter().map(|(runtime, manager)| async move {
        let result = request(&runtime, &manager, method, json!({}), timeout).await;
        (runtime, result)
    });

    let mut servers = Vec::new();
    for (runtime, result) in join_all(calls).await {
        match result {
            Ok(mut value) => {
                if let Some(Value::Array(rows)) = value.get_mut("servers").map(Value::take) {
                    for row in &rows {
                        if let Some(id) = row.get("server_id").and_then(Value::as_str) {
                            ctx.record_owner(id, &runtime);
                        }
                    }
                    servers.extend(rows);
                }
            }
            Err(e) => {
                tracing::warn!(runtime = %runtime, method = method.as_str(), error = %e, "skipping runtime in fan-out");
            }
        }
    }

    let servers = filter_servers_by_policy(ctx.policy(), servers, |row| {
        row.get("server_id").and_then(Value::as_str)
    });
    json!({ "servers": servers })
}

/// Drop policy-denied entries from `result[key]` in place.
fn filter_result_list(ctx: &AppContext, result: &mut Value, key: &str) {
    if let Some(Value::Array(items)) = result.get_mut(key).map(Value::take) {
        let kept = filter_servers_by_policy(ctx.policy(), items, |item| {
            item.get("server_id").and_then(Value::as_str)
        });
        result[key] = Value::Array(kept);
    }
}

// ─── Telemetry ───────────────────────────────────────────────────────────────

/// Fire-and-forget usage event; failures are only logged.
fn report(
    ctx: &AppContext,
    event: &str,
    server_id: Option<&str>,
    tool: Option<&str>,
    started: Instant,
    outcome: &Result<Value, GatewayError>,
) {
    let event = TelemetryEvent {
        session_id: ctx.session_id().to_string(),
        event: event.to_string(),
        server_id: server_id.map(str::to_string),
        tool: tool.map(str::to_string),
        success: outcome.is_ok(),
        duration_ms: started.elapsed().as_millis() as u64,
        error: outcome.as_ref().err().map(|e| e.to_string()),
        timestamp: chrono::Utc::now(),
    };
    let catalog = ctx.catalog();
    tokio::spawn(async move {
        if let Err(e) = catalog.send_telemetry(&event).await {
            tracing::debug!(error = %e, "telemetry event dropped");
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::Ordering;

    use crate::gateway::config::GatewayConfig;
    use crate::gateway::testing::FakeCatalog;
    use crate::process::child::fake;
    use crate::rpc::serve;
    use crate::supervisor::testing::{entry, FakeConnector, Script};
    use crate::supervisor::{ConfigStore, ManagerService, Supervisor, SupervisorOptions};

    struct Harness {
        dispatcher: Dispatcher,
        catalog: Arc<FakeCatalog>,
        scripts: HashMap<String, Arc<Script>>,
        _dir: tempfile::TempDir,
    }

    /// Gateway wired to in-memory managers, one per runtime.
    ///
    /// `seed` lists `(runtime, server_id)` entries already persisted by that
    /// runtime's manager.
    async fn harness(
        runtimes: &[&str],
        seed: &[(&str, &str)],
        catalog: FakeCatalog,
        config: GatewayConfig,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut managers = BTreeMap::new();
        let mut scripts = HashMap::new();

        for rt in runtimes {
            let store = ConfigStore::open(dir.path().join(rt).join("servers.json"));
            for (seed_rt, id) in seed {
                if seed_rt == rt {
                    let mut e = entry(id);
                    e.runtime = rt.to_string();
                    store.upsert(e).await.unwrap();
                }
            }
            let script = Arc::new(Script::default());
            let connector = Arc::new(FakeConnector::new(script.clone()));
            let sup = Supervisor::start(connector, store, SupervisorOptions::default())
                .await
                .unwrap();

            let (io, child) = fake::in_memory(rt);
            let fake::FakeChild { stdin, stdout, .. } = child;
            let peer = format!("manager:{rt}");
            tokio::spawn(async move {
                serve(&peer, stdin, stdout, Arc::new(ManagerService::new(sup))).await;
            });

            managers.insert(rt.to_string(), Arc::new(ProcessManagerClient::attach(rt, io)));
            scripts.insert(rt.to_string(), script);
        }

        let catalog = Arc::new(catalog);
        let registry = Arc::new(Registry::new());
        registry.init(AppContext::new(config, catalog.clone(), managers));
        Harness {
            dispatcher: Dispatcher::new(registry),
            catalog,
            scripts,
            _dir: dir,
        }
    }

    fn ids(value: &Value) -> Vec<String> {
        value["servers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["server_id"].as_str().unwrap().to_string())
            .collect()
    }

    fn blocking(ids: &[&str]) -> GatewayConfig {
        GatewayConfig {
            blocked_servers: ids.iter().map(|s| s.to_string()).collect(),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_dispatch_before_init_fails_fast() {
        let dispatcher = Dispatcher::new(Arc::new(Registry::new()));
        let err = dispatcher.call("list_servers", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotInitialized { .. }));
    }

    #[tokio::test]
    async fn test_install_routes_by_runtime_and_records_owner() {
        let h = harness(
            &["node", "python"],
            &[],
            FakeCatalog::default().with_spec("sv_py", "python"),
            GatewayConfig::default(),
        )
        .await;

        let installed = h
            .dispatcher
            .call("install", json!({"server_id": "sv_py"}))
            .await
            .unwrap();
        assert_eq!(installed["server_id"], "sv_py");
        assert_eq!(installed["tools"][0]["name"], "echo");
        assert_eq!(h.scripts["python"].opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.scripts["node"].opens.load(Ordering::SeqCst), 0);

        let ctx = h.dispatcher.registry().get().unwrap();
        assert_eq!(ctx.owner_of("sv_py").as_deref(), Some("python"));

        let result = h
            .dispatcher
            .call(
                "call_tool",
                json!({"server_id": "sv_py", "tool_name": "echo", "arguments": {"x": 1}}),
            )
            .await
            .unwrap();
        assert_eq!(result["echo"], json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_install_spec_is_cached() {
        let h = harness(
            &["node"],
            &[],
            FakeCatalog::default().with_spec("sv_1", "node"),
            GatewayConfig::default(),
        )
        .await;
        for _ in 0..2 {
            h.dispatcher
                .call("install", json!({"server_id": "sv_1"}))
                .await
                .unwrap();
        }
        assert_eq!(h.catalog.spec_lookups.load(Ordering::SeqCst), 1);
        assert_eq!(h.scripts["node"].opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blocked_install_never_looks_up_or_spawns() {
        let h = harness(
            &["node"],
            &[],
            FakeCatalog::default().with_spec("sv_bad", "node"),
            blocking(&["sv_bad"]),
        )
        .await;

        let err = h
            .dispatcher
            .call("install", json!({"server_id": "sv_bad"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PolicyBlocked { .. }));
        assert_eq!(h.catalog.spec_lookups.load(Ordering::SeqCst), 0);
        assert_eq!(h.scripts["node"].opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_list_servers_merges_runtimes_and_filters_policy() {
        let h = harness(
            &["node", "python"],
            &[("node", "sv_a"), ("node", "sv_b"), ("python", "sv_c")],
            FakeCatalog::default(),
            blocking(&["sv_b"]),
        )
        .await;

        let listed = h.dispatcher.call("list_servers", json!({})).await.unwrap();
        let mut listed = ids(&listed);
        listed.sort();
        assert_eq!(listed, vec!["sv_a", "sv_c"]);

        let ctx = h.dispatcher.registry().get().unwrap();
        assert_eq!(ctx.owner_of("sv_c").as_deref(), Some("python"));
    }

    #[tokio::test]
    async fn test_fan_out_skips_failed_runtime() {
        let h = harness(
            &["node", "python"],
            &[("node", "sv_a"), ("python", "sv_c")],
            FakeCatalog::default(),
            GatewayConfig::default(),
        )
        .await;
        let ctx = h.dispatcher.registry().get().unwrap();
        ctx.manager("python").unwrap().stop();

        let listed = h.dispatcher.call("list_servers", json!({})).await.unwrap();
        assert_eq!(ids(&listed), vec!["sv_a"]);
    }

    #[tokio::test]
    async fn test_call_discovers_owner_and_reconnects() {
        let h = harness(
            &["node", "python"],
            &[("python", "sv_py")],
            FakeCatalog::default(),
            GatewayConfig::default(),
        )
        .await;

        let result = h
            .dispatcher
            .call("call_tool", json!({"server_id": "sv_py", "tool_name": "echo"}))
            .await
            .unwrap();
        assert_eq!(result["echo"], json!({}));
        assert_eq!(h.scripts["python"].opens.load(Ordering::SeqCst), 1);

        let ctx = h.dispatcher.registry().get().unwrap();
        assert_eq!(ctx.owner_of("sv_py").as_deref(), Some("python"));
    }

    #[tokio::test]
    async fn test_unknown_server_falls_back_to_default_runtime() {
        let h = harness(&["node"], &[], FakeCatalog::default(), GatewayConfig::default()).await;
        let err = h
            .dispatcher
            .call("get_server_config", json!({"server_id": "sv_missing"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "server 'sv_missing' not found");
    }

    #[tokio::test]
    async fn test_uninstall_twice_and_owner_forgotten() {
        let h = harness(
            &["node"],
            &[("node", "sv_1")],
            FakeCatalog::default(),
            GatewayConfig::default(),
        )
        .await;

        let first = h
            .dispatcher
            .call("uninstall", json!({"server_id": "sv_1"}))
            .await
            .unwrap();
        assert_eq!(first["removed"], true);
        let ctx = h.dispatcher.registry().get().unwrap();
        assert_eq!(ctx.owner_of("sv_1"), None);

        let second = h
            .dispatcher
            .call("uninstall", json!({"server_id": "sv_1"}))
            .await
            .unwrap();
        assert_eq!(second["removed"], false);
    }

    #[tokio::test]
    async fn test_search_results_filtered_by_policy() {
        let h = harness(
            &["node"],
            &[],
            FakeCatalog::default().with_search_results(vec![
                json!({"server_id": "sv_ok", "title": "Weather"}),
                json!({"server_id": "sv_bad", "title": "Shady"}),
                json!({"title": "Web page"}),
            ]),
            blocking(&["sv_bad"]),
        )
        .await;

        let result = h
            .dispatcher
            .call("search", json!({"query": "weather"}))
            .await
            .unwrap();
        let results = result["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r["server_id"] != "sv_bad"));
        assert_eq!(result["scope"], "catalog");
    }

    #[tokio::test]
    async fn test_catalog_failures_are_relayed() {
        let catalog = FakeCatalog::default();
        catalog.fail_all.store(true, Ordering::SeqCst);
        let h = harness(&["node"], &[], catalog, GatewayConfig::default()).await;

        let err = h
            .dispatcher
            .call("submit_feedback", json!({"message": "great"}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Catalog(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_initialize_returns_session_and_instructions() {
        let h = harness(&["node"], &[], FakeCatalog::default(), GatewayConfig::default()).await;
        let result = h
            .dispatcher
            .call("initialize", json!({"client_name": "agent"}))
            .await
            .unwrap();
        let ctx = h.dispatcher.registry().get().unwrap();
        assert_eq!(result["session_id"], ctx.session_id());
        assert_eq!(result["instructions"], "search first, then install");
        assert_eq!(result["runtimes"], json!(["node"]));
    }

    #[tokio::test]
    async fn test_install_emits_telemetry() {
        let h = harness(
            &["node"],
            &[],
            FakeCatalog::default().with_spec("sv_1", "node"),
            GatewayConfig::default(),
        )
        .await;
        h.dispatcher
            .call("install", json!({"server_id": "sv_1"}))
            .await
            .unwrap();

        for _ in 0..50 {
            if !h.catalog.telemetry.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let events = h.catalog.telemetry.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "install");
        assert!(events[0].success);
        assert_eq!(events[0].server_id.as_deref(), Some("sv_1"));
    }

    #[tokio::test]
    async fn test_playbook_relay() {
        let h = harness(&["node"], &[], FakeCatalog::default(), GatewayConfig::default()).await;
        h.dispatcher
            .call("save_playbook", json!({"title": "t", "content": "c"}))
            .await
            .unwrap();
        h.dispatcher
            .call("log_playbook_usage", json!({"playbook_id": "pb_1", "success": true}))
            .await
            .unwrap();
        let relayed = h.catalog.relayed.lock().unwrap().clone();
        assert_eq!(relayed[0].0, "v1/playbooks");
        assert_eq!(relayed[1].0, "v1/playbooks/usage");
        assert_eq!(relayed[1].1["playbook_id"], "pb_1");
    }
}
