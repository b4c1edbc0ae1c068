//! Session and registry state.
//!
//! Everything long-lived in the gateway (catalog client, policy, manager
//! table, spec and owner caches) lives in one [`AppContext`] built at
//! startup. The [`Registry`] holds it as `Uninitialized | Ready(context)`,
//! and reading it before `init` is an error rather than a silent default.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::catalog::{CatalogApi, CatalogClient, InstallSpec};
use super::config::GatewayConfig;
use super::errors::GatewayError;
use super::policy::ServerPolicy;
use crate::manager_client::{manager_spec, ProcessManagerClient};
use crate::supervisor::DEFAULT_RUNTIME;

// ─── AppContext ──────────────────────────────────────────────────────────────

pub struct AppContext {
    config: GatewayConfig,
    session_id: String,
    catalog: Arc<dyn CatalogApi>,
    policy: ServerPolicy,
    /// `runtime → manager`, fixed for the lifetime of the context.
    managers: BTreeMap<String, Arc<ProcessManagerClient>>,
    /// Install specs already resolved through the catalog.
    specs: Mutex<HashMap<String, InstallSpec>>,
    /// `server_id → runtime` for servers this session has seen.
    owners: Mutex<HashMap<String, String>>,
}

impl AppContext {
    pub fn new(
        config: GatewayConfig,
        catalog: Arc<dyn CatalogApi>,
        managers: BTreeMap<String, Arc<ProcessManagerClient>>,
    ) -> Self {
        Self {
            policy: ServerPolicy::from_config(&config),
            session_id: uuid::Uuid::new_v4().to_string(),
            config,
            catalog,
            managers,
            specs: Mutex::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Build the catalog client and spawn one manager per configured runtime.
    ///
    /// Managers are copies of this executable started as
    /// `toolgate manager --runtime <key>`.
    pub fn start(config: GatewayConfig) -> Result<Self, GatewayError> {
        let catalog = Arc::new(CatalogClient::from_config(&config)?);
        let exe = std::env::current_exe().map_err(|e| GatewayError::Config {
            reason: format!("cannot locate own executable: {e}"),
        })?;

        let mut managers = BTreeMap::new();
        for runtime in &config.runtimes {
            let servers_file = config.servers_file(runtime);
            let spec = manager_spec(&exe, runtime, servers_file.as_deref());
            let client = ProcessManagerClient::spawn(runtime, &spec).map_err(|source| {
                GatewayError::ManagerSpawn {
                    runtime: runtime.clone(),
                    source,
                }
            })?;
            managers.insert(runtime.clone(), Arc::new(client));
        }

        Ok(Self::new(config, catalog, managers))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn catalog(&self) -> Arc<dyn CatalogApi> {
        self.catalog.clone()
    }

    pub fn policy(&self) -> &ServerPolicy {
        &self.policy
    }

    pub fn manager(&self, runtime: &str) -> Result<Arc<ProcessManagerClient>, GatewayError> {
        self.managers
            .get(runtime)
            .cloned()
            .ok_or_else(|| GatewayError::NoManager {
                runtime: runtime.to_string(),
            })
    }

    /// Every manager, in runtime order.
    pub fn managers(&self) -> Vec<(String, Arc<ProcessManagerClient>)> {
        self.managers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn cached_spec(&self, server_id: &str) -> Option<InstallSpec> {
        lock(&self.specs).get(server_id).cloned()
    }

    pub fn cache_spec(&self, spec: InstallSpec) {
        lock(&self.specs).insert(spec.server_id.clone(), spec);
    }

    pub fn owner_of(&self, server_id: &str) -> Option<String> {
        lock(&self.owners).get(server_id).cloned()
    }

    pub fn record_owner(&self, server_id: &str, runtime: &str) {
        lock(&self.owners).insert(server_id.to_string(), runtime.to_string());
    }

    pub fn forget_owner(&self, server_id: &str) {
        lock(&self.owners).remove(server_id);
    }

    /// Runtime to fall back on when no manager claims a server.
    pub fn default_runtime(&self) -> &str {
        if self.managers.contains_key(DEFAULT_RUNTIME) {
            DEFAULT_RUNTIME
        } else {
            self.managers
                .keys()
                .next()
                .map(String::as_str)
                .unwrap_or(DEFAULT_RUNTIME)
        }
    }

    pub fn stop_managers(&self) {
        for manager in self.managers.values() {
            manager.stop();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub enum AppState {
    Uninitialized,
    Ready(Arc<AppContext>),
}

/// Process-wide holder of the [`AppContext`] with an explicit init/reset lifecycle.
pub struct Registry {
    state: RwLock<AppState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AppState::Uninitialized),
        }
    }

    /// Install `context`. A previous context is reset first.
    pub fn init(&self, context: AppContext) -> Arc<AppContext> {
        let context = Arc::new(context);
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, AppState::Ready(context.clone()))
        };
        if let AppState::Ready(old) = previous {
            tracing::warn!("registry re-initialized, stopping previous managers");
            old.stop_managers();
        }
        tracing::info!(session = %context.session_id(), "registry initialized");
        context
    }

    /// The current context, or `NotInitialized`.
    pub fn get(&self) -> Result<Arc<AppContext>, GatewayError> {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            AppState::Ready(context) => Ok(context.clone()),
            AppState::Uninitialized => Err(GatewayError::NotInitialized {
                what: "application context",
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            &*self.state.read().unwrap_or_else(|e| e.into_inner()),
            AppState::Ready(_)
        )
    }

    /// Drop the context and stop its managers. Returns whether there was one.
    pub fn reset(&self) -> bool {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, AppState::Uninitialized)
        };
        match previous {
            AppState::Ready(context) => {
                context.stop_managers();
                tracing::info!(session = %context.session_id(), "registry reset");
                true
            }
            AppState::Uninitialized => false,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeCatalog;
    use crate::process::child::fake;

    fn context(runtimes: &[&str]) -> (AppContext, Vec<fake::FakeChild>) {
        let mut managers = BTreeMap::new();
        let mut children = Vec::new();
        for rt in runtimes {
            let (io, child) = fake::in_memory(rt);
            managers.insert(rt.to_string(), Arc::new(ProcessManagerClient::attach(rt, io)));
            children.push(child);
        }
        let ctx = AppContext::new(
            GatewayConfig::default(),
            Arc::new(FakeCatalog::default()),
            managers,
        );
        (ctx, children)
    }

    #[tokio::test]
    async fn test_get_before_init_fails_fast() {
        let registry = Registry::new();
        assert!(!registry.is_ready());
        let err = registry.get().err().unwrap();
        assert!(matches!(err, GatewayError::NotInitialized { .. }));
        assert!(!registry.reset());
    }

    #[tokio::test]
    async fn test_init_then_reset_stops_managers() {
        let registry = Registry::new();
        let (ctx, _children) = context(&["node"]);
        registry.init(ctx);
        let ctx = registry.get().unwrap();
        let manager = ctx.manager("node").unwrap();
        assert!(manager.is_running());

        assert!(registry.reset());
        assert!(!manager.is_running());
        assert!(registry.get().is_err());
    }

    #[tokio::test]
    async fn test_unknown_runtime_is_no_manager() {
        let (ctx, _children) = context(&["node"]);
        let err = ctx.manager("python").err().unwrap();
        assert_eq!(err.to_string(), "no manager running for runtime 'python'");
    }

    #[tokio::test]
    async fn test_default_runtime_prefers_node() {
        let (ctx, _children) = context(&["deno", "node"]);
        assert_eq!(ctx.default_runtime(), "node");
        let (ctx, _children) = context(&["python"]);
        assert_eq!(ctx.default_runtime(), "python");
    }

    #[tokio::test]
    async fn test_owner_cache() {
        let (ctx, _children) = context(&["node"]);
        assert_eq!(ctx.owner_of("sv_1"), None);
        ctx.record_owner("sv_1", "node");
        assert_eq!(ctx.owner_of("sv_1").as_deref(), Some("node"));
        ctx.forget_owner("sv_1");
        assert_eq!(ctx.owner_of("sv_1"), None);
    }
}
