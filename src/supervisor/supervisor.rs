//! Tool-Server Supervisor.
//!
//! Per server id the lifecycle is
//! `Unconfigured → Installing → Connected → (calling)* → Connected | removed`,
//! with `ConfiguredNotConnected` for entries persisted by an earlier run (or
//! dropped by the watchdog) that reconnect on first use.
//!
//! Three maps are kept, all behind short-lived std mutexes that are never held
//! across an await:
//!
//! - `configs`: in-memory mirror of the persisted document
//! - `live`: connected servers with their cached tool lists
//! - `installs`: the single in-flight install per id, shared by every caller

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;

use super::connection::{diagnostics_suffix, Connector, ToolServerConnection};
use super::errors::SupervisorError;
use super::store::ConfigStore;
use super::types::{ServerConfigEntry, ServerState, ServerStatus, ServerTools, ToolDefinition};

// ─── Options ─────────────────────────────────────────────────────────────────

/// Default bound on connect, handshake and tool listing (each separately).
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default call watchdog.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

struct LiveConnection {
    conn: Arc<dyn ToolServerConnection>,
    tools: Vec<ToolDefinition>,
    server_name: String,
}

type InstallOutcome = Result<ServerTools, SupervisorError>;
type InstallFuture = Shared<BoxFuture<'static, InstallOutcome>>;

struct Inner {
    connector: Arc<dyn Connector>,
    store: ConfigStore,
    options: SupervisorOptions,
    configs: Mutex<BTreeMap<String, ServerConfigEntry>>,
    live: Mutex<HashMap<String, Arc<LiveConnection>>>,
    installs: Mutex<HashMap<String, InstallFuture>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Supervises every tool server of one runtime. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Build a supervisor and load the persisted document into the mirror.
    pub async fn start(
        connector: Arc<dyn Connector>,
        store: ConfigStore,
        options: SupervisorOptions,
    ) -> Result<Self, SupervisorError> {
        let configs = store.load().await?;
        tracing::info!(
            path = %store.path().display(),
            servers = configs.len(),
            "loaded tool-server config"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                connector,
                store,
                options,
                configs: Mutex::new(configs),
                live: Mutex::new(HashMap::new()),
                installs: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn options(&self) -> SupervisorOptions {
        self.inner.options
    }

    /// Where `server_id` currently sits in its lifecycle.
    pub fn state(&self, server_id: &str) -> ServerState {
        if lock(&self.inner.installs).contains_key(server_id) {
            ServerState::Installing
        } else if lock(&self.inner.live).contains_key(server_id) {
            ServerState::Connected
        } else if lock(&self.inner.configs).contains_key(server_id) {
            ServerState::ConfiguredNotConnected
        } else {
            ServerState::Unconfigured
        }
    }

    // ─── Install ─────────────────────────────────────────────────────────

    /// Install (or reinstall) a server.
    ///
    /// Concurrent calls for the same id share one physical install and all
    /// observe its outcome; the entry passed by a joining caller is ignored.
    pub async fn install(&self, entry: ServerConfigEntry) -> Result<ServerTools, SupervisorError> {
        entry
            .validate()
            .map_err(|reason| SupervisorError::InvalidConfig {
                server_id: entry.server_id.clone(),
                reason,
            })?;

        let install = {
            let mut installs = lock(&self.inner.installs);
            match installs.get(&entry.server_id) {
                Some(in_flight) => {
                    tracing::debug!(server = %entry.server_id, "joining in-flight install");
                    in_flight.clone()
                }
                None => {
                    let server_id = entry.server_id.clone();
                    let inner = self.inner.clone();
                    // The task removes its own entry; it cannot do so before
                    // the insert below because we still hold the lock.
                    let task = tokio::spawn(async move {
                        let id = entry.server_id.clone();
                        let outcome = inner.perform_install(entry).await;
                        lock(&inner.installs).remove(&id);
                        outcome
                    });
                    let abort_id = server_id.clone();
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            tracing::error!(server = %abort_id, error = %e, "install task failed");
                            Err(SupervisorError::InstallAborted {
                                server_id: abort_id.clone(),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    installs.insert(server_id, shared.clone());
                    shared
                }
            }
        };

        install.await
    }

    fn in_flight(&self, server_id: &str) -> Option<InstallFuture> {
        lock(&self.inner.installs).get(server_id).cloned()
    }

    /// Wait out any in-flight install for `server_id`, ignoring its outcome.
    async fn settle(&self, server_id: &str) {
        if let Some(install) = self.in_flight(server_id) {
            let _ = install.await;
        }
    }

    /// Connected handle for `server_id`, reconnecting a configured server.
    async fn ensure_connected(&self, server_id: &str) -> Result<Arc<LiveConnection>, SupervisorError> {
        self.settle(server_id).await;

        let live = lock(&self.inner.live).get(server_id).cloned();
        if let Some(live) = live {
            return Ok(live);
        }

        let entry = lock(&self.inner.configs).get(server_id).cloned();
        let Some(entry) = entry else {
            return Err(SupervisorError::NotFound {
                server_id: server_id.to_string(),
            });
        };

        tracing::info!(server = %server_id, "reconnecting configured server");
        self.install(entry).await?;

        lock(&self.inner.live)
            .get(server_id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound {
                server_id: server_id.to_string(),
            })
    }

    // ─── Call ────────────────────────────────────────────────────────────

    /// Call a tool under the watchdog (`timeout` or the default).
    ///
    /// A timeout or any call error drops the connection before the error is
    /// returned; the next call reinstalls.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, SupervisorError> {
        let live = self.ensure_connected(server_id).await?;
        let watchdog = timeout.unwrap_or(self.inner.options.call_timeout);

        match tokio::time::timeout(watchdog, live.conn.call_tool(tool, arguments)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                tracing::warn!(server = %server_id, tool, error = %e, "tool call failed, dropping connection");
                self.inner.drop_connection(server_id, &live).await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    server = %server_id,
                    tool,
                    timeout_ms = watchdog.as_millis() as u64,
                    "watchdog fired, dropping connection"
                );
                self.inner.drop_connection(server_id, &live).await;
                Err(SupervisorError::Timeout {
                    server_id: server_id.to_string(),
                    operation: format!("call to tool '{tool}'"),
                    timeout_ms: watchdog.as_millis() as u64,
                    stderr: String::new(),
                })
            }
        }
    }

    // ─── Uninstall ───────────────────────────────────────────────────────

    /// Remove a server. Returns whether it was configured; absent is fine.
    pub async fn uninstall(&self, server_id: &str) -> Result<bool, SupervisorError> {
        self.settle(server_id).await;

        // Mirror and live map are cleared before any await so a concurrent
        // call cannot find the entry and reconnect it.
        let mirrored = lock(&self.inner.configs).remove(server_id);
        let live = lock(&self.inner.live).remove(server_id);
        if let Some(live) = live {
            live.conn.close().await;
        }

        match self.inner.store.remove(server_id).await {
            Ok(removed) => {
                let removed = removed || mirrored.is_some();
                tracing::info!(server = %server_id, removed, "server uninstalled");
                Ok(removed)
            }
            Err(e) => {
                tracing::error!(server = %server_id, error = %e, "failed to remove server config");
                if let Some(entry) = mirrored {
                    lock(&self.inner.configs)
                        .entry(server_id.to_string())
                        .or_insert(entry);
                }
                Err(e.into())
            }
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    /// Every configured server with its connection state.
    pub fn list_servers(&self) -> Vec<ServerStatus> {
        let configs = lock(&self.inner.configs).clone();
        let live = lock(&self.inner.live);
        configs
            .into_values()
            .map(|entry| {
                let conn = live.get(&entry.server_id);
                ServerStatus {
                    connected: conn.is_some(),
                    tool_count: conn.map(|c| c.tools.len()),
                    server_name: entry.display_name().to_string(),
                    server_id: entry.server_id,
                    description: entry.description,
                    transport: entry.transport,
                    runtime: entry.runtime,
                }
            })
            .collect()
    }

    /// Tools of one server (reconnecting it if needed), or of every connected server.
    pub async fn list_tools(&self, server_id: Option<&str>) -> Result<Vec<ServerTools>, SupervisorError> {
        match server_id {
            Some(id) => {
                let live = self.ensure_connected(id).await?;
                Ok(vec![ServerTools {
                    server_id: id.to_string(),
                    server_name: live.server_name.clone(),
                    tools: live.tools.clone(),
                }])
            }
            None => {
                let live = lock(&self.inner.live);
                let mut all: Vec<ServerTools> = live
                    .iter()
                    .map(|(id, l)| ServerTools {
                        server_id: id.clone(),
                        server_name: l.server_name.clone(),
                        tools: l.tools.clone(),
                    })
                    .collect();
                all.sort_by(|a, b| a.server_id.cmp(&b.server_id));
                Ok(all)
            }
        }
    }

    pub fn get_server_config(&self, server_id: &str) -> Result<ServerConfigEntry, SupervisorError> {
        lock(&self.inner.configs)
            .get(server_id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound {
                server_id: server_id.to_string(),
            })
    }

    /// Close every live connection. Config stays on disk.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = lock(&self.inner.live).drain().collect();
        for (id, live) in drained {
            tracing::debug!(server = %id, "closing connection on shutdown");
            live.conn.close().await;
        }
    }
}

impl Inner {
    /// One physical install: connect, handshake, list, persist, record.
    async fn perform_install(&self, entry: ServerConfigEntry) -> InstallOutcome {
        let server_id = entry.server_id.clone();

        // Last install wins: no duplicate connection for one id.
        let previous = lock(&self.live).remove(&server_id);
        if let Some(previous) = previous {
            tracing::info!(server = %server_id, "replacing existing connection");
            previous.conn.close().await;
        }

        let timeout = self.options.handshake_timeout;
        let timeout_ms = timeout.as_millis() as u64;
        let timed_out = |operation: &str| SupervisorError::Timeout {
            server_id: server_id.clone(),
            operation: operation.to_string(),
            timeout_ms,
            stderr: String::new(),
        };

        let conn = match tokio::time::timeout(timeout, self.connector.open(&entry)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                tracing::warn!(server = %server_id, error = %e, "connect failed");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(server = %server_id, timeout_ms, "connect timed out");
                return Err(timed_out("connect"));
            }
        };

        let established: Result<Vec<ToolDefinition>, SupervisorError> = async {
            tokio::time::timeout(timeout, conn.handshake())
                .await
                .map_err(|_| timed_out("handshake"))??;
            tokio::time::timeout(timeout, conn.list_tools())
                .await
                .map_err(|_| timed_out("tool listing"))?
        }
        .await;

        let tools = match established {
            Ok(tools) => tools,
            Err(e) => {
                let e = e.with_stderr(&diagnostics_suffix(conn.as_ref()));
                tracing::warn!(server = %server_id, error = %e, "install failed");
                conn.close().await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.upsert(entry.clone()).await {
            tracing::error!(server = %server_id, error = %e, "failed to persist server config");
            conn.close().await;
            return Err(e.into());
        }

        let server_name = entry.display_name().to_string();
        lock(&self.configs).insert(server_id.clone(), entry);
        lock(&self.live).insert(
            server_id.clone(),
            Arc::new(LiveConnection {
                conn,
                tools: tools.clone(),
                server_name: server_name.clone(),
            }),
        );

        tracing::info!(server = %server_id, tools = tools.len(), "server installed");
        Ok(ServerTools {
            server_id,
            server_name,
            tools,
        })
    }

    /// Remove `expected` from the live map if it is still the current
    /// connection for `server_id`, then close it.
    async fn drop_connection(&self, server_id: &str, expected: &Arc<LiveConnection>) {
        {
            let mut live = lock(&self.live);
            if live
                .get(server_id)
                .is_some_and(|current| Arc::ptr_eq(current, expected))
            {
                live.remove(server_id);
            }
        }
        expected.conn.close().await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
