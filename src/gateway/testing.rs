//! In-memory catalog for gateway tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::catalog::{CatalogApi, InstallSpec, SearchScope, TelemetryEvent};
use super::errors::CatalogError;

#[derive(Default)]
pub struct FakeCatalog {
    pub specs: Mutex<HashMap<String, Value>>,
    pub search_results: Mutex<Vec<Value>>,
    pub spec_lookups: AtomicUsize,
    pub fail_all: AtomicBool,
    pub telemetry: Mutex<Vec<TelemetryEvent>>,
    pub relayed: Mutex<Vec<(String, Value)>>,
}

impl FakeCatalog {
    /// Register a stdio spec for `server_id` owned by `runtime`.
    pub fn with_spec(self, server_id: &str, runtime: &str) -> Self {
        self.specs.lock().unwrap().insert(
            server_id.to_string(),
            json!({
                "server_id": server_id,
                "server_name": format!("Server {server_id}"),
                "command": "fake-server",
                "runtime": runtime,
            }),
        );
        self
    }

    pub fn with_search_results(self, results: Vec<Value>) -> Self {
        *self.search_results.lock().unwrap() = results;
        self
    }

    fn check(&self, endpoint: &str) -> Result<(), CatalogError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(CatalogError::Http {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn relay(&self, endpoint: &str, body: Value) -> Result<Value, CatalogError> {
        self.check(endpoint)?;
        self.relayed
            .lock()
            .unwrap()
            .push((endpoint.to_string(), body.clone()));
        Ok(json!({ "ok": true, "echo": body }))
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    async fn init(&self, session_id: &str, client: Value) -> Result<Value, CatalogError> {
        self.check("v1/init")?;
        Ok(json!({
            "session_id": session_id,
            "instructions": "search first, then install",
            "client": client,
        }))
    }

    async fn search(
        &self,
        query: &str,
        scope: SearchScope,
        _limit: Option<u32>,
    ) -> Result<Value, CatalogError> {
        self.check("v1/search")?;
        Ok(json!({
            "query": query,
            "scope": scope,
            "results": self.search_results.lock().unwrap().clone(),
        }))
    }

    async fn lookup_entity(&self, entity_id: &str) -> Result<Value, CatalogError> {
        self.relay("v1/lookup", json!({ "entity_id": entity_id }))
    }

    async fn resolve_install_spec(&self, server_id: &str) -> Result<InstallSpec, CatalogError> {
        self.check("v1/servers/install-spec")?;
        self.spec_lookups.fetch_add(1, Ordering::SeqCst);
        let raw = self.specs.lock().unwrap().get(server_id).cloned();
        match raw {
            Some(raw) => serde_json::from_value(raw).map_err(|e| CatalogError::Decode {
                endpoint: "v1/servers/install-spec".into(),
                reason: e.to_string(),
            }),
            None => Err(CatalogError::Status {
                endpoint: "v1/servers/install-spec".into(),
                status: 404,
                body: format!("unknown server {server_id}"),
            }),
        }
    }

    async fn save_playbook(&self, playbook: Value) -> Result<Value, CatalogError> {
        self.relay("v1/playbooks", playbook)
    }

    async fn log_playbook_usage(&self, usage: Value) -> Result<Value, CatalogError> {
        self.relay("v1/playbooks/usage", usage)
    }

    async fn submit_feedback(&self, feedback: Value) -> Result<Value, CatalogError> {
        self.relay("v1/feedback", feedback)
    }

    async fn send_telemetry(&self, event: &TelemetryEvent) -> Result<(), CatalogError> {
        self.check("v1/telemetry")?;
        self.telemetry.lock().unwrap().push(event.clone());
        Ok(())
    }
}
