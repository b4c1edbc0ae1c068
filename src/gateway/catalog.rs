//! Remote catalog API client.
//!
//! The catalog answers search and lookup queries, stores playbooks and
//! feedback, receives telemetry, and resolves a `server_id` into the install
//! spec the manager needs. Every endpoint is a JSON `POST` relative to the
//! configured base URL; the optional API key travels in `x-api-key`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::config::GatewayConfig;
use super::errors::CatalogError;
use crate::supervisor::{ServerConfigEntry, TransportKind, DEFAULT_RUNTIME};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const API_KEY_HEADER: &str = "x-api-key";

/// Longest error body kept in a [`CatalogError::Status`].
const MAX_ERROR_BODY: usize = 512;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    #[default]
    Catalog,
    Web,
}

/// How to launch a catalog server, as returned by the install-spec endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InstallSpec {
    #[serde(default)]
    pub server_id: String,
    #[serde(default, alias = "name")]
    pub server_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

fn default_transport() -> TransportKind {
    TransportKind::Stdio
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_string()
}

impl InstallSpec {
    /// Build the manager's config entry; `env_overrides` win over the spec's env.
    pub fn into_entry(self, env_overrides: &BTreeMap<String, String>) -> ServerConfigEntry {
        let mut env = self.env;
        env.extend(env_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        ServerConfigEntry {
            server_name: if self.server_name.is_empty() {
                self.server_id.clone()
            } else {
                self.server_name
            },
            server_id: self.server_id,
            description: self.description,
            transport: self.transport,
            command: self.command,
            args: self.args,
            env,
            url: self.url,
            runtime: self.runtime,
        }
    }
}

/// One best-effort usage event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub session_id: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// The catalog operations the dispatcher relays.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Register a session; the response carries agent instructions.
    async fn init(&self, session_id: &str, client: Value) -> Result<Value, CatalogError>;

    async fn search(
        &self,
        query: &str,
        scope: SearchScope,
        limit: Option<u32>,
    ) -> Result<Value, CatalogError>;

    async fn lookup_entity(&self, entity_id: &str) -> Result<Value, CatalogError>;

    async fn resolve_install_spec(&self, server_id: &str) -> Result<InstallSpec, CatalogError>;

    async fn save_playbook(&self, playbook: Value) -> Result<Value, CatalogError>;

    async fn log_playbook_usage(&self, usage: Value) -> Result<Value, CatalogError>;

    async fn submit_feedback(&self, feedback: Value) -> Result<Value, CatalogError>;

    async fn send_telemetry(&self, event: &TelemetryEvent) -> Result<(), CatalogError>;
}

// ─── HTTP client ─────────────────────────────────────────────────────────────

pub struct CatalogClient {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl CatalogClient {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, CatalogError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.catalog_timeout)
            .build()
            .map_err(|e| CatalogError::Http {
                endpoint: config.api_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_http(http, &config.api_url, config.api_key.clone()))
    }

    pub fn with_http(http: HttpClient, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `POST` a JSON body and decode the JSON reply. An empty body decodes as `null`.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, CatalogError> {
        let endpoint = self.endpoint(path);
        let mut request = self.http.post(&endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| CatalogError::Http {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate(&mut body, MAX_ERROR_BODY);
            tracing::warn!(endpoint = %endpoint, status = status.as_u16(), "catalog request rejected");
            return Err(CatalogError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(|e| CatalogError::Http {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| CatalogError::Decode {
            endpoint,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CatalogApi for CatalogClient {
    async fn init(&self, session_id: &str, client: Value) -> Result<Value, CatalogError> {
        self.post("v1/init", &json!({ "session_id": session_id, "client": client }))
            .await
    }

    async fn search(
        &self,
        query: &str,
        scope: SearchScope,
        limit: Option<u32>,
    ) -> Result<Value, CatalogError> {
        let mut body = json!({ "query": query, "scope": scope });
        if let Some(limit) = limit {
            body["limit"] = json!(limit);
        }
        self.post("v1/search", &body).await
    }

    async fn lookup_entity(&self, entity_id: &str) -> Result<Value, CatalogError> {
        self.post("v1/lookup", &json!({ "entity_id": entity_id })).await
    }

    async fn resolve_install_spec(&self, server_id: &str) -> Result<InstallSpec, CatalogError> {
        let path = "v1/servers/install-spec";
        let value = self.post(path, &json!({ "server_id": server_id })).await?;
        decode_install_spec(server_id, value).map_err(|reason| CatalogError::Decode {
            endpoint: self.endpoint(path),
            reason,
        })
    }

    async fn save_playbook(&self, playbook: Value) -> Result<Value, CatalogError> {
        self.post("v1/playbooks", &playbook).await
    }

    async fn log_playbook_usage(&self, usage: Value) -> Result<Value, CatalogError> {
        self.post("v1/playbooks/usage", &usage).await
    }

    async fn submit_feedback(&self, feedback: Value) -> Result<Value, CatalogError> {
        self.post("v1/feedback", &feedback).await
    }

    async fn send_telemetry(&self, event: &TelemetryEvent) -> Result<(), CatalogError> {
        let body = serde_json::to_value(event).map_err(|e| CatalogError::Decode {
            endpoint: self.endpoint("v1/telemetry"),
            reason: e.to_string(),
        })?;
        self.post("v1/telemetry", &body).await.map(|_| ())
    }
}

/// Accepts either `{"server": {...}}` or the spec object itself.
fn decode_install_spec(server_id: &str, value: Value) -> Result<InstallSpec, String> {
    let raw = match value {
        Value::Object(mut map) if map.contains_key("server") => {
            map.remove("server").unwrap_or(Value::Null)
        }
        other => other,
    };
    let mut spec: InstallSpec = serde_json::from_value(raw).map_err(|e| e.to_string())?;
    if spec.server_id.is_empty() {
        spec.server_id = server_id.to_string();
    } else if spec.server_id != server_id {
        return Err(format!(
            "install spec is for '{}', expected '{server_id}'",
            spec.server_id
        ));
    }
    Ok(spec)
}

fn truncate(text: &mut String, max: usize) {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
