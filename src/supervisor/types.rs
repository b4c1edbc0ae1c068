//! Shared types for the tool-server supervisor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Runtime key used when a config entry does not name one.
pub const DEFAULT_RUNTIME: &str = "node";

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_string()
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// How the supervisor reaches a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking JSON-RPC over stdin/stdout.
    Stdio,
    /// Remote endpoint speaking JSON-RPC over server-sent events.
    Sse,
}

/// One persisted tool-server configuration, keyed by `server_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfigEntry {
    pub server_id: String,
    pub server_name: String,
    #[serde(default)]
    pub description: String,
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

impl ServerConfigEntry {
    /// Check that the entry carries what its transport needs.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_id.trim().is_empty() {
            return Err("server_id must not be empty".into());
        }
        match self.transport {
            TransportKind::Stdio => match self.command.as_deref() {
                Some(cmd) if !cmd.trim().is_empty() => Ok(()),
                _ => Err("stdio transport requires a command".into()),
            },
            TransportKind::Sse => match self.url.as_deref() {
                Some(url) if !url.trim().is_empty() => Ok(()),
                _ => Err("sse transport requires a url".into()),
            },
        }
    }

    /// Name to show for the server, falling back to its id.
    pub fn display_name(&self) -> &str {
        if self.server_name.is_empty() {
            &self.server_id
        } else {
            &self.server_name
        }
    }
}

/// The on-disk document: a flat mapping of server_id to entry.
pub type ConfigDocument = BTreeMap<String, ServerConfigEntry>;

// ─── Tools ───────────────────────────────────────────────────────────────────

/// Tool definition as advertised by a tool server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Where a server id sits in the supervisor's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Unconfigured,
    Installing,
    ConfiguredNotConnected,
    Connected,
}

/// One row of `list_servers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub server_name: String,
    pub description: String,
    pub transport: TransportKind,
    pub runtime: String,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_count: Option<usize>,
}

/// A connected server with its tools (`install` and `list_tools` results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerTools {
    pub server_id: String,
    pub server_name: String,
    pub tools: Vec<ToolDefinition>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_defaults_runtime_and_optional_fields() {
        let json = r#"{
            "server_id": "sv_1",
            "server_name": "Weather",
            "transport": "stdio",
            "command": "npx",
            "args": ["-y", "weather-server"]
        }"#;
        let entry: ServerConfigEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.runtime, "node");
        assert!(entry.env.is_empty());
        assert!(entry.url.is_none());
        assert!(entry.validate().is_ok());

        let out = serde_json::to_value(&entry).unwrap();
        assert!(out.get("url").is_none());
        assert!(out.get("env").is_none());
    }

    #[test]
    fn test_validate_requires_transport_fields() {
        let mut entry = ServerConfigEntry {
            server_id: "sv_2".into(),
            server_name: String::new(),
            description: String::new(),
            transport: TransportKind::Sse,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            url: None,
            runtime: default_runtime(),
        };
        assert!(entry.validate().unwrap_err().contains("url"));
        entry.url = Some("http://localhost:3000/sse".into());
        assert!(entry.validate().is_ok());
        assert_eq!(entry.display_name(), "sv_2");

        entry.transport = TransportKind::Stdio;
        assert!(entry.validate().unwrap_err().contains("command"));
    }

    #[test]
    fn test_tool_definition_accepts_camel_case_schema() {
        let json = r#"{"name": "get_forecast", "inputSchema": {"type": "object"}}"#;
        let tool: ToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_empty());
    }
}
