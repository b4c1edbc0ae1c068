//! The fixed tool catalog the gateway exposes to the agent.
//!
//! Each tool has a JSON schema. Arguments are checked against it (required
//! fields, top-level types) and then decoded into a typed [`ToolInvocation`]
//! before anything is dispatched.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::catalog::SearchScope;
use super::errors::GatewayError;
use crate::supervisor::ToolDefinition;

// ─── Catalog ─────────────────────────────────────────────────────────────────

pub const TOOL_NAMES: [&str; 12] = [
    "initialize",
    "search",
    "lookup_entity",
    "install",
    "uninstall",
    "call_tool",
    "list_tools",
    "list_servers",
    "get_server_config",
    "save_playbook",
    "log_playbook_usage",
    "submit_feedback",
];

fn server_id_prop() -> Value {
    json!({"type": "string", "description": "Catalog id of the tool server, e.g. sv_abc123"})
}

/// Definition for one gateway tool, or `None` for an unknown name.
pub fn tool_definition(name: &str) -> Option<ToolDefinition> {
    let (description, schema) = match name {
        "initialize" => (
            "Start a session. Returns the session id and usage instructions.",
            json!({
                "type": "object",
                "properties": {
                    "client_name": {"type": "string"},
                    "client_version": {"type": "string"}
                }
            }),
        ),
        "search" => (
            "Search the catalog for tool servers, or the web when scope is 'web'.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "scope": {"type": "string", "enum": ["catalog", "web"]},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 50}
                },
                "required": ["query"]
            }),
        ),
        "lookup_entity" => (
            "Fetch full catalog details for a server, tool or playbook id.",
            json!({
                "type": "object",
                "properties": {"entity_id": {"type": "string"}},
                "required": ["entity_id"]
            }),
        ),
        "install" => (
            "Install and connect a tool server. Optional env values override the catalog's.",
            json!({
                "type": "object",
                "properties": {
                    "server_id": server_id_prop(),
                    "env": {"type": "object", "additionalProperties": {"type": "string"}}
                },
                "required": ["server_id"]
            }),
        ),
        "uninstall" => (
            "Disconnect a tool server and remove its saved configuration.",
            json!({
                "type": "object",
                "properties": {"server_id": server_id_prop()},
                "required": ["server_id"]
            }),
        ),
        "call_tool" => (
            "Call a tool on an installed server.",
            json!({
                "type": "object",
                "properties": {
                    "server_id": server_id_prop(),
                    "tool_name": {"type": "string"},
                    "arguments": {"type": "object"}
                },
                "required": ["server_id", "tool_name"]
            }),
        ),
        "list_tools" => (
            "List tools of one server, or of every connected server.",
            json!({
                "type": "object",
                "properties": {"server_id": server_id_prop()}
            }),
        ),
        "list_servers" => (
            "List installed servers and whether they are connected.",
            json!({"type": "object", "properties": {}}),
        ),
        "get_server_config" => (
            "Show the saved configuration of an installed server.",
            json!({
                "type": "object",
                "properties": {"server_id": server_id_prop()},
                "required": ["server_id"]
            }),
        ),
        "save_playbook" => (
            "Save a reusable playbook describing how a task was solved.",
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"},
                    "content": {"type": "string"},
                    "server_ids": {"type": "array", "items": {"type": "string"}},
                    "tags": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["title", "content"]
            }),
        ),
        "log_playbook_usage" => (
            "Record that a playbook was used and whether it worked.",
            json!({
                "type": "object",
                "properties": {
                    "playbook_id": {"type": "string"},
                    "success": {"type": "boolean"},
                    "notes": {"type": "string"}
                },
                "required": ["playbook_id", "success"]
            }),
        ),
        "submit_feedback" => (
            "Send feedback about a server, tool or the gateway itself.",
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "server_id": server_id_prop(),
                    "rating": {"type": "integer", "minimum": 1, "maximum": 5}
                },
                "required": ["message"]
            }),
        ),
        _ => return None,
    };
    Some(ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: schema,
    })
}

/// All gateway tools, in display order.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    TOOL_NAMES.iter().filter_map(|n| tool_definition(n)).collect()
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Structural check: object arguments, required fields present, top-level types.
pub fn validate_arguments(def: &ToolDefinition, arguments: &Value) -> Result<(), GatewayError> {
    let invalid = |reason: String| GatewayError::InvalidArguments {
        tool: def.name.clone(),
        reason,
    };
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => return Err(invalid(format!("expected an object, got {}", type_name(other)))),
    };

    let required: Vec<&str> = def
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    for field in &required {
        if !args.contains_key(*field) {
            return Err(invalid(format!("missing required field: '{field}'")));
        }
    }

    let Some(props) = def.input_schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (key, value) in args {
        let Some(prop) = props.get(key) else {
            continue;
        };
        // An explicit null counts as absent for optional fields.
        if value.is_null() && !required.contains(&key.as_str()) {
            continue;
        }
        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            if !matches_type(value, expected) {
                return Err(invalid(format!(
                    "field '{key}' should be {expected}, got {}",
                    type_name(value)
                )));
            }
        }
        if let Some(allowed) = prop.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(Value::to_string).collect();
                return Err(invalid(format!(
                    "field '{key}' must be one of {}",
                    options.join(", ")
                )));
            }
        }
    }
    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Typed invocation ────────────────────────────────────────────────────────

/// A validated gateway tool call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", content = "arguments", rename_all = "snake_case")]
pub enum ToolInvocation {
    Initialize(Value),
    Search {
        query: String,
        #[serde(default)]
        scope: SearchScope,
        #[serde(default)]
        limit: Option<u32>,
    },
    LookupEntity {
        entity_id: String,
    },
    Install {
        server_id: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Uninstall {
        server_id: String,
    },
    CallTool {
        server_id: String,
        tool_name: String,
        #[serde(default)]
        arguments: Option<Value>,
    },
    ListTools {
        #[serde(default)]
        server_id: Option<String>,
    },
    ListServers {},
    GetServerConfig {
        server_id: String,
    },
    SavePlaybook(Value),
    LogPlaybookUsage(Value),
    SubmitFeedback(Value),
}

impl ToolInvocation {
    /// Validate `arguments` against the tool's schema and decode them.
    pub fn parse(name: &str, arguments: Value) -> Result<Self, GatewayError> {
        let def = tool_definition(name).ok_or_else(|| GatewayError::UnknownTool {
            name: name.to_string(),
        })?;
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        validate_arguments(&def, &arguments)?;
        serde_json::from_value(json!({ "tool": name, "arguments": arguments })).map_err(|e| {
            GatewayError::InvalidArguments {
                tool: name.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// The server this invocation targets, for policy checks.
    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::Install { server_id, .. }
            | Self::Uninstall { server_id }
            | Self::CallTool { server_id, .. }
            | Self::GetServerConfig { server_id } => Some(server_id),
            Self::ListTools { server_id } => server_id.as_deref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize(_) => "initialize",
            Self::Search { .. } => "search",
            Self::LookupEntity { .. } => "lookup_entity",
            Self::Install { .. } => "install",
            Self::Uninstall { .. } => "uninstall",
            Self::CallTool { .. } => "call_tool",
            Self::ListTools { .. } => "list_tools",
            Self::ListServers {} => "list_servers",
            Self::GetServerConfig { .. } => "get_server_config",
            Self::SavePlaybook(_) => "save_playbook",
            Self::LogPlaybookUsage(_) => "log_playbook_usage",
            Self::SubmitFeedback(_) => "submit_feedback",
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
