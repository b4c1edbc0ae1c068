//! Wire envelope shared by the gateway, the manager and tool servers.
//!
//! Every frame on the pipe is one JSON object. Inbound frames are validated
//! once, at the parse boundary, into the closed [`Message`] union; nothing
//! past this module handles untyped envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope version written on every outbound frame.
pub const JSONRPC_VERSION: &str = "2.0";

// ─── Message Id ──────────────────────────────────────────────────────────────

/// Correlation id of a request/response pair.
///
/// `Null` marks a frame whose id could not be recovered; it never
/// correlates with a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(u64),
    String(String),
    Null,
}

impl MessageId {
    /// Numeric id, also accepting numeric strings (`"17"`).
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            MessageId::Number(n) => Some(*n),
            MessageId::String(s) => s.parse().ok(),
            MessageId::Null => None,
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => write!(f, "{s}"),
            MessageId::Null => write!(f, "null"),
        }
    }
}

// ─── Error Object ────────────────────────────────────────────────────────────

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

// ─── Message Union ───────────────────────────────────────────────────────────

/// A request that expects a correlated response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: MessageId,
    pub method: String,
    pub params: Option<Value>,
}

/// A one-way message with no id.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A success or error response to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: MessageId,
    pub outcome: Result<Value, RpcErrorObject>,
}

impl Response {
    pub fn success(id: MessageId, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: MessageId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Err(RpcErrorObject::new(code, message)),
        }
    }
}

/// Every valid frame is exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

/// Why an inbound frame could not be classified.
///
/// `id` is whatever id could be recovered so the receiver can still answer
/// with `INVALID_REQUEST`; it is `MessageId::Null` when none was present.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    pub id: MessageId,
    pub reason: String,
}

/// Raw envelope used only at the serde boundary.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "protocolVersion")]
    jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcErrorObject>,
}

impl Message {
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: MessageId::Number(id),
            method: method.to_string(),
            params,
        })
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.to_string(),
            params,
        })
    }

    /// Classify a decoded JSON frame.
    ///
    /// Frames carrying `result` or `error` are responses. Anything else must
    /// carry a `method`; a method without an id is a notification.
    pub fn from_value(value: Value) -> Result<Message, InvalidMessage> {
        if !value.is_object() {
            return Err(InvalidMessage {
                id: MessageId::Null,
                reason: "frame is not a JSON object".into(),
            });
        }

        let recovered_id = value
            .get("id")
            .and_then(|v| serde_json::from_value::<MessageId>(v.clone()).ok())
            .unwrap_or(MessageId::Null);
        let explicit_null_id = matches!(value.get("id"), Some(Value::Null));
        let has_result = value.get("result").is_some();

        let envelope: Envelope = serde_json::from_value(value).map_err(|e| InvalidMessage {
            id: recovered_id.clone(),
            reason: format!("malformed envelope: {e}"),
        })?;

        if let Some(error) = envelope.error {
            return Ok(Message::Response(Response {
                id: envelope.id.unwrap_or(MessageId::Null),
                outcome: Err(error),
            }));
        }
        if envelope.method.is_none() && has_result {
            return Ok(Message::Response(Response {
                id: envelope.id.unwrap_or(MessageId::Null),
                outcome: Ok(envelope.result.unwrap_or(Value::Null)),
            }));
        }

        if explicit_null_id {
            return Err(InvalidMessage {
                id: MessageId::Null,
                reason: "request id must not be null".into(),
            });
        }

        match (envelope.id, envelope.method) {
            (Some(id), Some(method)) if !method.is_empty() => Ok(Message::Request(Request {
                id,
                method,
                params: envelope.params,
            })),
            (None, Some(method)) if !method.is_empty() => {
                Ok(Message::Notification(Notification {
                    method,
                    params: envelope.params,
                }))
            }
            (id, _) => Err(InvalidMessage {
                id: id.unwrap_or(MessageId::Null),
                reason: "missing method".into(),
            }),
        }
    }

    /// Encode as a JSON object with the envelope version attached.
    pub fn to_value(&self) -> Value {
        let mut envelope = Envelope {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            ..Envelope::default()
        };
        match self {
            Message::Request(req) => {
                envelope.id = Some(req.id.clone());
                envelope.method = Some(req.method.clone());
                envelope.params = req.params.clone();
            }
            Message::Notification(note) => {
                envelope.method = Some(note.method.clone());
                envelope.params = note.params.clone();
            }
            Message::Response(resp) => {
                envelope.id = Some(resp.id.clone());
                match &resp.outcome {
                    Ok(result) => envelope.result = Some(result.clone()),
                    Err(error) => envelope.error = Some(error.clone()),
                }
            }
        }
        serde_json::to_value(&envelope).unwrap_or(Value::Null)
    }
}

// ─── Error Codes ─────────────────────────────────────────────────────────────

/// Error codes used on both the agent-facing and the manager pipes.
pub mod error_codes {
    /// An uncaught handler failure; the message is the error's text.
    pub const HANDLER_ERROR: i64 = -1000;
    /// The frame is missing `id` or `method`.
    pub const INVALID_REQUEST: i64 = -1001;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
