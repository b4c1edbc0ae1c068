//! Request-serving loop for a framed pipe.
//!
//! Reads frames from `input`, hands each request to a [`RequestHandler`] on
//! its own task, and writes the response to `output`. Requests are answered
//! as they finish, not in arrival order. Frames that are not valid requests
//! get an `INVALID_REQUEST` error; notifications go to the handler and are
//! never answered.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::framing::{FrameReader, FrameWriter};
use super::types::{error_codes, Message, MessageId, Response, RpcErrorObject};

/// Serves the methods of one side of a pipe.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, RpcErrorObject>;

    async fn on_notification(&self, method: &str, _params: Option<Value>) {
        tracing::debug!(method, "notification ignored");
    }
}

/// `-1000` carrying the error's message.
pub fn handler_error(e: impl Display) -> RpcErrorObject {
    RpcErrorObject::new(error_codes::HANDLER_ERROR, e.to_string())
}

pub fn invalid_params(e: impl Display) -> RpcErrorObject {
    RpcErrorObject::new(error_codes::INVALID_PARAMS, format!("Invalid params: {e}"))
}

pub fn method_not_found(method: &str) -> RpcErrorObject {
    RpcErrorObject::new(
        error_codes::METHOD_NOT_FOUND,
        format!("Method not found: {method}"),
    )
}

/// Decode `params` into `T`, treating absent params as `{}`.
pub fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
) -> Result<T, RpcErrorObject> {
    let params = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(params).map_err(invalid_params)
}

/// Serve until `input` reaches EOF. Requests still running at EOF are aborted.
pub async fn serve<R, W>(peer: &str, input: R, output: W, handler: Arc<dyn RequestHandler>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(Mutex::new(FrameWriter::new(output)));
    let mut reader = FrameReader::start(peer, input);
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            frame = reader.recv() => {
                let Some(value) = frame else { break };
                match Message::from_value(value) {
                    Ok(Message::Request(request)) => {
                        let handler = handler.clone();
                        let writer = writer.clone();
                        let peer = peer.to_string();
                        inflight.spawn(async move {
                            let outcome = handler.handle(&request.method, request.params).await;
                            if let Err(e) = &outcome {
                                tracing::debug!(peer = %peer, method = %request.method, code = e.code, error = %e.message, "request failed");
                            }
                            let response = Response {
                                id: request.id,
                                outcome,
                            };
                            write_response(&peer, &writer, response).await;
                        });
                    }
                    Ok(Message::Notification(notification)) => {
                        handler
                            .on_notification(&notification.method, notification.params)
                            .await;
                    }
                    Ok(Message::Response(response)) => {
                        tracing::debug!(peer = %peer, id = %response.id, "unexpected response ignored");
                    }
                    Err(invalid) => {
                        tracing::warn!(peer = %peer, id = %invalid.id, reason = %invalid.reason, "invalid request");
                        let response = Response::failure(
                            invalid.id,
                            error_codes::INVALID_REQUEST,
                            format!("Invalid Request: {}", invalid.reason),
                        );
                        write_response(peer, &writer, response).await;
                    }
                }
            }
            Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(peer = %peer, error = %e, "request handler panicked");
                    }
                }
            }
        }
    }

    if !inflight.is_empty() {
        tracing::info!(peer = %peer, aborted = inflight.len(), "input closed, aborting in-flight requests");
    }
    inflight.abort_all();
    tracing::info!(peer = %peer, "input closed");
}

async fn write_response<W>(peer: &str, writer: &Mutex<FrameWriter<W>>, response: Response)
where
    W: AsyncWrite + Send + Unpin,
{
    let id: MessageId = response.id.clone();
    let mut writer = writer.lock().await;
    if let Err(e) = writer.send(&Message::Response(response)).await {
        tracing::error!(peer = %peer, id = %id, error = %e, "failed to write response");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
