//! JSON-RPC plumbing shared by every pipe in the system.
//!
//! - `types`: the wire envelope as a closed message union
//! - `framing`: newline-delimited JSON over a byte pipe
//! - `pending`: request id → waiting caller
//! - `client`: correlated requests with per-request timeouts
//! - `server`: the answering side of a pipe

pub mod client;
pub mod errors;
pub mod framing;
pub mod pending;
pub mod server;
pub mod types;

pub use client::{Outbound, PipeOutbound, RpcClient};
pub use errors::RpcError;
pub use framing::{FrameDecoder, FrameReader, FrameWriter};
pub use server::{serve, RequestHandler};
pub use types::{error_codes, Message, MessageId, Notification, Request, Response, RpcErrorObject};
