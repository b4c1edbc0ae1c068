//! Newline-delimited JSON framing over a raw byte pipe.
//!
//! - `FrameDecoder`: pure buffer splitting, no I/O
//! - `FrameReader`: pumps an `AsyncRead` through a decoder on a background task
//! - `FrameWriter`: writes one JSON document plus a single `\n` per frame
//!
//! A line that fails to parse is dropped with a warning; the lines after it
//! are still delivered.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::Message;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Largest unterminated line kept in the buffer before it is discarded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Read chunk size for the reader task.
const READ_CHUNK_BYTES: usize = 8 * 1024;

// ─── FrameDecoder ────────────────────────────────────────────────────────────

/// Splits an inbound byte stream on `\n` and parses each complete line.
///
/// The trailing fragment after the last newline is kept as the head of the
/// buffer until the rest of the line arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Bytes at the start of `buffer` already known to contain no newline.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every complete frame it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;
            if let Some(value) = decode_line(&line[..line.len() - 1]) {
                frames.push(value);
            }
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_FRAME_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                limit = MAX_FRAME_BYTES,
                "dropping oversized unterminated frame"
            );
            self.clear();
        }

        frames
    }

    /// Flush the trailing fragment at end of stream.
    pub fn finish(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        decode_line(&rest)
    }

    /// Number of bytes waiting for a newline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

/// Parse one line; blank lines and invalid JSON yield `None`.
fn decode_line(line: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Some(value),
        Err(e) => {
            let snippet: String = trimmed.chars().take(200).collect();
            tracing::warn!(error = %e, line = %snippet, "dropping malformed frame");
            None
        }
    }
}

// ─── FrameReader ─────────────────────────────────────────────────────────────

/// Background reader delivering decoded frames to a single consumer.
///
/// `recv()` returns `None` once the pipe reaches EOF (or fails) and every
/// frame before that point has been consumed.
pub struct FrameReader {
    rx: mpsc::UnboundedReceiver<Value>,
    task: Option<JoinHandle<()>>,
}

impl FrameReader {
    /// Start reading `reader` on a new task. `peer` names the pipe in logs.
    pub fn start<R>(peer: &str, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = peer.to_string();
        let task = tokio::spawn(pump(peer, reader, tx));
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Next decoded frame, or `None` after EOF / close.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Detach from the pipe and drop anything still buffered. Idempotent.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn pump<R>(peer: String, mut reader: R, tx: mpsc::UnboundedSender<Value>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                if let Some(value) = decoder.finish() {
                    let _ = tx.send(value);
                }
                tracing::debug!(peer = %peer, "pipe closed");
                break;
            }
            Ok(n) => {
                for value in decoder.push(&chunk[..n]) {
                    if tx.send(value).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "pipe read failed");
                break;
            }
        }
    }
}

// ─── FrameWriter ─────────────────────────────────────────────────────────────

/// Writes frames to a byte pipe, flushing after each one.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, message: &Message) -> std::io::Result<()> {
        self.send_value(&message.to_value()).await
    }

    pub async fn send_value(&mut self, value: &Value) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncBufReadExt;

    #[test]
    fn test_decoder_splits_complete_lines() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_decoder_keeps_partial_fragment() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"{\"id\":").is_empty());
        assert!(decoder.push(b"42,\"res").is_empty());
        let frames = decoder.push(b"ult\":true}\n{\"next\"");
        assert_eq!(frames, vec![json!({"id": 42, "result": true})]);
        assert_eq!(decoder.buffered_len(), "{\"next\"".len());
    }

    #[test]
    fn test_decoder_drops_corrupt_line_and_continues() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"not json at all\n{\"ok\":true}\n");
        assert_eq!(frames, vec![json!({"ok": true})]);
    }

    #[test]
    fn test_decoder_skips_blank_lines_and_crlf() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(b"\n\r\n{\"x\":1}\r\n");
        assert_eq!(frames, vec![json!({"x": 1})]);
    }

    #[test]
    fn test_decoder_finish_flushes_unterminated_frame() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"{\"tail\":1}").is_empty());
        assert_eq!(decoder.finish(), Some(json!({"tail": 1})));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_drops_oversized_fragment() {
        let mut decoder = FrameDecoder::new();
        let big = vec![b'x'; MAX_FRAME_BYTES + 1];
        assert!(decoder.push(&big).is_empty());
        assert_eq!(decoder.buffered_len(), 0);
        assert_eq!(decoder.push(b"{\"after\":1}\n"), vec![json!({"after": 1})]);
    }

    #[tokio::test]
    async fn test_reader_delivers_frames_across_writes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::start("test", rx);

        tx.write_all(b"{\"id\":1,\"res").await.unwrap();
        tx.write_all(b"ult\":{}}\ngarbage\n{\"id\":2,\"result\":{}}\n")
            .await
            .unwrap();
        drop(tx);

        assert_eq!(reader.recv().await.unwrap()["id"], 1);
        assert_eq!(reader.recv().await.unwrap()["id"], 2);
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reader_close_is_idempotent() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::start("test", rx);
        reader.close();
        reader.close();
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_emits_one_line_per_message() {
        let (tx, rx) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(tx);
        writer
            .send(&Message::request(5, "list_servers", None))
            .await
            .unwrap();
        writer.send_value(&json!({"b": 2})).await.unwrap();
        drop(writer);

        let mut lines = tokio::io::BufReader::new(rx).lines();
        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["method"], "list_servers");
        assert_eq!(first["id"], 5);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"b\":2}");
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
