//! Bounded capture of a child's stderr, kept for error messages.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Default number of stderr lines retained per child.
pub const DEFAULT_STDERR_LINES: usize = 50;

/// Longest single line kept; longer lines are truncated.
const MAX_LINE_CHARS: usize = 2000;

/// Ring buffer holding the last `capacity` lines of a stream.
#[derive(Debug, Clone)]
pub struct StderrRing {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: &str) {
        let mut line = line.trim_end().to_string();
        if line.chars().count() > MAX_LINE_CHARS {
            line = line.chars().take(MAX_LINE_CHARS).collect();
            line.push_str("...(truncated)");
        }
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Read `reader` line by line into the ring until EOF.
    ///
    /// Bytes that are not UTF-8 are replaced, never fatal: the pipe stays
    /// drained for the child's whole life.
    pub fn capture<R>(&self, source: &str, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let ring = self.clone();
        let source = source.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        while matches!(buf.last(), Some(b'\n' | b'\r')) {
                            buf.pop();
                        }
                        let line = String::from_utf8_lossy(&buf);
                        tracing::debug!(source = %source, line = %line, "child stderr");
                        ring.push(&line);
                    }
                    Err(e) => {
                        tracing::debug!(source = %source, error = %e, "stderr read failed");
                        break;
                    }
                }
            }
        })
    }
}

/// Format captured stderr as an error-message suffix (empty if nothing captured).
pub fn format_stderr_suffix(lines: &[String]) -> String {
    let joined = lines.join("\n");
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {trimmed}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_ring_keeps_last_lines() {
        let ring = StderrRing::new(3);
        for i in 0..5 {
            ring.push(&format!("line {i}"));
        }
        assert_eq!(ring.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_long_line_truncated() {
        let ring = StderrRing::new(2);
        ring.push(&"x".repeat(MAX_LINE_CHARS + 10));
        let line = &ring.snapshot()[0];
        assert!(line.ends_with("...(truncated)"));
    }

    #[test]
    fn test_format_suffix() {
        assert_eq!(format_stderr_suffix(&[]), "");
        assert_eq!(format_stderr_suffix(&["  ".into()]), "");
        assert_eq!(
            format_stderr_suffix(&["Error: missing module".into()]),
            " | stderr: Error: missing module"
        );
    }

    #[tokio::test]
    async fn test_capture_reads_until_eof() {
        let ring = StderrRing::new(DEFAULT_STDERR_LINES);
        let (mut tx, rx) = tokio::io::duplex(256);
        let task = ring.capture("test", rx);
        tx.write_all(b"first\nsecond\n").await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(ring.snapshot(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_capture_survives_invalid_utf8() {
        let ring = StderrRing::new(DEFAULT_STDERR_LINES);
        let (mut tx, rx) = tokio::io::duplex(256);
        let task = ring.capture("test", rx);
        tx.write_all(b"bad \xff\xfe bytes\r\nstill reading\n").await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(
            ring.snapshot(),
            vec!["bad \u{FFFD}\u{FFFD} bytes", "still reading"]
        );
    }
}
