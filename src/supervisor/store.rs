//! Persistent configuration store.
//!
//! The document lives at a single JSON path. Every mutation goes through one
//! writer task that owns the read-merge-write-rename sequence, so writes are
//! totally ordered and a concurrent pair can never lose an update. Reads are
//! unlocked. A file that is not a JSON object is moved aside to
//! `<file>.backup.<timestamp>` and treated as empty. Inside a valid object each
//! entry is decoded on its own: a bad entry is skipped on read and, on the
//! next write, saved to `<file>.rejected.<timestamp>` before it is dropped.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use super::errors::StoreError;
use super::types::{ConfigDocument, ServerConfigEntry};

/// Default file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "servers.json";

enum WriteOp {
    Upsert {
        entry: ServerConfigEntry,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Remove {
        server_id: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
}

/// Handle to the store; clones share the same writer task.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl ConfigStore {
    /// Start the writer task for the document at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document. Absent file is an empty document.
    pub async fn load(&self) -> Result<ConfigDocument, StoreError> {
        Ok(read_document(&self.path).await?.entries)
    }

    /// Insert or overwrite one entry.
    pub async fn upsert(&self, entry: ServerConfigEntry) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Upsert { entry, reply })
            .map_err(|_| StoreError::Stopped)?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }

    /// Remove one entry. Returns whether it was present; absent is not an error.
    pub async fn remove(&self, server_id: &str) -> Result<bool, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Remove {
                server_id: server_id.to_string(),
                reply,
            })
            .map_err(|_| StoreError::Stopped)?;
        rx.await.map_err(|_| StoreError::Stopped)?
    }
}

// ─── Writer task ─────────────────────────────────────────────────────────────

async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Upsert { entry, reply } => {
                let result = apply_upsert(&path, entry).await;
                let _ = reply.send(result);
            }
            WriteOp::Remove { server_id, reply } => {
                let result = apply_remove(&path, &server_id).await;
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(path = %path.display(), "config writer stopped");
}

async fn apply_upsert(path: &Path, entry: ServerConfigEntry) -> Result<(), StoreError> {
    let loaded = read_document(path).await?;
    let mut doc = loaded.entries;
    let server_id = entry.server_id.clone();
    doc.insert(server_id.clone(), entry);
    quarantine(path, &loaded.rejected).await;
    write_document(path, &doc).await?;
    tracing::debug!(server = %server_id, count = doc.len(), "config entry saved");
    Ok(())
}

async fn apply_remove(path: &Path, server_id: &str) -> Result<bool, StoreError> {
    let loaded = read_document(path).await?;
    let mut doc = loaded.entries;
    if doc.remove(server_id).is_none() {
        return Ok(false);
    }
    quarantine(path, &loaded.rejected).await;
    write_document(path, &doc).await?;
    tracing::debug!(server = %server_id, count = doc.len(), "config entry removed");
    Ok(true)
}

// ─── Disk I/O ────────────────────────────────────────────────────────────────

/// A parsed document plus the raw entries that failed to decode.
struct Loaded {
    entries: ConfigDocument,
    rejected: Map<String, Value>,
}

impl Loaded {
    fn empty() -> Self {
        Self {
            entries: ConfigDocument::new(),
            rejected: Map::new(),
        }
    }
}

async fn read_document(path: &Path) -> Result<Loaded, StoreError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::empty()),
        Err(e) => {
            return Err(StoreError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        }
    };

    if text.trim().is_empty() {
        return Ok(Loaded::empty());
    }

    let raw = match serde_json::from_str::<Map<String, Value>>(&text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "config file is corrupt, moving it aside"
            );
            backup_corrupt(path).await;
            return Ok(Loaded::empty());
        }
    };

    let mut loaded = Loaded::empty();
    for (key, value) in raw {
        match decode_entry(&key, value.clone()) {
            Ok(entry) => {
                loaded.entries.insert(key, entry);
            }
            Err(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    server = %key,
                    reason = %reason,
                    "skipping invalid config entry"
                );
                loaded.rejected.insert(key, value);
            }
        }
    }
    Ok(loaded)
}

fn decode_entry(key: &str, value: Value) -> Result<ServerConfigEntry, String> {
    let entry: ServerConfigEntry = serde_json::from_value(value).map_err(|e| e.to_string())?;
    if entry.server_id != key {
        return Err(format!(
            "entry stored under '{key}' names server '{}'",
            entry.server_id
        ));
    }
    entry.validate()?;
    Ok(entry)
}

/// Save entries that are about to be dropped to `<file>.rejected.<timestamp>`.
async fn quarantine(path: &Path, rejected: &Map<String, Value>) {
    if rejected.is_empty() {
        return;
    }
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let dest = sibling(path, &format!("rejected.{stamp}"));
    let written = match serde_json::to_string_pretty(rejected) {
        Ok(content) => tokio::fs::write(&dest, content).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match written {
        Ok(()) => tracing::warn!(
            dest = %dest.display(),
            count = rejected.len(),
            "invalid config entries moved aside"
        ),
        Err(e) => tracing::error!(
            dest = %dest.display(),
            error = %e,
            "failed to save invalid config entries"
        ),
    }
}

/// Move a corrupt document to `<file>.backup.<timestamp>`.
async fn backup_corrupt(path: &Path) {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let backup = sibling(path, &format!("backup.{stamp}"));
    match tokio::fs::rename(path, &backup).await {
        Ok(()) => {
            tracing::warn!(backup = %backup.display(), "corrupt config backed up");
        }
        // Another reader already moved it.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "failed to back up corrupt config"
            );
        }
    }
}

/// Write `doc` to a `.tmp` sibling, then rename it over `path`.
async fn write_document(path: &Path, doc: &ConfigDocument) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(doc).map_err(|e| StoreError::Serialize {
        reason: e.to_string(),
    })?;
    // Refuse to write anything that would not read back.
    serde_json::from_str::<ConfigDocument>(&content).map_err(|e| StoreError::Serialize {
        reason: e.to_string(),
    })?;

    let write_err = |e: std::io::Error| StoreError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp = sibling(path, "tmp");
    let result: std::io::Result<()> = async {
        tokio::fs::write(&tmp, content.as_bytes()).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        tracing::error!(path = %path.display(), error = %e, "config write failed");
        return Err(write_err(e));
    }
    Ok(())
}

/// `servers.json` + `suffix` → `servers.json.<suffix>` in the same directory.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
