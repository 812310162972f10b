//! Debounced JSON-document session store.
//!
//! The store is a single JSON document at `<state_dir>/sessions/sessions.json`
//! mapping session key to entry. Mutations are applied to an in-memory
//! document owned by a writer task and flushed with a debounce: at least
//! 250 ms of quiet, at most 2 s after the first pending change. Writes go
//! through a temp file and rename. A corrupted document is renamed with a
//! timestamp suffix and a fresh one is started.
//!
//! Write errors never block the in-memory path; the document stays dirty
//! and the write is retried on the next change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Quiet period before a pending change is written.
const WRITE_DEBOUNCE: Duration = Duration::from_millis(250);
/// Upper bound on how long a pending change may wait.
const WRITE_MAX_DELAY: Duration = Duration::from_secs(2);
/// Consecutive write failures before the store is considered unwritable.
const FATAL_WRITE_FAILURES: u32 = 10;

/// One history message kept as agent context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
    /// Milliseconds since the epoch.
    pub ts: i64,
}

/// Persisted state of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub surface: String,
    pub to: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// The on-disk document shape.
pub type SessionDocument = HashMap<String, SessionEntry>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

enum StoreMsg {
    Upsert(String, SessionEntry),
    Remove(String),
    /// Write any pending changes now and ack.
    Flush(oneshot::Sender<()>),
}

/// Handle to the session store writer task.
#[derive(Clone)]
pub struct SessionStore {
    tx: mpsc::UnboundedSender<StoreMsg>,
    fatal_rx: watch::Receiver<bool>,
}

impl SessionStore {
    /// Open the store, returning the handle and the recovered document.
    ///
    /// Spawns the writer task that owns the document from then on.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, SessionDocument), StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let document = load_document(&path).await?;
        let recovered = document.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = watch::channel(false);
        tokio::spawn(writer_task(path, document, rx, fatal_tx));

        Ok((Self { tx, fatal_rx }, recovered))
    }

    /// Record a session's latest state. Fire-and-forget; the writer
    /// debounces the actual disk write.
    pub fn upsert(&self, key: &str, entry: SessionEntry) {
        let _ = self.tx.send(StoreMsg::Upsert(key.to_string(), entry));
    }

    /// Drop a session from the document (explicit reset).
    pub fn remove(&self, key: &str) {
        let _ = self.tx.send(StoreMsg::Remove(key.to_string()));
    }

    /// Flush pending changes to disk and wait for the write.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(StoreMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Resolves when the store has failed too many consecutive writes.
    pub async fn unwritable(&self) {
        let mut rx = self.fatal_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Writer task gone; treat as terminal but not fatal.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Read the document; a corrupted file is renamed aside and replaced.
async fn load_document(path: &Path) -> Result<SessionDocument, StoreError> {
    let contents = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionDocument::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    match serde_json::from_str(&contents) {
        Ok(doc) => Ok(doc),
        Err(e) => {
            let backup = corrupt_backup_path(path);
            warn!(
                path = %path.display(),
                backup = %backup.display(),
                error = %e,
                "Session store corrupted, starting fresh"
            );
            if let Err(rename_err) = fs::rename(path, &backup).await {
                warn!(error = %rename_err, "Failed to set aside corrupted store");
            }
            Ok(SessionDocument::new())
        }
    }
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "sessions.json".to_string());
    path.with_file_name(format!("{name}.corrupt-{ts}"))
}

async fn writer_task(
    path: PathBuf,
    mut document: SessionDocument,
    mut rx: mpsc::UnboundedReceiver<StoreMsg>,
    fatal_tx: watch::Sender<bool>,
) {
    let mut failures: u32 = 0;

    while let Some(first) = rx.recv().await {
        let mut pending_acks = Vec::new();
        let mut flush_now = apply(&mut document, first, &mut pending_acks);

        // Debounce: coalesce further changes until a quiet period or the
        // max-delay deadline, whichever comes first.
        let max_deadline = Instant::now() + WRITE_MAX_DELAY;
        while !flush_now {
            tokio::select! {
                _ = tokio::time::sleep(WRITE_DEBOUNCE) => break,
                _ = tokio::time::sleep_until(max_deadline) => break,
                more = rx.recv() => match more {
                    Some(msg) => flush_now = apply(&mut document, msg, &mut pending_acks),
                    None => break,
                },
            }
        }

        match write_document(&path, &document).await {
            Ok(()) => {
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                error!(
                    path = %path.display(),
                    failures,
                    error = %e,
                    "Session store write failed; in-memory state stays authoritative"
                );
                if failures >= FATAL_WRITE_FAILURES {
                    let _ = fatal_tx.send(true);
                }
            }
        }

        for ack in pending_acks {
            let _ = ack.send(());
        }
    }

    // Channel closed: final flush on shutdown.
    if let Err(e) = write_document(&path, &document).await {
        error!(path = %path.display(), error = %e, "Final session store flush failed");
    } else {
        info!(path = %path.display(), sessions = document.len(), "Session store flushed");
    }
}

/// Apply one message to the document. Returns true when the caller should
/// write immediately (explicit flush).
fn apply(
    document: &mut SessionDocument,
    msg: StoreMsg,
    acks: &mut Vec<oneshot::Sender<()>>,
) -> bool {
    match msg {
        StoreMsg::Upsert(key, entry) => {
            document.insert(key, entry);
            false
        }
        StoreMsg::Remove(key) => {
            document.remove(&key);
            false
        }
        StoreMsg::Flush(ack) => {
            acks.push(ack);
            true
        }
    }
}

/// Write the document atomically: temp file, fsync, rename.
async fn write_document(path: &Path, document: &SessionDocument) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(document)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let tmp = path.with_extension("json.tmp");
    let file_result = async {
        let mut file = fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, json.as_bytes()).await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;
    file_result.map_err(|e| StoreError::io(&tmp, e))?;

    fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(surface: &str) -> SessionEntry {
        SessionEntry {
            surface: surface.to_string(),
            to: "+1".to_string(),
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_000,
            last_run_at: None,
            history: vec![HistoryEntry {
                role: "user".to_string(),
                content: "hello".to_string(),
                ts: 1_700_000_000_000,
            }],
        }
    }

    #[tokio::test]
    async fn open_missing_file_yields_empty_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions/sessions.json");
        let (_store, doc) = SessionStore::open(&path).await.unwrap();
        assert!(doc.is_empty());
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");

        let (store, _) = SessionStore::open(&path).await.unwrap();
        store.upsert("whatsapp:+1", entry("whatsapp"));
        store.upsert("telegram:42", entry("telegram"));
        store.remove("telegram:42");
        store.flush().await;

        let (_store2, doc) = SessionStore::open(&path).await.unwrap();
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.get("whatsapp:+1"), Some(&entry("whatsapp")));
    }

    #[tokio::test]
    async fn corrupted_document_renamed_and_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, b"{ not json").await.unwrap();

        let (_store, doc) = SessionStore::open(&path).await.unwrap();
        assert!(doc.is_empty());

        // The corrupted file was set aside with a timestamp suffix.
        let mut found_backup = false;
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(e) = entries.next_entry().await.unwrap() {
            let name = e.file_name().to_string_lossy().to_string();
            if name.contains("corrupt-") {
                found_backup = true;
            }
        }
        assert!(found_backup);
    }

    #[tokio::test]
    async fn upsert_after_flush_persists_latest_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");

        let (store, _) = SessionStore::open(&path).await.unwrap();
        let mut e = entry("whatsapp");
        store.upsert("k", e.clone());
        e.updated_at = 1_700_000_999_000;
        store.upsert("k", e.clone());
        store.flush().await;

        let (_s, doc) = SessionStore::open(&path).await.unwrap();
        assert_eq!(doc.get("k").unwrap().updated_at, 1_700_000_999_000);
    }

    #[test]
    fn entry_serialization_shape() {
        let e = entry("whatsapp");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["surface"], "whatsapp");
        assert_eq!(json["createdAt"], 1_700_000_000_000i64);
        assert_eq!(json["history"][0]["role"], "user");
        assert!(json["lastRunAt"].is_null());
    }
}
