//! Best-effort snapshot persistence
//!
//! Mutations hand a snapshot to a [`SnapshotWriter`]; a background task
//! writes the most recent one. Bursts of mutations collapse into one write,
//! and a failed write is logged without touching in-memory state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::{GatewayError, Result};

type Pending<T> = Option<(u64, Arc<T>)>;

/// Handle feeding snapshots to a background writer task
pub struct SnapshotWriter<T> {
    label: &'static str,
    next_seq: AtomicU64,
    pending: watch::Sender<Pending<T>>,
    written: watch::Receiver<u64>,
}

impl<T: Serialize + Send + Sync + 'static> SnapshotWriter<T> {
    /// Spawn a writer for `path`. Must be called within a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>, label: &'static str) -> Self {
        let path = path.into();
        let (pending_tx, mut pending_rx) = watch::channel::<Pending<T>>(None);
        let (written_tx, written_rx) = watch::channel(0u64);

        tokio::spawn(async move {
            while pending_rx.changed().await.is_ok() {
                let latest = pending_rx.borrow_and_update().clone();
                let Some((seq, snapshot)) = latest else {
                    continue;
                };
                match write_json(&path, snapshot.as_ref()).await {
                    Ok(()) => debug!(store = label, path = %path.display(), "Snapshot written"),
                    Err(e) => error!(store = label, path = %path.display(), error = %e, "Failed to persist snapshot"),
                }
                written_tx.send_replace(seq);
            }
            debug!(store = label, "Snapshot writer finished");
        });

        Self {
            label,
            next_seq: AtomicU64::new(0),
            pending: pending_tx,
            written: written_rx,
        }
    }

    /// A writer that drops every snapshot, for in-memory operation
    pub fn disabled(label: &'static str) -> Self {
        let (pending, _) = watch::channel(None);
        let (_, written) = watch::channel(u64::MAX);
        Self {
            label,
            next_seq: AtomicU64::new(0),
            pending,
            written,
        }
    }

    /// Queue a snapshot, replacing any not yet written
    pub fn submit(&self, snapshot: T) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.send_replace(Some((seq, Arc::new(snapshot))));
    }

    /// Wait until every snapshot submitted so far has been written (or failed)
    pub async fn flush(&self) {
        let target = self.next_seq.load(Ordering::SeqCst);
        let mut written = self.written.clone();
        if written.wait_for(|seq| *seq >= target).await.is_err() {
            debug!(store = self.label, "Snapshot writer gone before flush completed");
        }
    }
}

/// Write pretty JSON atomically: temp file in the same directory, then rename
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| GatewayError::Persistence(format!("serialize: {e}")))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).await.map_err(io_error)?;
    fs::rename(&tmp, path).await.map_err(io_error)?;
    Ok(())
}

/// Read a JSON snapshot; a missing file is `Ok(None)`
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| GatewayError::Persistence(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(e)),
    }
}

fn io_error(e: std::io::Error) -> GatewayError {
    GatewayError::Persistence(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_latest_snapshot_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/devices.json");
        let writer = SnapshotWriter::spawn(&path, "test");

        for n in 1..=5u32 {
            writer.submit(vec![n; n as usize]);
        }
        writer.flush().await;

        let stored: Option<Vec<u32>> = read_json(&path).await.unwrap();
        assert_eq!(stored, Some(vec![5; 5]));
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let stored: Option<Vec<u32>> = read_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, b"{ not json").await.unwrap();
        let result: Result<Option<Vec<u32>>> = read_json(&path).await;
        assert!(matches!(result, Err(GatewayError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_write_failure_does_not_block_flush() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the rename fail
        let path = dir.path().join("blocked");
        fs::create_dir_all(path.join("inner")).await.unwrap();
        let writer = SnapshotWriter::spawn(&path, "test");
        writer.submit(vec![1u32]);
        writer.flush().await;
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_disabled_writer_flushes_immediately() {
        let writer = SnapshotWriter::<Vec<u32>>::disabled("test");
        writer.submit(vec![1]);
        writer.flush().await;
    }
}
