//! Coalescing snapshot writer.
//!
//! ```text
//! schedule(s1) ─┐
//! schedule(s2) ─┼─ window (~400ms) ──► save(s3)
//! schedule(s3) ─┘
//! flush()      ──────────────────────► save(latest) now
//! drop / close ──────────────────────► save(latest), task exits
//! ```
//!
//! The window opens on the first schedule after a write, so a steady stream
//! of edits is persisted at least once per window instead of starving.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{SnapshotStore, StoreError};
use crate::model::TableSnapshot;

enum WriterCommand {
    Save(TableSnapshot),
    Flush(oneshot::Sender<Result<(), StoreError>>),
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub scheduled: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct AtomicWriterStats {
    scheduled: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Background writer for one table key.
pub struct SnapshotWriter {
    tx: mpsc::UnboundedSender<WriterCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<AtomicWriterStats>,
}

impl SnapshotWriter {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn SnapshotStore>, table_key: String, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicWriterStats::default());
        let handle = tokio::spawn(Self::run(store, table_key, window, rx, stats.clone()));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            stats,
        }
    }

    /// Queue a snapshot for persistence; only the latest one in a window is written.
    pub fn schedule(&self, snapshot: TableSnapshot) {
        self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(WriterCommand::Save(snapshot)).is_err() {
            log::warn!("Snapshot writer closed, dropping scheduled save");
        }
    }

    /// Write whatever is pending right now.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(reply_tx))
            .map_err(|_| StoreError::WriterClosed)?;
        reply_rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Flush and stop the task.
    pub async fn close(&self) -> Result<(), StoreError> {
        let result = self.flush().await;
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        result
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            scheduled: self.stats.scheduled.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    async fn run(
        store: Arc<dyn SnapshotStore>,
        table_key: String,
        window: Duration,
        mut rx: mpsc::UnboundedReceiver<WriterCommand>,
        stats: Arc<AtomicWriterStats>,
    ) {
        let mut latest: Option<TableSnapshot> = None;
        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        Self::write(&*store, &table_key, latest.take(), &stats).ok();
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match command {
                Some(WriterCommand::Save(snapshot)) => {
                    latest = Some(snapshot);
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + window);
                    }
                }
                Some(WriterCommand::Flush(reply)) => {
                    deadline = None;
                    let result = Self::write(&*store, &table_key, latest.take(), &stats);
                    let _ = reply.send(result);
                }
                None => {
                    // Every handle dropped: persist the last state before exiting.
                    Self::write(&*store, &table_key, latest.take(), &stats).ok();
                    break;
                }
            }
        }
    }

    fn write(
        store: &dyn SnapshotStore,
        table_key: &str,
        snapshot: Option<TableSnapshot>,
        stats: &AtomicWriterStats,
    ) -> Result<(), StoreError> {
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        match store.save(table_key, &snapshot) {
            Ok(()) => {
                stats.written.fetch_add(1, Ordering::Relaxed);
                log::trace!("Persisted snapshot {table_key}");
                Ok(())
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist snapshot {table_key}: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cell, CellKey};
    use crate::storage::MemoryStore;

    fn snapshot_with(value: &str) -> TableSnapshot {
        let mut snap = TableSnapshot::default();
        snap.upsert_confirmed(Cell::new(CellKey::new(0, 0), value, 2, None, 1));
        snap
    }

    #[tokio::test]
    async fn test_rapid_saves_are_coalesced() {
        let store = Arc::new(MemoryStore::new());
        let writer = SnapshotWriter::spawn(store.clone(), "grid:t".into(), Duration::from_millis(100));

        for i in 0..10 {
            writer.schedule(snapshot_with(&format!("v{i}")));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stats = writer.stats();
        assert_eq!(stats.scheduled, 10);
        assert_eq!(stats.written, 1);
        let stored = store.load("grid:t").unwrap().unwrap();
        assert_eq!(stored.cells[&CellKey::new(0, 0)].value, "v9");
    }

    #[tokio::test]
    async fn test_flush_writes_immediately() {
        let store = Arc::new(MemoryStore::new());
        let writer = SnapshotWriter::spawn(store.clone(), "grid:t".into(), Duration::from_secs(60));

        writer.schedule(snapshot_with("now"));
        writer.flush().await.unwrap();
        assert_eq!(writer.stats().written, 1);
        assert!(store.load("grid:t").unwrap().is_some());

        // Nothing pending: flush is a no-op.
        writer.flush().await.unwrap();
        assert_eq!(writer.stats().written, 1);
    }

    #[tokio::test]
    async fn test_close_flushes_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let writer = SnapshotWriter::spawn(store.clone(), "grid:t".into(), Duration::from_secs(60));

        writer.schedule(snapshot_with("last"));
        writer.close().await.unwrap();
        assert_eq!(
            store.load("grid:t").unwrap().unwrap().cells[&CellKey::new(0, 0)].value,
            "last"
        );

        tokio::task::yield_now().await;
        assert!(writer.flush().await.is_err());
    }
}
