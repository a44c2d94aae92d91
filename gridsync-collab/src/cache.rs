//! Local durable cache of one table.
//!
//! The cache exclusively owns the confirmed cell map and the pending-change
//! queue. Every writer goes through [`TableCache::mutate`], which runs a
//! read-modify-write of the whole snapshot under a single lock and then
//! schedules a coalesced save.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::model::{Cell, CellKey, GridSize, GridView, PendingChange, TableId, TableSnapshot};
use crate::storage::{table_key, SnapshotStore, SnapshotWriter, StoreError, WriterStats};

pub struct TableCache {
    table_id: TableId,
    snapshot: Mutex<TableSnapshot>,
    writer: SnapshotWriter,
    closed: AtomicBool,
}

impl TableCache {
    /// Load the table's last persisted state, or start from an empty 10×10
    /// grid. Must be called from within a tokio runtime.
    pub fn open(
        table_id: TableId,
        store: Arc<dyn SnapshotStore>,
        save_debounce: Duration,
    ) -> Result<Self, StoreError> {
        let key = table_key(table_id);
        let snapshot = match store.load(&key)? {
            Some(snapshot) => {
                log::info!(
                    "Loaded table {table_id} from cache: {} cells, {} pending",
                    snapshot.cells.len(),
                    snapshot.pending_changes.len()
                );
                snapshot
            }
            None => TableSnapshot::default(),
        };
        Ok(Self {
            table_id,
            snapshot: Mutex::new(snapshot),
            writer: SnapshotWriter::spawn(store, key, save_debounce),
            closed: AtomicBool::new(false),
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Apply `f` to the snapshot and schedule persistence.
    ///
    /// Returns `None` once the cache is closed; late results from in-flight
    /// work are discarded.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut TableSnapshot) -> R) -> Option<R> {
        let mut snapshot = self.snapshot.lock().await;
        if self.is_closed() {
            return None;
        }
        let result = f(&mut snapshot);
        self.writer.schedule(snapshot.clone());
        Some(result)
    }

    pub async fn snapshot(&self) -> TableSnapshot {
        self.snapshot.lock().await.clone()
    }

    pub async fn view(&self) -> GridView {
        self.snapshot.lock().await.view()
    }

    pub async fn size(&self) -> GridSize {
        self.snapshot.lock().await.size()
    }

    pub async fn confirmed(&self, key: CellKey) -> Option<Cell> {
        self.snapshot.lock().await.confirmed(key).cloned()
    }

    pub async fn effective(&self, key: CellKey) -> Option<Cell> {
        self.snapshot.lock().await.effective(key).cloned()
    }

    /// Pending changes in queue order.
    pub async fn pending_changes(&self) -> Vec<PendingChange> {
        self.snapshot
            .lock()
            .await
            .pending_changes
            .values()
            .cloned()
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.snapshot.lock().await.pending_changes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn writer_stats(&self) -> WriterStats {
        self.writer.stats()
    }

    /// Persist any scheduled save now.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.writer.flush().await
    }

    /// Stop accepting mutations and flush the last state.
    pub async fn close(&self) -> Result<(), StoreError> {
        {
            // Wait for any mutation in progress so its save is scheduled first.
            let _guard = self.snapshot.lock().await;
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
        }
        log::debug!("Closing cache for table {}", self.table_id);
        self.writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_open_empty_table_defaults_to_ten_by_ten() {
        let store = Arc::new(MemoryStore::new());
        let cache = TableCache::open(Uuid::new_v4(), store, Duration::from_millis(10)).unwrap();
        assert_eq!(cache.size().await, GridSize::new(10, 10));
        assert_eq!(cache.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let store = Arc::new(MemoryStore::new());
        let table = Uuid::new_v4();
        let actor = Uuid::new_v4();

        let cache = TableCache::open(table, store.clone(), Duration::from_secs(60)).unwrap();
        cache
            .mutate(|s| s.stage_local_edit(CellKey::new(0, 0), "x", actor, 1))
            .await
            .unwrap();
        cache.close().await.unwrap();

        let reopened = TableCache::open(table, store, Duration::from_secs(60)).unwrap();
        let pending = reopened.pending_changes().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value, "x");
        assert_eq!(pending[0].version, 2);
    }

    #[tokio::test]
    async fn test_closed_cache_discards_mutations() {
        let store = Arc::new(MemoryStore::new());
        let cache = TableCache::open(Uuid::new_v4(), store, Duration::from_millis(10)).unwrap();
        cache.close().await.unwrap();

        let result = cache
            .mutate(|s| s.upsert_confirmed(Cell::new(CellKey::new(0, 0), "late", 2, None, 1)))
            .await;
        assert!(result.is_none());
        assert!(cache.confirmed(CellKey::new(0, 0)).await.is_none());
        // Closing twice is fine.
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutations_are_coalesced_into_few_writes() {
        let store = Arc::new(MemoryStore::new());
        let cache = TableCache::open(Uuid::new_v4(), store, Duration::from_millis(50)).unwrap();
        let actor = Uuid::new_v4();
        for i in 0..20 {
            cache
                .mutate(|s| s.stage_local_edit(CellKey::new(0, 0), format!("v{i}"), actor, i))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = cache.writer_stats();
        assert_eq!(stats.scheduled, 20);
        assert_eq!(stats.written, 1);
    }
}
