//! In-process authority.
//!
//! Holds cells keyed by `(table, row, col)`, presence rows, append-only
//! history and a per-table change feed. The WebSocket server uses it as its
//! backing store; tests use it directly, together with the fault injection
//! switches below.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use crate::authority::{Authority, AuthorityError, ChangeStream, CellWrite, PresenceUpdate};
use crate::broadcast::RoomManager;
use crate::model::{
    ActiveActor, ActorId, Axis, Cell, CellKey, CellMutationEvent, HistoryRecord, TableId,
};

#[derive(Default)]
struct TableState {
    cells: BTreeMap<CellKey, Cell>,
    presence: HashMap<ActorId, ActiveActor>,
    history: Vec<HistoryRecord>,
}

/// Authority kept entirely in memory.
pub struct MemoryAuthority {
    tables: RwLock<HashMap<TableId, TableState>>,
    rooms: Arc<RoomManager>,
    reachable: AtomicBool,
    failing_writes: AtomicU64,
    duplicate_inserts: AtomicU64,
    cell_writes: AtomicU64,
    write_delay_ms: AtomicU64,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `feed_capacity` events are buffered per subscriber.
    pub fn with_capacity(feed_capacity: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            rooms: Arc::new(RoomManager::new(feed_capacity)),
            reachable: AtomicBool::new(true),
            failing_writes: AtomicU64::new(0),
            duplicate_inserts: AtomicU64::new(0),
            cell_writes: AtomicU64::new(0),
            write_delay_ms: AtomicU64::new(0),
        }
    }

    /// Simulate the authority going away (every call fails as a transport error).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `n` cell writes fail with a transport error.
    pub fn fail_next_writes(&self, n: u64) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` insert-only writes report a duplicate key, as if
    /// another actor had inserted the cell in the meantime.
    pub fn duplicate_next_inserts(&self, n: u64) {
        self.duplicate_inserts.store(n, Ordering::SeqCst);
    }

    /// Hold every cell write for `delay` before it lands, like a slow link.
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of successful cell writes so far.
    pub fn cell_write_count(&self) -> u64 {
        self.cell_writes.load(Ordering::SeqCst)
    }

    /// Write a cell as another actor would, publishing it on the feed.
    ///
    /// Bypasses reachability so tests can mutate authority state while the
    /// actor under test is "offline".
    pub async fn write_as(
        &self,
        table_id: TableId,
        actor_id: ActorId,
        key: CellKey,
        value: &str,
        timestamp: u64,
    ) -> Cell {
        let (stored, event) = {
            let mut tables = self.tables.write().await;
            let table = tables.entry(table_id).or_default();
            let stored = Self::store_cell(
                table,
                &CellWrite {
                    row: key.row,
                    col: key.col,
                    value: value.to_string(),
                    actor_id,
                    version: 0,
                    timestamp,
                    insert_only: false,
                },
            );
            let old = table.cells.get(&key).map(|c| c.value.clone());
            table.history.push(HistoryRecord {
                row: key.row,
                col: key.col,
                old_value: old,
                new_value: value.to_string(),
                actor_id: Some(actor_id),
                timestamp,
            });
            table.cells.insert(key, stored.clone());
            let event = CellMutationEvent::from_cell(table_id, &stored);
            (stored, event)
        };
        self.rooms.publish(event).await;
        stored
    }

    /// Publish an arbitrary event, e.g. a duplicate or a stale one.
    pub async fn publish_raw(&self, event: CellMutationEvent) -> usize {
        self.rooms.publish(event).await
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    fn check_reachable(&self) -> Result<(), AuthorityError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AuthorityError::Unreachable("authority offline".into()))
        }
    }

    /// Consume one injected write failure, if any are armed.
    fn take_write_failure(&self) -> bool {
        take_one(&self.failing_writes)
    }

    /// Compute the record to store; the version is bumped monotonically.
    fn store_cell(table: &TableState, write: &CellWrite) -> Cell {
        let key = write.key();
        let version = match table.cells.get(&key) {
            Some(current) => write.version.max(current.version.saturating_add(1)),
            None => write.version.max(crate::model::IMPLICIT_VERSION + 1),
        };
        Cell::new(key, write.value.clone(), version, Some(write.actor_id), write.timestamp)
    }
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authority for MemoryAuthority {
    async fn get_cell(
        &self,
        table_id: TableId,
        row: u32,
        col: u32,
    ) -> Result<Option<Cell>, AuthorityError> {
        self.check_reachable()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table_id)
            .and_then(|t| t.cells.get(&CellKey::new(row, col)))
            .cloned())
    }

    async fn upsert_cell(&self, table_id: TableId, write: &CellWrite) -> Result<Cell, AuthorityError> {
        self.check_reachable()?;
        if self.take_write_failure() {
            return Err(AuthorityError::Unreachable("injected write failure".into()));
        }
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let stored = {
            let mut tables = self.tables.write().await;
            let table = tables.entry(table_id).or_default();
            let key = write.key();
            if write.insert_only
                && (table.cells.contains_key(&key) || take_one(&self.duplicate_inserts))
            {
                return Err(AuthorityError::DuplicateKey {
                    row: write.row,
                    col: write.col,
                });
            }
            let stored = Self::store_cell(table, write);
            table.cells.insert(key, stored.clone());
            stored
        };

        self.cell_writes.fetch_add(1, Ordering::SeqCst);
        log::trace!("Stored cell {} v{} in table {table_id}", stored.key(), stored.version);
        self.rooms
            .publish(CellMutationEvent::from_cell(table_id, &stored))
            .await;
        Ok(stored)
    }

    async fn list_cells(&self, table_id: TableId) -> Result<Vec<Cell>, AuthorityError> {
        self.check_reachable()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table_id)
            .map(|t| t.cells.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_line(&self, table_id: TableId, axis: Axis, index: u32) -> Result<(), AuthorityError> {
        self.check_reachable()?;
        let mut tables = self.tables.write().await;
        if let Some(table) = tables.get_mut(&table_id) {
            table.cells.retain(|key, _| match axis {
                Axis::Row => key.row != index,
                Axis::Column => key.col != index,
            });
        }
        Ok(())
    }

    async fn subscribe_changes(&self, table_id: TableId) -> Result<ChangeStream, AuthorityError> {
        self.check_reachable()?;
        let rx = self.rooms.get_or_create(table_id).await.subscribe();
        Ok(receiver_stream(rx))
    }

    async fn upsert_presence(
        &self,
        table_id: TableId,
        update: &PresenceUpdate,
    ) -> Result<(), AuthorityError> {
        self.check_reachable()?;
        let mut tables = self.tables.write().await;
        let table = tables.entry(table_id).or_default();
        table
            .presence
            .insert(update.actor_id, ActiveActor::from(update.clone()));
        Ok(())
    }

    async fn list_presence(&self, table_id: TableId) -> Result<Vec<ActiveActor>, AuthorityError> {
        self.check_reachable()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table_id)
            .map(|t| t.presence.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn append_history(
        &self,
        table_id: TableId,
        record: &HistoryRecord,
    ) -> Result<(), AuthorityError> {
        self.check_reachable()?;
        let mut tables = self.tables.write().await;
        tables
            .entry(table_id)
            .or_default()
            .history
            .push(record.clone());
        Ok(())
    }

    async fn list_history(&self, table_id: TableId) -> Result<Vec<HistoryRecord>, AuthorityError> {
        self.check_reachable()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table_id)
            .map(|t| t.history.iter().rev().cloned().collect())
            .unwrap_or_default())
    }
}

fn take_one(counter: &AtomicU64) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Turn a broadcast receiver into a change stream. Lagged receivers skip
/// ahead; the stream ends when the sender side is gone.
pub(crate) fn receiver_stream(rx: broadcast::Receiver<CellMutationEvent>) -> ChangeStream {
    futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Change feed lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
