//! Sync engine: drains the pending-change queue against the authority.
//!
//! ```text
//!            ┌──────── online ────────┐
//!            ▼                        │
//!  Offline ──────► Idle ── sync_pending() ──► Syncing ──► Idle
//!            ▲                                  │
//!            └──────────── offline ─────────────┘
//! ```
//!
//! A pass walks the queue in insertion order, one cell at a time:
//! fetch the authority record, resolve, then write through or drop.
//! Failed cells stay queued for the next pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::authority::{Authority, AuthorityError, CellWrite};
use crate::cache::TableCache;
use crate::connectivity::ConnectivityMonitor;
use crate::model::{ActorId, Cell, HistoryRecord, PendingChange, TableId};
use crate::resolver::{resolve, superseded_history, Resolution};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Idle,
    Syncing,
}

/// Summary of one pass. Failures are counted, never itemized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Written through (or found already written).
    pub synced: usize,
    /// Dropped because the authority held a newer value.
    pub superseded: usize,
    pub failed: usize,
    /// Pending changes left after the pass.
    pub remaining: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.synced == 0 && self.superseded == 0 && self.failed == 0
    }
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum CellOutcome {
    Synced,
    Superseded,
    Failed,
}

pub struct SyncEngine {
    table_id: TableId,
    actor_id: ActorId,
    authority: Arc<dyn Authority>,
    cache: Arc<TableCache>,
    connectivity: Arc<ConnectivityMonitor>,
    write_spacing: Duration,
    running: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        actor_id: ActorId,
        authority: Arc<dyn Authority>,
        cache: Arc<TableCache>,
        connectivity: Arc<ConnectivityMonitor>,
        write_spacing: Duration,
    ) -> Self {
        Self {
            table_id: cache.table_id(),
            actor_id,
            authority,
            cache,
            connectivity,
            write_spacing,
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SyncState {
        if self.running.load(Ordering::SeqCst) {
            SyncState::Syncing
        } else if self.connectivity.is_online() {
            SyncState::Idle
        } else {
            SyncState::Offline
        }
    }

    /// Run one pass over the pending queue.
    ///
    /// Returns `None` without doing anything when offline or when a pass is
    /// already in flight for this table.
    pub async fn sync_pending(&self) -> Option<SyncReport> {
        if !self.connectivity.is_online() {
            log::debug!("Skipping sync of table {}: offline", self.table_id);
            return None;
        }
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            log::debug!("Skipping sync of table {}: pass in flight", self.table_id);
            return None;
        };

        let queue = self.cache.pending_changes().await;
        let mut report = SyncReport::default();

        for (i, change) in queue.iter().enumerate() {
            if self.cache.is_closed() {
                break;
            }
            if i > 0 && !self.write_spacing.is_zero() {
                tokio::time::sleep(self.write_spacing).await;
            }
            match self.sync_one(change).await {
                CellOutcome::Synced => report.synced += 1,
                CellOutcome::Superseded => report.superseded += 1,
                CellOutcome::Failed => report.failed += 1,
            }
        }

        if report.synced + report.superseded > 0 {
            if let Err(e) = self.reload().await {
                log::warn!("Reload after sync of table {} failed: {e}", self.table_id);
            }
        }
        report.remaining = self.cache.pending_count().await;

        if !queue.is_empty() {
            log::info!(
                "Synced table {}: {} synced, {} superseded, {} failed, {} remaining",
                self.table_id,
                report.synced,
                report.superseded,
                report.failed,
                report.remaining
            );
        }
        Some(report)
    }

    /// Write one freshly staged change straight through.
    ///
    /// Holds the same in-flight flag as a pass, so a change is never written
    /// by both. Returns `None` when offline or a pass is running; the change
    /// then stays queued for the next pass.
    pub async fn push(
        &self,
        change: &PendingChange,
        previous: Option<String>,
    ) -> Option<Result<Cell, AuthorityError>> {
        if !self.connectivity.is_online() {
            return None;
        }
        let _guard = PassGuard::acquire(&self.running)?;

        let key = change.key();
        let write = CellWrite::from_change(change, self.actor_id, change.version, false);
        let stored = match self.authority.upsert_cell(self.table_id, &write).await {
            Ok(stored) => stored,
            Err(e) => return Some(Err(e)),
        };
        self.record_history(HistoryRecord {
            row: key.row,
            col: key.col,
            old_value: previous,
            new_value: stored.value.clone(),
            actor_id: Some(self.actor_id),
            timestamp: stored.last_modified_at,
        })
        .await;
        self.settle(change, Some(stored.clone())).await;
        Some(Ok(stored))
    }

    async fn sync_one(&self, change: &PendingChange) -> CellOutcome {
        let key = change.key();
        let remote = match self.authority.get_cell(self.table_id, key.row, key.col).await {
            Ok(remote) => remote,
            Err(e) => {
                log::debug!("Fetching {key} failed: {e}");
                return CellOutcome::Failed;
            }
        };

        match resolve(change, remote.as_ref()) {
            Resolution::Apply { version } => {
                let write = CellWrite::from_change(change, self.actor_id, version, remote.is_none());
                match self.authority.upsert_cell(self.table_id, &write).await {
                    Ok(stored) => {
                        self.record_history(HistoryRecord {
                            row: key.row,
                            col: key.col,
                            old_value: remote.map(|c| c.value),
                            new_value: stored.value.clone(),
                            actor_id: Some(self.actor_id),
                            timestamp: stored.last_modified_at,
                        })
                        .await;
                        self.settle(change, Some(stored)).await;
                        CellOutcome::Synced
                    }
                    Err(AuthorityError::DuplicateKey { .. }) => {
                        // Someone inserted the row first; the reload brings it in.
                        log::debug!("Cell {key} already present at the authority");
                        self.settle(change, None).await;
                        CellOutcome::Synced
                    }
                    Err(e) => {
                        log::debug!("Writing {key} failed: {e}");
                        CellOutcome::Failed
                    }
                }
            }
            Resolution::Supersede => {
                let Some(remote) = remote else {
                    return CellOutcome::Failed;
                };
                log::debug!(
                    "Local change to {key} superseded by v{} from the authority",
                    remote.version
                );
                if let Some(record) = superseded_history(change, &remote) {
                    self.record_history(record).await;
                }
                self.settle(change, Some(remote)).await;
                CellOutcome::Superseded
            }
        }
    }

    async fn settle(&self, change: &PendingChange, confirmed: Option<Cell>) {
        self.cache
            .mutate(|snapshot| {
                snapshot.settle_pending(change);
                if let Some(cell) = confirmed {
                    snapshot.upsert_confirmed(cell);
                }
            })
            .await;
    }

    async fn record_history(&self, record: HistoryRecord) {
        if let Err(e) = self.authority.append_history(self.table_id, &record).await {
            log::warn!("Appending history for {}-{} failed: {e}", record.row, record.col);
        }
    }

    /// Replace confirmed cells with the authority's full listing.
    ///
    /// Returns the number of cells loaded.
    pub async fn reload(&self) -> Result<usize, AuthorityError> {
        let cells = self.authority.list_cells(self.table_id).await?;
        let count = cells.len();
        self.cache
            .mutate(|snapshot| snapshot.replace_confirmed(cells))
            .await;
        log::debug!("Reloaded table {}: {count} cells", self.table_id);
        Ok(count)
    }
}
