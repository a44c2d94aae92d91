//! Table session: one actor editing one table.
//!
//! ```text
//!                 ┌──────────────────── TableSession ────────────────────┐
//!  begin_edit ──► │ EditSession ──commit──► TableCache (stage pending)   │
//!  commit_edit    │                              │                       │
//!                 │                 online? ─────┴──► upsert_cell        │
//!                 │                                                      │
//!  tasks:         │ feed loop      subscribe_changes ─► ChangeFeedConsumer│
//!                 │ heartbeat      every ~10s ─► PresenceTracker         │
//!                 │ sync loop      reconnect (1s debounce) / every ~4s   │
//!                 │                ─► SyncEngine::sync_pending           │
//!                 └──────────────────────────────────────────────────────┘
//!                        │
//!                        ▼ SessionEvent (mpsc)
//! ```
//!
//! All background tasks are aborted together when the session closes; the
//! cache is flushed last.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::authority::{Authority, AuthorityError};
use crate::cache::TableCache;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::edit::{CommitOutcome, EditError, EditSession, EditState};
use crate::feed::ChangeFeedConsumer;
use crate::model::{
    now_millis, ActiveActor, ActorId, Axis, Cell, CellKey, GridSize, GridView, HistoryRecord,
    TableId,
};
use crate::presence::{editors_by_cell, PresenceTracker};
use crate::storage::{SnapshotStore, StoreError};
use crate::sync::{SyncEngine, SyncReport, SyncState};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Session timing configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Window for coalescing cache saves.
    pub save_debounce: Duration,
    /// Delay between coming back online and the first sync pass.
    pub reconnect_debounce: Duration,
    /// Periodic sync while pending changes remain.
    pub sync_interval: Duration,
    /// Delay between successive writes of one pass.
    pub write_spacing: Duration,
    pub heartbeat_interval: Duration,
    pub liveness_window: Duration,
    /// Capacity of the session event channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(400),
            reconnect_debounce: Duration::from_secs(1),
            sync_interval: Duration::from_secs(4),
            write_spacing: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(10),
            liveness_window: Duration::from_secs(35),
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            save_debounce: Duration::from_millis(20),
            reconnect_debounce: Duration::from_millis(50),
            sync_interval: Duration::from_millis(100),
            write_spacing: Duration::ZERO,
            heartbeat_interval: Duration::from_millis(100),
            liveness_window: Duration::from_secs(35),
            event_capacity: 256,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Events & errors
// ───────────────────────────────────────────────────────────────────

/// User-facing notifications. Sync outcomes are summarized, never per cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connectivity(Connectivity),
    /// An edit could not reach the authority and was queued.
    SavedOffline { row: u32, col: u32 },
    SyncCompleted {
        synced: usize,
        failed: usize,
        remaining: usize,
    },
    /// Local changes dropped because someone else wrote later.
    Superseded { count: usize },
    /// Confirmed cells were replaced by a full reload.
    Reloaded { cells: usize },
}

#[derive(Debug, Clone)]
pub enum SessionError {
    Store(StoreError),
    Authority(AuthorityError),
    Edit(EditError),
    /// The session was closed.
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Store(e) => write!(f, "Store error: {e}"),
            SessionError::Authority(e) => write!(f, "{e}"),
            SessionError::Edit(e) => write!(f, "Edit error: {e}"),
            SessionError::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

impl From<AuthorityError> for SessionError {
    fn from(e: AuthorityError) -> Self {
        SessionError::Authority(e)
    }
}

impl From<EditError> for SessionError {
    fn from(e: EditError) -> Self {
        SessionError::Edit(e)
    }
}

/// Result of writing a cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// Value equal to the one before the edit; nothing written.
    Unchanged,
    /// Confirmed by the authority.
    Saved(Cell),
    /// Queued locally.
    SavedOffline,
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

pub struct TableSession {
    table_id: TableId,
    actor_id: ActorId,
    cache: Arc<TableCache>,
    authority: Arc<dyn Authority>,
    connectivity: Arc<ConnectivityMonitor>,
    engine: Arc<SyncEngine>,
    presence: Arc<PresenceTracker>,
    feed: Arc<ChangeFeedConsumer>,
    edits: Arc<Mutex<EditSession>>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TableSession {
    /// Open a table: load the local cache, reload from the authority when
    /// online, and start the feed, heartbeat and sync tasks.
    pub async fn open(
        table_id: TableId,
        actor_id: ActorId,
        username: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
        authority: Arc<dyn Authority>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let cache = Arc::new(TableCache::open(table_id, store, config.save_debounce)?);
        let edits = Arc::new(Mutex::new(EditSession::new()));
        let engine = Arc::new(SyncEngine::new(
            actor_id,
            authority.clone(),
            cache.clone(),
            connectivity.clone(),
            config.write_spacing,
        ));
        let presence = Arc::new(PresenceTracker::new(
            table_id,
            actor_id,
            username,
            authority.clone(),
            config.liveness_window,
        ));
        let feed = Arc::new(ChangeFeedConsumer::new(actor_id, cache.clone(), edits.clone()));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);

        if connectivity.is_online() {
            match engine.reload().await {
                Ok(cells) => log::info!("Opened table {table_id} with {cells} cells"),
                Err(e) => log::warn!("Initial load of table {table_id} failed, using cache: {e}"),
            }
        } else {
            log::info!("Opened table {table_id} offline");
        }

        let session = Self {
            table_id,
            actor_id,
            cache,
            authority,
            connectivity,
            engine,
            presence,
            feed,
            edits,
            event_tx,
            event_rx: Some(event_rx),
            tasks: std::sync::Mutex::new(Vec::new()),
        };
        session.spawn_tasks(&config);
        Ok(session)
    }

    fn spawn_tasks(&self, config: &SessionConfig) {
        let feed_task = tokio::spawn(feed_loop(
            self.table_id,
            self.authority.clone(),
            self.feed.clone(),
            self.cache.clone(),
            self.connectivity.subscribe(),
            config.reconnect_debounce,
        ));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            self.presence.clone(),
            self.cache.clone(),
            self.connectivity.clone(),
            config.heartbeat_interval,
        ));
        let sync_task = tokio::spawn(sync_loop(
            self.engine.clone(),
            self.cache.clone(),
            self.connectivity.clone(),
            self.connectivity.subscribe(),
            self.event_tx.clone(),
            config.reconnect_debounce,
            config.sync_interval,
        ));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend([feed_task, heartbeat_task, sync_task]);
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.cache.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    // ─── Editing ────────────────────────────────────────────────────

    /// Open an edit on `(row, col)` and return the value being edited.
    pub async fn begin_edit(&self, row: u32, col: u32) -> Result<String, SessionError> {
        self.ensure_open()?;
        let key = CellKey::new(row, col);
        let original = {
            let mut edits = self.edits.lock().await;
            let original = self.cache.view().await.value(row, col).to_string();
            edits.open(key, original.clone())?;
            original
        };
        self.spawn_cursor_broadcast(Some(key)).await;
        Ok(original)
    }

    pub async fn update_draft(&self, value: impl Into<String>) -> Result<(), SessionError> {
        Ok(self.edits.lock().await.update_draft(value)?)
    }

    /// Commit the open edit. Writes only if the value changed.
    pub async fn commit_edit(&self) -> Result<CommitResult, SessionError> {
        let outcome = self.edits.lock().await.begin_commit()?;
        let result = match outcome {
            CommitOutcome::Unchanged(_) => Ok(CommitResult::Unchanged),
            CommitOutcome::Write(intent) => self.write_cell(intent.key, intent.value).await,
        };
        self.edits.lock().await.finish();
        self.spawn_cursor_broadcast(None).await;
        result
    }

    /// Drop the open edit without writing.
    pub async fn cancel_edit(&self) -> Result<CellKey, SessionError> {
        let key = {
            let mut edits = self.edits.lock().await;
            let key = edits.begin_cancel()?;
            edits.finish();
            key
        };
        self.spawn_cursor_broadcast(None).await;
        Ok(key)
    }

    pub async fn edit_state(&self) -> EditState {
        self.edits.lock().await.state().clone()
    }

    /// Write a cell directly, outside an edit session.
    pub async fn set_cell(
        &self,
        row: u32,
        col: u32,
        value: impl Into<String>,
    ) -> Result<CommitResult, SessionError> {
        self.ensure_open()?;
        let value = value.into();
        if self.cache.view().await.value(row, col) == value {
            return Ok(CommitResult::Unchanged);
        }
        self.write_cell(CellKey::new(row, col), value).await
    }

    /// Stage the edit locally, then push it right away when online.
    async fn write_cell(&self, key: CellKey, value: String) -> Result<CommitResult, SessionError> {
        let actor_id = self.actor_id;
        let (previous, change) = self
            .cache
            .mutate(|snapshot| {
                let previous = snapshot.effective(key).map(|c| c.value.clone());
                let change = snapshot.stage_local_edit(key, value, actor_id, now_millis());
                (previous, change)
            })
            .await
            .ok_or(SessionError::Closed)?;

        match self.engine.push(&change, previous).await {
            Some(Ok(stored)) => {
                if self.cache.is_closed() {
                    return Err(SessionError::Closed);
                }
                Ok(CommitResult::Saved(stored))
            }
            outcome => {
                if let Some(Err(e)) = outcome {
                    log::info!("Write of {key} failed, queued for sync: {e}");
                }
                // A pass in flight or the next reconnect picks it up.
                self.emit(SessionEvent::SavedOffline {
                    row: key.row,
                    col: key.col,
                });
                Ok(CommitResult::SavedOffline)
            }
        }
    }

    async fn spawn_cursor_broadcast(&self, cursor: Option<CellKey>) {
        if !self.connectivity.is_online() {
            return;
        }
        let has_pending = self.cache.pending_count().await > 0;
        let presence = self.presence.clone();
        tokio::spawn(async move {
            presence.broadcast_cursor(cursor, has_pending).await;
        });
    }

    // ─── Sync ───────────────────────────────────────────────────────

    /// Run a sync pass now. `None` when offline or a pass is in flight.
    pub async fn sync_now(&self) -> Option<SyncReport> {
        run_pass(&self.engine, &self.cache, &self.event_tx).await
    }

    /// Replace confirmed cells with the authority's current state.
    pub async fn refresh(&self) -> Result<usize, SessionError> {
        self.ensure_open()?;
        let cells = self.engine.reload().await?;
        self.emit(SessionEvent::Reloaded { cells });
        Ok(cells)
    }

    pub fn sync_state(&self) -> SyncState {
        self.engine.state()
    }

    pub async fn pending_count(&self) -> usize {
        self.cache.pending_count().await
    }

    pub async fn view(&self) -> GridView {
        self.cache.view().await
    }

    // ─── Grid dimensions ────────────────────────────────────────────

    pub async fn add_row(&self) -> Result<GridSize, SessionError> {
        self.add_line(Axis::Row).await
    }

    pub async fn add_column(&self) -> Result<GridSize, SessionError> {
        self.add_line(Axis::Column).await
    }

    async fn add_line(&self, axis: Axis) -> Result<GridSize, SessionError> {
        self.cache
            .mutate(|snapshot| snapshot.add_line(axis))
            .await
            .ok_or(SessionError::Closed)
    }

    /// Remove the last row. Returns the removed index, or `None` at one row.
    pub async fn remove_last_row(&self) -> Result<Option<u32>, SessionError> {
        self.remove_last_line(Axis::Row).await
    }

    pub async fn remove_last_column(&self) -> Result<Option<u32>, SessionError> {
        self.remove_last_line(Axis::Column).await
    }

    async fn remove_last_line(&self, axis: Axis) -> Result<Option<u32>, SessionError> {
        let removed = self
            .cache
            .mutate(|snapshot| snapshot.remove_last_line(axis))
            .await
            .ok_or(SessionError::Closed)?;
        if let Some(index) = removed {
            if self.connectivity.is_online() {
                if let Err(e) = self.authority.delete_line(self.table_id, axis, index).await {
                    log::warn!("Deleting {axis:?} {index} at the authority failed: {e}");
                }
            }
        }
        Ok(removed)
    }

    // ─── Presence & history ─────────────────────────────────────────

    /// Collaborators seen within the liveness window, including the local
    /// actor. Falls back to the last known listing when the authority is
    /// unreachable.
    pub async fn active_actors(&self) -> Vec<ActiveActor> {
        if self.connectivity.is_online() {
            match self.presence.list_active().await {
                Ok(active) => return active,
                Err(e) => log::warn!("Listing presence for table {} failed: {e}", self.table_id),
            }
        }
        self.presence.last_known().await
    }

    /// Other actors grouped by the cell they have selected.
    pub async fn editors_by_cell(&self) -> BTreeMap<CellKey, Vec<ActiveActor>> {
        let active = self.active_actors().await;
        let size = self.cache.size().await;
        editors_by_cell(&active, size, Some(self.actor_id))
    }

    /// Authority history of this table, newest first.
    pub async fn history(&self) -> Result<Vec<HistoryRecord>, SessionError> {
        Ok(self.authority.list_history(self.table_id).await?)
    }

    // ─── Teardown ───────────────────────────────────────────────────

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Stop every background task and flush the cache.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.abort_tasks();
        self.cache.close().await?;
        log::info!("Closed table {}", self.table_id);
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        emit(&self.event_tx, event);
    }
}

impl Drop for TableSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

// ───────────────────────────────────────────────────────────────────
// Background tasks
// ───────────────────────────────────────────────────────────────────

fn emit(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = tx.try_send(event) {
        log::trace!("Dropping session event: {e}");
    }
}

async fn run_pass(
    engine: &SyncEngine,
    cache: &TableCache,
    tx: &mpsc::Sender<SessionEvent>,
) -> Option<SyncReport> {
    let report = engine.sync_pending().await?;
    if cache.is_closed() {
        return None;
    }
    if !report.is_empty() {
        emit(
            tx,
            SessionEvent::SyncCompleted {
                synced: report.synced,
                failed: report.failed,
                remaining: report.remaining,
            },
        );
    }
    if report.superseded > 0 {
        emit(
            tx,
            SessionEvent::Superseded {
                count: report.superseded,
            },
        );
    }
    Some(report)
}

/// Keep a change-feed subscription open while online.
async fn feed_loop(
    table_id: TableId,
    authority: Arc<dyn Authority>,
    feed: Arc<ChangeFeedConsumer>,
    cache: Arc<TableCache>,
    mut online: watch::Receiver<bool>,
    retry_delay: Duration,
) {
    loop {
        let up = online.wait_for(|up| *up).await.map(|_| ());
        if up.is_err() || cache.is_closed() {
            return;
        }
        let stream = match authority.subscribe_changes(table_id).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Subscribing to table {table_id} failed: {e}");
                tokio::time::sleep(retry_delay).await;
                continue;
            }
        };
        log::debug!("Change feed for table {table_id} subscribed");
        tokio::select! {
            _ = feed.run(stream) => {
                tokio::time::sleep(retry_delay).await;
            }
            _ = async { online.wait_for(|up| !*up).await.map(|_| ()) } => {
                log::debug!("Change feed for table {table_id} paused while offline");
            }
        }
    }
}

async fn heartbeat_loop(
    presence: Arc<PresenceTracker>,
    cache: Arc<TableCache>,
    connectivity: Arc<ConnectivityMonitor>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !connectivity.is_online() {
            continue;
        }
        let has_pending = cache.pending_count().await > 0;
        if let Err(e) = presence.heartbeat(has_pending).await {
            log::warn!("Presence heartbeat failed: {e}");
        }
    }
}

/// Sync after reconnect (debounced) and periodically while changes remain.
async fn sync_loop(
    engine: Arc<SyncEngine>,
    cache: Arc<TableCache>,
    connectivity: Arc<ConnectivityMonitor>,
    mut online: watch::Receiver<bool>,
    tx: mpsc::Sender<SessionEvent>,
    reconnect_debounce: Duration,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = online.changed() => {
                if changed.is_err() {
                    return;
                }
                let up = *online.borrow_and_update();
                emit(&tx, SessionEvent::Connectivity(up.into()));
                if !up {
                    continue;
                }
                tokio::time::sleep(reconnect_debounce).await;
                if !connectivity.is_online() {
                    continue;
                }
                if cache.pending_count().await > 0 {
                    run_pass(&engine, &cache, &tx).await;
                } else {
                    match engine.reload().await {
                        Ok(cells) => emit(&tx, SessionEvent::Reloaded { cells }),
                        Err(e) => log::warn!("Reload after reconnect failed: {e}"),
                    }
                }
            }
            _ = ticker.tick() => {
                if engine.state() == SyncState::Idle && cache.pending_count().await > 0 {
                    run_pass(&engine, &cache, &tx).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAuthority;
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    async fn open(
        authority: Arc<MemoryAuthority>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> TableSession {
        TableSession::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "ana",
            Arc::new(MemoryStore::new()),
            authority,
            connectivity,
            SessionConfig::for_testing(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_online_commit_is_confirmed() {
        let authority = Arc::new(MemoryAuthority::new());
        let session = open(authority.clone(), Arc::new(ConnectivityMonitor::new(true))).await;

        assert_eq!(session.begin_edit(0, 0).await.unwrap(), "");
        session.update_draft("hello").await.unwrap();
        let result = session.commit_edit().await.unwrap();
        let CommitResult::Saved(stored) = result else {
            panic!("expected a confirmed write, got {result:?}");
        };
        assert_eq!(stored.version, 2);
        assert_eq!(session.pending_count().await, 0);
        assert_eq!(session.view().await.value(0, 0), "hello");
        assert_eq!(session.edit_state().await, EditState::Idle);

        let history = session.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].new_value, "hello");
        session.close().await.unwrap();
    }

    async fn open_spaced(
        authority: Arc<MemoryAuthority>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> TableSession {
        let config = SessionConfig {
            write_spacing: Duration::from_millis(30),
            ..SessionConfig::for_testing()
        };
        TableSession::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "ana",
            Arc::new(MemoryStore::new()),
            authority,
            connectivity,
            config,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_direct_write_and_sync_pass_write_once() {
        let authority = Arc::new(MemoryAuthority::new());
        let session = open_spaced(authority.clone(), Arc::new(ConnectivityMonitor::new(true))).await;
        authority.set_write_delay(Duration::from_millis(50));

        let (written, pass) = tokio::join!(session.set_cell(1, 1, "raced"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.sync_now().await
        });
        assert!(matches!(written.unwrap(), CommitResult::Saved(_)));
        assert_eq!(pass, None);
        assert_eq!(session.pending_count().await, 0);

        // Let any periodic pass run; it must find nothing to write.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(authority.cell_write_count(), 1);
        assert_eq!(session.history().await.unwrap().len(), 1);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_during_pass_is_queued_then_synced_once() {
        let authority = Arc::new(MemoryAuthority::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let session = open_spaced(authority.clone(), connectivity.clone()).await;
        session.set_cell(0, 0, "a").await.unwrap();
        session.set_cell(0, 1, "b").await.unwrap();
        authority.set_write_delay(Duration::from_millis(50));
        connectivity.set_online(true);

        let (_, written) = tokio::join!(session.sync_now(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.set_cell(0, 2, "c").await
        });
        assert_eq!(written.unwrap(), CommitResult::SavedOffline);

        let mut settled = false;
        for _ in 0..100 {
            if session.pending_count().await == 0 {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(settled);
        assert_eq!(authority.cell_write_count(), 3);
        assert_eq!(session.history().await.unwrap().len(), 3);
        assert_eq!(session.view().await.value(0, 2), "c");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_commit_writes_nothing() {
        let authority = Arc::new(MemoryAuthority::new());
        let session = open(authority.clone(), Arc::new(ConnectivityMonitor::new(true))).await;
        session.set_cell(1, 1, "same").await.unwrap();
        let writes = authority.cell_write_count();

        session.begin_edit(1, 1).await.unwrap();
        session.update_draft("same").await.unwrap();
        assert_eq!(session.commit_edit().await.unwrap(), CommitResult::Unchanged);
        assert_eq!(authority.cell_write_count(), writes);
        assert_eq!(session.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_commit_is_queued_and_reported() {
        let authority = Arc::new(MemoryAuthority::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        let mut session = open(authority.clone(), connectivity).await;
        let mut events = session.take_event_rx().unwrap();
        assert!(session.take_event_rx().is_none());

        session.begin_edit(0, 0).await.unwrap();
        session.update_draft("x").await.unwrap();
        assert_eq!(session.commit_edit().await.unwrap(), CommitResult::SavedOffline);
        assert_eq!(events.recv().await, Some(SessionEvent::SavedOffline { row: 0, col: 0 }));

        let view = session.view().await;
        assert_eq!(view.value(0, 0), "x");
        assert!(view.is_pending(0, 0));
        assert_eq!(authority.cell_write_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_leaves_cell_untouched() {
        let authority = Arc::new(MemoryAuthority::new());
        let session = open(authority.clone(), Arc::new(ConnectivityMonitor::new(true))).await;

        session.begin_edit(2, 2).await.unwrap();
        session.update_draft("draft").await.unwrap();
        assert_eq!(session.cancel_edit().await.unwrap(), CellKey::new(2, 2));
        assert_eq!(session.view().await.value(2, 2), "");
        assert_eq!(session.pending_count().await, 0);
        assert!(matches!(
            session.commit_edit().await,
            Err(SessionError::Edit(EditError::NotEditing))
        ));
    }

    #[tokio::test]
    async fn test_resize_evicts_and_stops_at_one() {
        let authority = Arc::new(MemoryAuthority::new());
        let session = open(authority.clone(), Arc::new(ConnectivityMonitor::new(true))).await;

        assert_eq!(session.add_row().await.unwrap(), GridSize::new(11, 10));
        assert_eq!(session.add_column().await.unwrap(), GridSize::new(11, 11));
        session.set_cell(10, 0, "bottom").await.unwrap();

        assert_eq!(session.remove_last_row().await.unwrap(), Some(10));
        assert_eq!(session.view().await.value(10, 0), "");
        assert!(authority
            .get_cell(session.table_id(), 10, 0)
            .await
            .unwrap()
            .is_none());

        for _ in 0..10 {
            session.remove_last_column().await.unwrap();
        }
        assert_eq!(session.remove_last_column().await.unwrap(), None);
        assert_eq!(session.view().await.size, GridSize::new(10, 1));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_work() {
        let authority = Arc::new(MemoryAuthority::new());
        let session = open(authority, Arc::new(ConnectivityMonitor::new(true))).await;
        session.close().await.unwrap();

        assert!(matches!(session.begin_edit(0, 0).await, Err(SessionError::Closed)));
        assert!(matches!(session.set_cell(0, 0, "x").await, Err(SessionError::Closed)));
        assert!(matches!(session.add_row().await, Err(SessionError::Closed)));
    }

    #[test]
    fn test_default_config_timings() {
        let config = SessionConfig::default();
        assert_eq!(config.save_debounce, Duration::from_millis(400));
        assert_eq!(config.reconnect_debounce, Duration::from_secs(1));
        assert_eq!(config.liveness_window, Duration::from_secs(35));
        assert!(config.sync_interval >= Duration::from_secs(3));
        assert!(config.sync_interval <= Duration::from_secs(5));
    }
}
