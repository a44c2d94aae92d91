//! Presence: who else is on this table, and which cell they are in.
//!
//! ```text
//! heartbeat (every ~10s) ──► upsert_presence(last_seen_at, cursor, has_pending)
//! edit open / close     ──► upsert_presence(cursor = cell / None)
//!
//! list_presence ──► filter_active (35s window) ──► editors_by_cell
//! ```
//!
//! Presence rows are never deleted; actors age out of the liveness window.
//! Every call here is best-effort: a failure never blocks an edit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use crate::authority::{Authority, AuthorityError, PresenceUpdate};
use crate::model::{now_millis, ActiveActor, ActorId, CellKey, GridSize, TableId};

/// Default liveness window.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(35);

/// Presence rows seen within `window` of `now`, most recently seen first.
pub fn filter_active(actors: Vec<ActiveActor>, now: u64, window: Duration) -> Vec<ActiveActor> {
    let mut live: Vec<ActiveActor> = actors
        .into_iter()
        .filter(|a| a.is_live(now, window))
        .collect();
    live.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
    live
}

/// Group actors by the cell they have selected.
///
/// Cursors outside the grid and the `exclude`d actor (usually the local one)
/// are left out.
pub fn editors_by_cell(
    actors: &[ActiveActor],
    size: GridSize,
    exclude: Option<ActorId>,
) -> BTreeMap<CellKey, Vec<ActiveActor>> {
    let mut by_cell: BTreeMap<CellKey, Vec<ActiveActor>> = BTreeMap::new();
    for actor in actors {
        if Some(actor.actor_id) == exclude {
            continue;
        }
        if let Some(cell) = actor.selected_cell {
            if size.contains(cell) {
                by_cell.entry(cell).or_default().push(actor.clone());
            }
        }
    }
    by_cell
}

/// Presence of the local actor on one table, plus the last known view of
/// everyone else.
pub struct PresenceTracker {
    table_id: TableId,
    actor_id: ActorId,
    username: String,
    authority: Arc<dyn Authority>,
    liveness: Duration,
    cursor: Mutex<Option<CellKey>>,
    peers: RwLock<HashMap<ActorId, ActiveActor>>,
}

impl PresenceTracker {
    pub fn new(
        table_id: TableId,
        actor_id: ActorId,
        username: impl Into<String>,
        authority: Arc<dyn Authority>,
        liveness: Duration,
    ) -> Self {
        Self {
            table_id,
            actor_id,
            username: username.into(),
            authority,
            liveness,
            cursor: Mutex::new(None),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor_id
    }

    pub async fn cursor(&self) -> Option<CellKey> {
        *self.cursor.lock().await
    }

    /// Refresh `last_seen_at` for the local actor.
    pub async fn heartbeat(&self, has_pending_changes: bool) -> Result<(), AuthorityError> {
        let cursor = *self.cursor.lock().await;
        self.publish(cursor, has_pending_changes).await
    }

    /// Announce the selected cell (`None` when the edit closes).
    ///
    /// Returns whether the authority accepted it; failures are only logged.
    pub async fn broadcast_cursor(&self, cursor: Option<CellKey>, has_pending_changes: bool) -> bool {
        *self.cursor.lock().await = cursor;
        match self.publish(cursor, has_pending_changes).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Cursor broadcast for table {} failed: {e}", self.table_id);
                false
            }
        }
    }

    async fn publish(&self, cursor: Option<CellKey>, has_pending_changes: bool) -> Result<(), AuthorityError> {
        let update = PresenceUpdate {
            actor_id: self.actor_id,
            username: self.username.clone(),
            last_seen_at: now_millis(),
            cursor,
            has_pending_changes,
        };
        self.authority.upsert_presence(self.table_id, &update).await
    }

    /// Fetch presence rows from the authority and keep the live ones.
    pub async fn list_active(&self) -> Result<Vec<ActiveActor>, AuthorityError> {
        let rows = self.authority.list_presence(self.table_id).await?;
        let active = filter_active(rows, now_millis(), self.liveness);
        let mut peers = self.peers.write().await;
        peers.clear();
        peers.extend(active.iter().map(|a| (a.actor_id, a.clone())));
        Ok(active)
    }

    /// Last fetched rows that are still inside the liveness window.
    pub async fn last_known(&self) -> Vec<ActiveActor> {
        let peers = self.peers.read().await;
        filter_active(peers.values().cloned().collect(), now_millis(), self.liveness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAuthority;
    use uuid::Uuid;

    fn actor(name: &str, last_seen_at: u64, cell: Option<CellKey>) -> ActiveActor {
        ActiveActor {
            actor_id: Uuid::new_v4(),
            username: name.into(),
            last_seen_at,
            selected_cell: cell,
            has_pending_changes: false,
        }
    }

    #[test]
    fn test_filter_active_window() {
        let now = 100_000;
        let actors = vec![
            actor("fresh", now - 30_000, None),
            actor("stale", now - 40_000, None),
            actor("freshest", now - 1_000, None),
        ];
        let active = filter_active(actors, now, LIVENESS_WINDOW);
        let names: Vec<&str> = active.iter().map(|a| a.username.as_str()).collect();
        assert_eq!(names, vec!["freshest", "fresh"]);
    }

    #[test]
    fn test_editors_by_cell() {
        let a = actor("a", 0, Some(CellKey::new(1, 1)));
        let b = actor("b", 0, Some(CellKey::new(1, 1)));
        let me = actor("me", 0, Some(CellKey::new(1, 1)));
        let outside = actor("out", 0, Some(CellKey::new(50, 0)));
        let idle = actor("idle", 0, None);
        let actors = vec![a, b, me.clone(), outside, idle];

        let map = editors_by_cell(&actors, GridSize::new(10, 10), Some(me.actor_id));
        assert_eq!(map.len(), 1);
        assert_eq!(map[&CellKey::new(1, 1)].len(), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_and_cursor_are_visible_to_others() {
        let authority = Arc::new(MemoryAuthority::new());
        let table = Uuid::new_v4();
        let ana = PresenceTracker::new(table, Uuid::new_v4(), "ana", authority.clone(), LIVENESS_WINDOW);
        let bo = PresenceTracker::new(table, Uuid::new_v4(), "bo", authority.clone(), LIVENESS_WINDOW);

        ana.heartbeat(true).await.unwrap();
        assert!(ana.broadcast_cursor(Some(CellKey::new(2, 3)), true).await);

        let active = bo.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].username, "ana");
        assert_eq!(active[0].selected_cell, Some(CellKey::new(2, 3)));
        assert!(active[0].has_pending_changes);
        assert_eq!(bo.last_known().await.len(), 1);

        assert!(ana.broadcast_cursor(None, false).await);
        let active = bo.list_active().await.unwrap();
        assert_eq!(active[0].selected_cell, None);
    }

    #[tokio::test]
    async fn test_cursor_broadcast_failure_is_swallowed() {
        let authority = Arc::new(MemoryAuthority::new());
        authority.set_reachable(false);
        let tracker =
            PresenceTracker::new(Uuid::new_v4(), Uuid::new_v4(), "ana", authority, LIVENESS_WINDOW);

        assert!(!tracker.broadcast_cursor(Some(CellKey::new(0, 0)), false).await);
        // The local cursor still moved.
        assert_eq!(tracker.cursor().await, Some(CellKey::new(0, 0)));
        assert!(tracker.heartbeat(false).await.is_err());
    }
}
