//! Change feed consumer.
//!
//! Merges pushed remote mutations into the cache's confirmed cells. There is
//! no conflict adjudication here: the authority already decided. Events are
//! dropped when they are
//! - an echo of the local actor's own write
//! - for a cell the local actor is editing right now
//!
//! Anything else overwrites the confirmed record, even at a lower version:
//! the authority restarts versions after deleting a line. A duplicate or
//! reordered delivery is a transient stale read that the next event or
//! reload corrects.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::authority::ChangeStream;
use crate::cache::TableCache;
use crate::edit::EditSession;
use crate::model::{ActorId, CellMutationEvent};

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    Applied,
    Echo,
    /// The cell is under an open local edit.
    Suppressed,
    /// Event for another table.
    Foreign,
    /// The cache is closed.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub applied: u64,
    pub ignored: u64,
}

pub struct ChangeFeedConsumer {
    local_actor: ActorId,
    cache: Arc<TableCache>,
    edits: Arc<Mutex<EditSession>>,
    applied: AtomicU64,
    ignored: AtomicU64,
}

impl ChangeFeedConsumer {
    pub fn new(local_actor: ActorId, cache: Arc<TableCache>, edits: Arc<Mutex<EditSession>>) -> Self {
        Self {
            local_actor,
            cache,
            edits,
            applied: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
        }
    }

    pub async fn handle(&self, event: &CellMutationEvent) -> FeedOutcome {
        let outcome = self.classify_and_apply(event).await;
        match outcome {
            FeedOutcome::Applied => {
                self.applied.fetch_add(1, Ordering::Relaxed);
                log::trace!("Applied remote change {} v{}", event.key(), event.version);
            }
            other => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                log::trace!("Ignored remote change {} ({other:?})", event.key());
            }
        }
        outcome
    }

    async fn classify_and_apply(&self, event: &CellMutationEvent) -> FeedOutcome {
        if event.table_id != self.cache.table_id() {
            return FeedOutcome::Foreign;
        }
        if event.last_modified_by == Some(self.local_actor) {
            return FeedOutcome::Echo;
        }

        // Held across the cache write so an edit cannot open in between.
        let edits = self.edits.lock().await;
        if edits.is_editing(event.key()) {
            return FeedOutcome::Suppressed;
        }
        let applied = self
            .cache
            .mutate(|snapshot| snapshot.overwrite_confirmed(event.to_cell()))
            .await;
        drop(edits);

        match applied {
            Some(()) => FeedOutcome::Applied,
            None => FeedOutcome::Discarded,
        }
    }

    /// Consume `stream` until it ends or the cache closes.
    pub async fn run(&self, mut stream: ChangeStream) {
        while let Some(event) = stream.next().await {
            if self.handle(&event).await == FeedOutcome::Discarded {
                break;
            }
        }
        log::debug!("Change feed for table {} ended", self.cache.table_id());
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            applied: self.applied.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cell, CellKey, GridSize, TableId};
    use crate::storage::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        table: TableId,
        me: ActorId,
        cache: Arc<TableCache>,
        edits: Arc<Mutex<EditSession>>,
        consumer: ChangeFeedConsumer,
    }

    fn fixture() -> Fixture {
        let table = Uuid::new_v4();
        let me = Uuid::new_v4();
        let cache = Arc::new(
            TableCache::open(table, Arc::new(MemoryStore::new()), Duration::from_millis(10)).unwrap(),
        );
        let edits = Arc::new(Mutex::new(EditSession::new()));
        let consumer = ChangeFeedConsumer::new(me, cache.clone(), edits.clone());
        Fixture {
            table,
            me,
            cache,
            edits,
            consumer,
        }
    }

    fn event(table: TableId, key: CellKey, value: &str, version: u64, by: ActorId) -> CellMutationEvent {
        CellMutationEvent::from_cell(table, &Cell::new(key, value, version, Some(by), version * 10))
    }

    #[tokio::test]
    async fn test_remote_change_applied_and_grows_grid() {
        let f = fixture();
        let other = Uuid::new_v4();
        let outcome = f
            .consumer
            .handle(&event(f.table, CellKey::new(12, 1), "hi", 2, other))
            .await;
        assert_eq!(outcome, FeedOutcome::Applied);
        assert_eq!(f.cache.view().await.value(12, 1), "hi");
        assert_eq!(f.cache.size().await, GridSize::new(13, 10));
    }

    #[tokio::test]
    async fn test_echo_is_ignored() {
        let f = fixture();
        let outcome = f
            .consumer
            .handle(&event(f.table, CellKey::new(0, 0), "mine", 2, f.me))
            .await;
        assert_eq!(outcome, FeedOutcome::Echo);
        assert!(f.cache.confirmed(CellKey::new(0, 0)).await.is_none());
    }

    #[tokio::test]
    async fn test_cell_under_edit_is_left_alone() {
        let f = fixture();
        let key = CellKey::new(1, 1);
        f.edits.lock().await.open(key, "").unwrap();

        let outcome = f
            .consumer
            .handle(&event(f.table, key, "remote", 2, Uuid::new_v4()))
            .await;
        assert_eq!(outcome, FeedOutcome::Suppressed);
        assert!(f.cache.confirmed(key).await.is_none());

        // Other cells still flow.
        let outcome = f
            .consumer
            .handle(&event(f.table, CellKey::new(1, 2), "remote", 2, Uuid::new_v4()))
            .await;
        assert_eq!(outcome, FeedOutcome::Applied);
    }

    #[tokio::test]
    async fn test_reordered_delivery_is_corrected_by_next_event() {
        let f = fixture();
        let other = Uuid::new_v4();
        let key = CellKey::new(0, 0);

        let newer = event(f.table, key, "three", 3, other);
        let older = event(f.table, key, "two", 2, other);
        assert_eq!(f.consumer.handle(&newer).await, FeedOutcome::Applied);
        assert_eq!(f.consumer.handle(&older).await, FeedOutcome::Applied);
        assert_eq!(f.cache.confirmed(key).await.unwrap().value, "two");
        assert_eq!(f.consumer.handle(&newer).await, FeedOutcome::Applied);

        assert_eq!(f.cache.confirmed(key).await.unwrap().value, "three");
        assert_eq!(f.consumer.stats(), FeedStats { applied: 3, ignored: 0 });
    }

    #[tokio::test]
    async fn test_recreated_cell_replaces_higher_version() {
        let f = fixture();
        let other = Uuid::new_v4();
        let key = CellKey::new(9, 0);

        f.consumer.handle(&event(f.table, key, "4", 5, other)).await;
        // The authority deleted the row; the cell starts over at version 2.
        let outcome = f.consumer.handle(&event(f.table, key, "new", 2, other)).await;
        assert_eq!(outcome, FeedOutcome::Applied);
        assert_eq!(f.cache.confirmed(key).await.unwrap().value, "new");
    }

    #[tokio::test]
    async fn test_foreign_table_and_closed_cache() {
        let f = fixture();
        let other = Uuid::new_v4();
        let outcome = f
            .consumer
            .handle(&event(Uuid::new_v4(), CellKey::new(0, 0), "x", 2, other))
            .await;
        assert_eq!(outcome, FeedOutcome::Foreign);

        f.cache.close().await.unwrap();
        let outcome = f
            .consumer
            .handle(&event(f.table, CellKey::new(0, 0), "x", 2, other))
            .await;
        assert_eq!(outcome, FeedOutcome::Discarded);
    }

    #[tokio::test]
    async fn test_run_drains_stream() {
        let f = fixture();
        let other = Uuid::new_v4();
        let events = vec![
            event(f.table, CellKey::new(0, 0), "a", 2, other),
            event(f.table, CellKey::new(0, 1), "b", 2, other),
        ];
        f.consumer.run(futures_util::stream::iter(events).boxed()).await;
        let view = f.cache.view().await;
        assert_eq!(view.value(0, 0), "a");
        assert_eq!(view.value(0, 1), "b");
    }
}
