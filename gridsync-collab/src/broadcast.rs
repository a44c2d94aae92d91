//! Per-table fan-out of cell mutation events.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber gets an independent receiver buffering up to `capacity`
//! events; a lagging subscriber loses the oldest events, which the
//! at-least-once feed contract (plus post-sync reload) tolerates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::model::{CellMutationEvent, TableId};

/// Statistics for monitoring feed health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub events_undelivered: u64,
    pub subscribers: usize,
}

/// A broadcast group for a single table.
pub struct BroadcastGroup {
    sender: broadcast::Sender<CellMutationEvent>,
    capacity: usize,
    events_sent: AtomicU64,
    events_undelivered: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            events_sent: AtomicU64::new(0),
            events_undelivered: AtomicU64::new(0),
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Returns the number of receivers reached. Having none is not an error.
    pub fn publish(&self, event: CellMutationEvent) -> usize {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                self.events_undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CellMutationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_undelivered: self.events_undelivered.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// Maps table ids to broadcast groups so feeds stay isolated per table.
pub struct RoomManager {
    rooms: RwLock<HashMap<TableId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, table_id: TableId) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(&table_id) {
                return group.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(table_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// Publish to a table's group if anyone ever subscribed to it.
    pub async fn publish(&self, event: CellMutationEvent) -> usize {
        let group = self.rooms.read().await.get(&event.table_id).cloned();
        match group {
            Some(group) => group.publish(event),
            None => 0,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
