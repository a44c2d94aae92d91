//! WebSocket client for [`crate::server::AuthorityServer`].
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) mirrored into an optional
//!   [`ConnectivityMonitor`]
//! - Request/reply correlation by frame id
//! - Per-table change-feed fan-out
//! - Fail-fast transport errors while disconnected
//!
//! ```text
//! call(request) ──► pending[id] ──► outgoing ──► writer task ──► ws
//!                        ▲
//! ws ──► reader task ────┤ ServerFrame::Reply { id }   → pending[id]
//!                        └ ServerFrame::Change(event)  → feeds[table]
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::authority::{Authority, AuthorityError, ChangeStream, CellWrite, PresenceUpdate};
use crate::connectivity::ConnectivityMonitor;
use crate::memory::receiver_stream;
use crate::model::{ActiveActor, Axis, Cell, CellMutationEvent, HistoryRecord, TableId};
use crate::protocol::{ClientFrame, ProtocolError, Reply, Request, ServerFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type PendingReply = oneshot::Sender<Result<Reply, AuthorityError>>;

struct Shared {
    state: RwLock<ConnectionState>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    feeds: RwLock<HashMap<TableId, broadcast::Sender<CellMutationEvent>>>,
    connectivity: Option<Arc<ConnectivityMonitor>>,
}

impl Shared {
    /// Drop the connection state; waiting calls fail as unreachable and
    /// change streams end.
    async fn reset(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
        *self.outgoing.write().await = None;
        let failed: Vec<PendingReply> = self.pending.lock().await.drain().map(|(_, tx)| tx).collect();
        for tx in failed {
            let _ = tx.send(Err(AuthorityError::Unreachable("connection closed".into())));
        }
        self.feeds.write().await.clear();
        if let Some(connectivity) = &self.connectivity {
            connectivity.set_online(false);
        }
    }
}

/// [`Authority`] reached over WebSocket.
pub struct RemoteAuthority {
    url: String,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    feed_capacity: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteAuthority {
    /// Create a disconnected client for `url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(url: impl Into<String>) -> Self {
        Self::build(url.into(), None)
    }

    /// Like [`RemoteAuthority::new`], reporting connection changes to
    /// `connectivity`.
    pub fn with_connectivity(url: impl Into<String>, connectivity: Arc<ConnectivityMonitor>) -> Self {
        Self::build(url.into(), Some(connectivity))
    }

    fn build(url: String, connectivity: Option<Arc<ConnectivityMonitor>>) -> Self {
        Self {
            url,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                feeds: RwLock::new(HashMap::new()),
                connectivity,
            }),
            next_id: AtomicU64::new(1),
            feed_capacity: 256,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        if self.connection_state().await == ConnectionState::Connected {
            return Ok(());
        }
        *self.shared.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route replies and pushed changes
        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(ServerFrame::Reply { id, result }) => {
                                if let Some(tx) = shared.pending.lock().await.remove(&id) {
                                    let _ = tx.send(result);
                                }
                            }
                            Ok(ServerFrame::Change(event)) => {
                                if let Some(feed) = shared.feeds.read().await.get(&event.table_id) {
                                    let _ = feed.send(event);
                                }
                            }
                            Err(e) => log::warn!("Dropping malformed server frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Connection to authority lost");
            shared.reset().await;
        });

        *self.shared.outgoing.write().await = Some(out_tx);
        *self.shared.state.write().await = ConnectionState::Connected;
        {
            let mut tasks = self.tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
            tasks.extend([writer, reader]);
        }
        if let Some(connectivity) = &self.shared.connectivity {
            connectivity.set_online(true);
        }
        log::info!("Connected to authority at {}", self.url);
        Ok(())
    }

    /// Close the connection. In-flight calls fail as unreachable.
    pub async fn disconnect(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.shared.reset().await;
        log::info!("Disconnected from authority at {}", self.url);
    }

    async fn call(&self, request: Request) -> Result<Reply, AuthorityError> {
        let outgoing = self
            .shared
            .outgoing
            .read()
            .await
            .clone()
            .ok_or_else(|| AuthorityError::Unreachable("not connected".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let encoded = ClientFrame::new(id, request).encode()?;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        if outgoing.send(encoded).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(ProtocolError::ConnectionClosed.into());
        }
        rx.await
            .map_err(|_| AuthorityError::from(ProtocolError::ConnectionClosed))?
    }
}

fn unexpected(reply: Reply) -> AuthorityError {
    log::warn!("Unexpected reply from authority: {reply:?}");
    ProtocolError::UnexpectedReply.into()
}

#[async_trait]
impl Authority for RemoteAuthority {
    async fn get_cell(&self, table_id: TableId, row: u32, col: u32) -> Result<Option<Cell>, AuthorityError> {
        match self.call(Request::GetCell { table_id, row, col }).await? {
            Reply::Cell(cell) => Ok(cell),
            other => Err(unexpected(other)),
        }
    }

    async fn upsert_cell(&self, table_id: TableId, write: &CellWrite) -> Result<Cell, AuthorityError> {
        let request = Request::UpsertCell {
            table_id,
            write: write.clone(),
        };
        match self.call(request).await? {
            Reply::Stored(cell) => Ok(cell),
            other => Err(unexpected(other)),
        }
    }

    async fn list_cells(&self, table_id: TableId) -> Result<Vec<Cell>, AuthorityError> {
        match self.call(Request::ListCells { table_id }).await? {
            Reply::Cells(cells) => Ok(cells),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_line(&self, table_id: TableId, axis: Axis, index: u32) -> Result<(), AuthorityError> {
        match self.call(Request::DeleteLine { table_id, axis, index }).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe_changes(&self, table_id: TableId) -> Result<ChangeStream, AuthorityError> {
        // Register the local fan-out first so nothing pushed after the
        // server-side subscription is lost.
        let rx = {
            let mut feeds = self.shared.feeds.write().await;
            feeds
                .entry(table_id)
                .or_insert_with(|| broadcast::channel(self.feed_capacity).0)
                .subscribe()
        };
        match self.call(Request::Subscribe { table_id }).await? {
            Reply::Done => Ok(receiver_stream(rx)),
            other => Err(unexpected(other)),
        }
    }

    async fn upsert_presence(&self, table_id: TableId, update: &PresenceUpdate) -> Result<(), AuthorityError> {
        let request = Request::UpsertPresence {
            table_id,
            update: update.clone(),
        };
        match self.call(request).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn list_presence(&self, table_id: TableId) -> Result<Vec<ActiveActor>, AuthorityError> {
        match self.call(Request::ListPresence { table_id }).await? {
            Reply::Presence(actors) => Ok(actors),
            other => Err(unexpected(other)),
        }
    }

    async fn append_history(&self, table_id: TableId, record: &HistoryRecord) -> Result<(), AuthorityError> {
        let request = Request::AppendHistory {
            table_id,
            record: record.clone(),
        };
        match self.call(request).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn list_history(&self, table_id: TableId) -> Result<Vec<HistoryRecord>, AuthorityError> {
        match self.call(Request::ListHistory { table_id }).await? {
            Reply::History(history) => Ok(history),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = RemoteAuthority::new("ws://127.0.0.1:9");
        assert_eq!(client.url(), "ws://127.0.0.1:9");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_calls_fail_fast_when_disconnected() {
        let client = RemoteAuthority::new("ws://127.0.0.1:9");
        let err = client.list_cells(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_transport());
        assert!(client.subscribe_changes(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_disconnected() {
        let connectivity = Arc::new(ConnectivityMonitor::new(false));
        // Port 9 (discard) is not a WebSocket server.
        let client = RemoteAuthority::with_connectivity("ws://127.0.0.1:9", connectivity.clone());
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!connectivity.is_online());
    }
}
