//! WebSocket authority server.
//!
//! Architecture:
//! ```text
//! RemoteAuthority A ──┐                       ┌── cells / presence / history
//!                     ├── AuthorityServer ────┤        (MemoryAuthority)
//! RemoteAuthority B ──┘        │              └── RoomManager (per-table feed)
//!                              │                         │
//!                              ◄──── ServerFrame::Change ┘ (subscribed tables)
//! ```
//!
//! Each connection handles its requests in order and keeps one forwarding
//! task per subscribed table. Forwarders are aborted when the connection
//! goes away.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::authority::{Authority, AuthorityError};
use crate::memory::MemoryAuthority;
use crate::model::TableId;
use crate::protocol::{ClientFrame, Reply, Request, ServerFrame};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Change-feed buffer per subscriber
    pub broadcast_capacity: usize,
    /// Outgoing frame queue per connection
    pub outgoing_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            outgoing_capacity: 256,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port on localhost.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub changes_pushed: u64,
}

/// Serves a [`MemoryAuthority`] over WebSocket.
pub struct AuthorityServer {
    config: ServerConfig,
    authority: Arc<MemoryAuthority>,
    stats: Arc<RwLock<ServerStats>>,
}

impl AuthorityServer {
    pub fn new(config: ServerConfig) -> Self {
        let authority = Arc::new(MemoryAuthority::with_capacity(config.broadcast_capacity));
        Self::with_authority(config, authority)
    }

    /// Serve an existing authority, e.g. one a test also drives directly.
    pub fn with_authority(config: ServerConfig, authority: Arc<MemoryAuthority>) -> Self {
        Self {
            config,
            authority,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn authority(&self) -> &Arc<MemoryAuthority> {
        &self.authority
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Authority server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let authority = self.authority.clone();
            let stats = self.stats.clone();
            let outgoing_capacity = self.config.outgoing_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, authority, stats, outgoing_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        authority: Arc<MemoryAuthority>,
        stats: Arc<RwLock<ServerStats>>,
        outgoing_capacity: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Writer task: replies and pushed changes share one outgoing queue.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(outgoing_capacity);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut subscriptions: HashMap<TableId, JoinHandle<()>> = HashMap::new();

        while let Some(msg) = ws_receiver.next().await {
            let bytes: Vec<u8> = match msg {
                Ok(Message::Binary(data)) => data.into(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("WebSocket error from {addr}: {e}");
                    break;
                }
            };

            let frame = match ClientFrame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Dropping malformed frame from {addr}: {e}");
                    continue;
                }
            };
            {
                let mut s = stats.write().await;
                s.total_requests += 1;
                s.total_bytes += bytes.len() as u64;
            }

            let result = match frame.request {
                Request::Subscribe { table_id } => {
                    Self::subscribe(&authority, table_id, &out_tx, &stats, &mut subscriptions).await
                }
                Request::Unsubscribe { table_id } => {
                    if let Some(task) = subscriptions.remove(&table_id) {
                        task.abort();
                    }
                    Ok(Reply::Done)
                }
                request => dispatch(authority.as_ref(), request).await,
            };

            let reply = ServerFrame::Reply {
                id: frame.id,
                result,
            };
            match reply.encode() {
                Ok(encoded) => {
                    if out_tx.send(encoded).await.is_err() {
                        break;
                    }
                }
                Err(e) => log::error!("Failed to encode reply for {addr}: {e}"),
            }
        }

        for (_, task) in subscriptions.drain() {
            task.abort();
        }
        drop(out_tx);
        let _ = writer.await;

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::info!("Connection from {addr} closed");
        Ok(())
    }

    async fn subscribe(
        authority: &MemoryAuthority,
        table_id: TableId,
        out_tx: &mpsc::Sender<Vec<u8>>,
        stats: &Arc<RwLock<ServerStats>>,
        subscriptions: &mut HashMap<TableId, JoinHandle<()>>,
    ) -> Result<Reply, AuthorityError> {
        if subscriptions.contains_key(&table_id) {
            return Ok(Reply::Done);
        }
        let mut changes = authority.subscribe_changes(table_id).await?;
        let out_tx = out_tx.clone();
        let stats = stats.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = changes.next().await {
                let encoded = match ServerFrame::Change(event).encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode change: {e}");
                        continue;
                    }
                };
                if out_tx.send(encoded).await.is_err() {
                    break;
                }
                stats.write().await.changes_pushed += 1;
            }
        });
        subscriptions.insert(table_id, task);
        Ok(Reply::Done)
    }
}

/// Execute one request against an authority.
pub async fn dispatch(authority: &dyn Authority, request: Request) -> Result<Reply, AuthorityError> {
    match request {
        Request::GetCell { table_id, row, col } => {
            authority.get_cell(table_id, row, col).await.map(Reply::Cell)
        }
        Request::UpsertCell { table_id, write } => {
            authority.upsert_cell(table_id, &write).await.map(Reply::Stored)
        }
        Request::ListCells { table_id } => authority.list_cells(table_id).await.map(Reply::Cells),
        Request::DeleteLine {
            table_id,
            axis,
            index,
        } => authority
            .delete_line(table_id, axis, index)
            .await
            .map(|_| Reply::Done),
        Request::UpsertPresence { table_id, update } => authority
            .upsert_presence(table_id, &update)
            .await
            .map(|_| Reply::Done),
        Request::ListPresence { table_id } => {
            authority.list_presence(table_id).await.map(Reply::Presence)
        }
        Request::AppendHistory { table_id, record } => authority
            .append_history(table_id, &record)
            .await
            .map(|_| Reply::Done),
        Request::ListHistory { table_id } => {
            authority.list_history(table_id).await.map(Reply::History)
        }
        Request::Subscribe { .. } | Request::Unsubscribe { .. } => Err(AuthorityError::Rejected(
            "subscriptions are connection-scoped".into(),
        )),
        Request::Ping => Ok(Reply::Pong),
    }
}
