//! # gridsync-collab - Offline-first grid sync and conflict resolution
//!
//! Many actors edit one shared grid of cells. Edits apply locally right
//! away, queue while the authority is unreachable, and reconcile on
//! reconnect with whole-cell last-writer-wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────── TableSession (per actor, per table) ─────────────────┐
//! │                                                                      │
//! │  EditSession ──► TableCache ◄── ChangeFeedConsumer ◄── feed ─────┐   │
//! │                  (snapshot)                                      │   │
//! │                      │   ▲                                       │   │
//! │                      ▼   │                                       │   │
//! │                  SyncEngine ── resolve() ──► Authority ──────────┤   │
//! │                                                                  │   │
//! │  PresenceTracker ── heartbeat / cursor ──────► Authority ────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//!   SnapshotStore (RocksDB)          MemoryAuthority | RemoteAuthority ──ws──► AuthorityServer
//! ```
//!
//! ## Modules
//!
//! - [`model`] - Cells, pending changes, grid dimensions, presence, history
//! - [`storage`] - Durable snapshot cache (RocksDB + LZ4) and debounced writer
//! - [`cache`] - In-memory table snapshot, the single writer path
//! - [`connectivity`] - Online/offline state
//! - [`resolver`] - Last-writer-wins conflict resolution
//! - [`sync`] - Pending queue drain against the authority
//! - [`feed`] - Remote change merge with edit suppression
//! - [`presence`] - Heartbeats, cursors, liveness
//! - [`edit`] - Cell edit state machine
//! - [`session`] - Everything above wired for one actor and one table
//! - [`authority`] - The authority trait; [`memory`], [`client`] and
//!   [`server`] implement and serve it over [`protocol`] and [`broadcast`]

pub mod authority;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod connectivity;
pub mod edit;
pub mod feed;
pub mod memory;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;

// Re-exports for convenience
pub use authority::{Authority, AuthorityError, CellWrite, ChangeStream, PresenceUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use cache::TableCache;
pub use client::{ConnectionState, RemoteAuthority};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use edit::{CommitIntent, CommitOutcome, EditError, EditSession, EditState};
pub use feed::{ChangeFeedConsumer, FeedOutcome, FeedStats};
pub use memory::MemoryAuthority;
pub use model::{
    now_millis, ActiveActor, ActorId, Axis, Cell, CellKey, CellMutationEvent, GridSize, GridView,
    HistoryRecord, PendingChange, TableId, TableSnapshot,
};
pub use presence::{editors_by_cell, filter_active, PresenceTracker, LIVENESS_WINDOW};
pub use protocol::{ClientFrame, ProtocolError, Reply, Request, ServerFrame};
pub use resolver::{resolve, Resolution};
pub use server::{AuthorityServer, ServerConfig, ServerStats};
pub use session::{CommitResult, SessionConfig, SessionError, SessionEvent, TableSession};
pub use storage::{
    MemoryStore, SnapshotMetadata, SnapshotStore, SnapshotWriter, StoreConfig, StoreError,
    TableStore, WriterStats,
};
pub use sync::{SyncEngine, SyncReport, SyncState};
