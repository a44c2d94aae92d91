//! The authority: the remote system holding canonical cells, presence rows
//! and history for every table.
//!
//! The core only talks to it through [`Authority`]. Two implementations
//! ship with the crate:
//! - [`crate::memory::MemoryAuthority`] - in-process, used by tests and by
//!   the WebSocket server as its backing store
//! - [`crate::client::RemoteAuthority`] - WebSocket client for
//!   [`crate::server::AuthorityServer`]

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::model::{
    ActiveActor, ActorId, Axis, Cell, CellKey, CellMutationEvent, HistoryRecord, TableId,
};

/// Push feed of remote mutations for one table: at-least-once, unordered.
pub type ChangeStream = BoxStream<'static, CellMutationEvent>;

/// Authority-side failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorityError {
    /// The authority could not be reached (transport failure).
    Unreachable(String),
    /// An insert hit an existing `(table, row, col)` record.
    DuplicateKey { row: u32, col: u32 },
    /// The authority refused the request.
    Rejected(String),
    /// Malformed or unexpected response.
    Protocol(String),
}

impl AuthorityError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, AuthorityError::DuplicateKey { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, AuthorityError::Unreachable(_))
    }
}

impl std::fmt::Display for AuthorityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityError::Unreachable(e) => write!(f, "Authority unreachable: {e}"),
            AuthorityError::DuplicateKey { row, col } => {
                write!(f, "Duplicate key for cell {row}-{col}")
            }
            AuthorityError::Rejected(e) => write!(f, "Authority rejected request: {e}"),
            AuthorityError::Protocol(e) => write!(f, "Authority protocol error: {e}"),
        }
    }
}

impl std::error::Error for AuthorityError {}

/// Parameters of a cell write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellWrite {
    pub row: u32,
    pub col: u32,
    pub value: String,
    pub actor_id: ActorId,
    pub version: u64,
    pub timestamp: u64,
    /// Insert only: fail with [`AuthorityError::DuplicateKey`] if the cell
    /// already exists.
    pub insert_only: bool,
}

impl CellWrite {
    /// Build a write from a pending change.
    pub fn from_change(change: &Cell, actor_id: ActorId, version: u64, insert_only: bool) -> Self {
        Self {
            row: change.row,
            col: change.col,
            value: change.value.clone(),
            actor_id,
            version,
            timestamp: change.last_modified_at,
            insert_only,
        }
    }

    pub fn key(&self) -> CellKey {
        CellKey::new(self.row, self.col)
    }
}

/// Parameters of a presence upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub actor_id: ActorId,
    pub username: String,
    pub last_seen_at: u64,
    pub cursor: Option<CellKey>,
    pub has_pending_changes: bool,
}

impl From<PresenceUpdate> for ActiveActor {
    fn from(update: PresenceUpdate) -> Self {
        ActiveActor {
            actor_id: update.actor_id,
            username: update.username,
            last_seen_at: update.last_seen_at,
            selected_cell: update.cursor,
            has_pending_changes: update.has_pending_changes,
        }
    }
}

/// Capabilities the core needs from the authority.
#[async_trait]
pub trait Authority: Send + Sync {
    async fn get_cell(&self, table_id: TableId, row: u32, col: u32)
        -> Result<Option<Cell>, AuthorityError>;

    /// Insert or update a cell; returns the stored record.
    ///
    /// The stored version is never lower than what the authority held
    /// before plus one.
    async fn upsert_cell(&self, table_id: TableId, write: &CellWrite) -> Result<Cell, AuthorityError>;

    async fn list_cells(&self, table_id: TableId) -> Result<Vec<Cell>, AuthorityError>;

    /// Delete every cell on one row or column.
    async fn delete_line(&self, table_id: TableId, axis: Axis, index: u32)
        -> Result<(), AuthorityError>;

    async fn subscribe_changes(&self, table_id: TableId) -> Result<ChangeStream, AuthorityError>;

    async fn upsert_presence(&self, table_id: TableId, update: &PresenceUpdate)
        -> Result<(), AuthorityError>;

    async fn list_presence(&self, table_id: TableId) -> Result<Vec<ActiveActor>, AuthorityError>;

    async fn append_history(&self, table_id: TableId, record: &HistoryRecord)
        -> Result<(), AuthorityError>;

    /// History of a table, newest first.
    async fn list_history(&self, table_id: TableId) -> Result<Vec<HistoryRecord>, AuthorityError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_classification() {
        assert!(AuthorityError::DuplicateKey { row: 1, col: 2 }.is_duplicate_key());
        assert!(AuthorityError::Unreachable("down".into()).is_transport());
        assert!(!AuthorityError::Rejected("no".into()).is_transport());
    }

    #[test]
    fn test_error_display() {
        let err = AuthorityError::DuplicateKey { row: 1, col: 2 };
        assert_eq!(err.to_string(), "Duplicate key for cell 1-2");
    }

    #[test]
    fn test_write_from_change() {
        let actor = Uuid::new_v4();
        let change = Cell::new(CellKey::new(3, 4), "v", 2, Some(actor), 77);
        let write = CellWrite::from_change(&change, actor, 9, true);
        assert_eq!(write.key(), CellKey::new(3, 4));
        assert_eq!(write.version, 9);
        assert_eq!(write.timestamp, 77);
        assert!(write.insert_only);
    }
}
