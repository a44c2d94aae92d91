//! Wire protocol between [`crate::client::RemoteAuthority`] and
//! [`crate::server::AuthorityServer`].
//!
//! ## Frame Format
//!
//! Every WebSocket binary message carries one bincode-encoded frame
//! (standard config, serde mode).
//!
//! ```text
//! client ──► ClientFrame { id, request }
//! server ──► ServerFrame::Reply { id, result }     (one per request, same id)
//! server ──► ServerFrame::Change(event)            (pushed after Subscribe)
//! ```
//!
//! Replies may arrive out of order; the client correlates them by `id`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::authority::{AuthorityError, CellWrite, PresenceUpdate};
use crate::model::{ActiveActor, Axis, Cell, CellMutationEvent, HistoryRecord, TableId};

/// One call on the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    GetCell { table_id: TableId, row: u32, col: u32 },
    UpsertCell { table_id: TableId, write: CellWrite },
    ListCells { table_id: TableId },
    DeleteLine { table_id: TableId, axis: Axis, index: u32 },
    /// Start pushing [`ServerFrame::Change`] for this table.
    Subscribe { table_id: TableId },
    Unsubscribe { table_id: TableId },
    UpsertPresence { table_id: TableId, update: PresenceUpdate },
    ListPresence { table_id: TableId },
    AppendHistory { table_id: TableId, record: HistoryRecord },
    ListHistory { table_id: TableId },
    Ping,
}

impl Request {
    pub fn table_id(&self) -> Option<TableId> {
        match self {
            Request::GetCell { table_id, .. }
            | Request::UpsertCell { table_id, .. }
            | Request::ListCells { table_id }
            | Request::DeleteLine { table_id, .. }
            | Request::Subscribe { table_id }
            | Request::Unsubscribe { table_id }
            | Request::UpsertPresence { table_id, .. }
            | Request::ListPresence { table_id }
            | Request::AppendHistory { table_id, .. }
            | Request::ListHistory { table_id } => Some(*table_id),
            Request::Ping => None,
        }
    }
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Cell(Option<Cell>),
    Stored(Cell),
    Cells(Vec<Cell>),
    Presence(Vec<ActiveActor>),
    History(Vec<HistoryRecord>),
    Done,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Reply {
        id: u64,
        result: Result<Reply, AuthorityError>,
    },
    Change(CellMutationEvent),
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(frame)
}

impl ClientFrame {
    pub fn new(id: u64, request: Request) -> Self {
        Self { id, request }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// The reply did not match the request.
    UnexpectedReply,
    ConnectionClosed,
    ConnectionFailed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedReply => write!(f, "Unexpected reply"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for AuthorityError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed | ProtocolError::ConnectionFailed(_) => {
                AuthorityError::Unreachable(e.to_string())
            }
            other => AuthorityError::Protocol(other.to_string()),
        }
    }
}
