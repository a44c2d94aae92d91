//! Local durable cache storage.
//!
//! ```text
//! TableCache ── schedule(snapshot) ──► SnapshotWriter ── save ──► SnapshotStore
//!  (in-memory)    coalesced per ~400ms     (tokio task)            ├── TableStore  (RocksDB)
//!                 flushed on teardown                              └── MemoryStore (tests)
//! ```
//!
//! One record per table, addressed by a table-scoped key (`grid:<table-id>`).

pub mod rocks;
pub mod writer;

pub use rocks::{SnapshotMetadata, StoreConfig, TableStore};
pub use writer::{SnapshotWriter, WriterStats};

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::{TableId, TableSnapshot};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// No record under this key
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// The writer task is gone
    WriterClosed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(key) => write!(f, "Table not found: {key}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::WriterClosed => write!(f, "Snapshot writer closed"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Key-value persistence of full table snapshots.
///
/// Both operations are total with respect to the network: they never touch
/// the authority.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, table_key: &str) -> Result<Option<TableSnapshot>, StoreError>;
    fn save(&self, table_key: &str, snapshot: &TableSnapshot) -> Result<(), StoreError>;
}

/// Table-scoped storage key.
pub fn table_key(table_id: TableId) -> String {
    format!("grid:{table_id}")
}

/// bincode + LZ4. Returns the compressed bytes and the uncompressed length.
pub fn encode_snapshot(snapshot: &TableSnapshot) -> Result<(Vec<u8>, usize), StoreError> {
    let raw = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok((lz4_flex::compress_prepend_size(&raw), raw.len()))
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<TableSnapshot, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(snapshot)
}

/// Volatile store holding encoded snapshots, for tests and simulations.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, table_key: &str) -> Result<Option<TableSnapshot>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        records.get(table_key).map(|b| decode_snapshot(b)).transpose()
    }

    fn save(&self, table_key: &str, snapshot: &TableSnapshot) -> Result<(), StoreError> {
        let (bytes, _) = encode_snapshot(snapshot)?;
        self.records
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?
            .insert(table_key.to_string(), bytes);
        Ok(())
    }
}
