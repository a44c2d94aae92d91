//! RocksDB-backed table snapshot store.
//!
//! Column families:
//! - `snapshots` - full [`TableSnapshot`]s (bincode, LZ4 compressed), keyed by table key
//! - `metadata`  - [`SnapshotMetadata`] for each stored table
//!
//! Snapshot and metadata are written in one `WriteBatch`, so a crash never
//! leaves one without the other.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{decode_snapshot, encode_snapshot, SnapshotStore, StoreError};
use crate::model::{now_millis, TableSnapshot};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true - the cache is the only copy while offline)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gridsync_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub table_key: String,
    pub cell_count: u64,
    pub pending_count: u64,
    pub rows: u32,
    pub cols: u32,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable per-table snapshot store.
pub struct TableStore {
    /// Single-threaded mode: column families are fixed at open time.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl TableStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened table store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_SNAPSHOTS => {
                // Values are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {}
        }

        opts
    }

    /// Persist a snapshot and its metadata atomically.
    pub fn save_snapshot(
        &self,
        table_key: &str,
        snapshot: &TableSnapshot,
    ) -> Result<SnapshotMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let (compressed, raw_len) = encode_snapshot(snapshot)?;
        let meta = SnapshotMetadata {
            table_key: table_key.to_string(),
            cell_count: snapshot.cells.len() as u64,
            pending_count: snapshot.pending_changes.len() as u64,
            rows: snapshot.rows,
            cols: snapshot.cols,
            snapshot_size: raw_len as u64,
            compressed_size: compressed.len() as u64,
            updated_at: now_millis(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, table_key.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, table_key.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    pub fn load_snapshot(&self, table_key: &str) -> Result<Option<TableSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, table_key.as_bytes())? {
            Some(bytes) => decode_snapshot(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn load_metadata(&self, table_key: &str) -> Result<SnapshotMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, table_key.as_bytes())? {
            Some(bytes) => SnapshotMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(table_key.to_string())),
        }
    }

    /// Keys of every stored table.
    pub fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn delete_table(&self, table_key: &str) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snapshots, table_key.as_bytes());
        batch.delete_cf(&cf_meta, table_key.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for TableStore {
    fn load(&self, table_key: &str) -> Result<Option<TableSnapshot>, StoreError> {
        self.load_snapshot(table_key)
    }

    fn save(&self, table_key: &str, snapshot: &TableSnapshot) -> Result<(), StoreError> {
        self.save_snapshot(table_key, snapshot).map(|_| ())
    }
}
