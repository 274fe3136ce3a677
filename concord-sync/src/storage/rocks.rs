//! RocksDB-backed [`SyncStore`].
//!
//! Column families:
//! - `states`: canonical replica state per document (bincode, LZ4)
//! - `versions`: version rows (bincode, LZ4)
//!
//! Version key layout:
//! ```text
//! ┌────────────┬──────────────┬─────────────────────┬────────────┐
//! │ doc_id 16B │ version 8B BE│ created_at ns 8B BE │ row id 16B │
//! └────────────┴──────────────┴─────────────────────┴────────────┘
//! ```
//! A reverse seek from `doc_id | u64::MAX` lands on the highest version; a
//! prefix scan over `doc_id | version` yields the rows of one version already
//! in `(created_at, id)` order.
//!
//! Reference: Kleppmann, DDIA Chapter 3 (LSM Trees, SSTables)

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{DocumentVersion, SyncStore};
use crate::crdt::ReplicaState;
use crate::error::StoreError;

/// Column family names.
const CF_STATES: &str = "states";
const CF_VERSIONS: &str = "versions";

const COLUMN_FAMILIES: &[&str] = &[CF_STATES, CF_VERSIONS];

const DOC_PREFIX_LEN: usize = 16;
const VERSION_PREFIX_LEN: usize = DOC_PREFIX_LEN + 8;
const VERSION_KEY_LEN: usize = VERSION_PREFIX_LEN + 8 + 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("concord_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Durable store over RocksDB.
pub struct RocksStore {
    /// Single-threaded CF mode; callers serialize per document
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened sync store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_STATES => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_VERSIONS => {
                // Append-mostly; scanned by prefix and seeked in reverse
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    /// Version key prefix: doc_id (16 bytes) + version (8 bytes big-endian).
    fn version_prefix(doc_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(VERSION_KEY_LEN);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn version_key(row: &DocumentVersion) -> Vec<u8> {
        let mut key = Self::version_prefix(row.document_id, row.version);
        key.extend_from_slice(&timestamp_key(row.created_at).to_be_bytes());
        key.extend_from_slice(row.id.as_bytes());
        key
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<DocumentVersion>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut rows = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(Self::decode(&value)?);
        }
        Ok(rows)
    }
}

/// Nanosecond timestamp mapped to an order-preserving unsigned key.
fn timestamp_key(at: DateTime<Utc>) -> u64 {
    let nanos = at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp().saturating_mul(1_000_000_000));
    (nanos as u64) ^ (1 << 63)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl SyncStore for RocksStore {
    fn load_state(&self, doc_id: Uuid) -> Result<Option<ReplicaState>, StoreError> {
        let cf = self.cf(CF_STATES)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_state(&self, doc_id: Uuid, state: &ReplicaState) -> Result<(), StoreError> {
        let cf = self.cf(CF_STATES)?;
        let value = Self::encode(state)?;
        self.db
            .put_cf_opt(&cf, doc_id.as_bytes(), &value, &self.write_opts())?;
        log::trace!(
            "Saved state for {doc_id}: {} bytes ({} stored)",
            state.size(),
            value.len()
        );
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_STATES)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; DOC_PREFIX_LEN] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }
        Ok(doc_ids)
    }

    fn insert_version(&self, version: &DocumentVersion) -> Result<(), StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let key = Self::version_key(version);
        self.db
            .put_cf_opt(&cf, &key, Self::encode(version)?, &self.write_opts())?;
        Ok(())
    }

    fn highest_version(&self, doc_id: Uuid) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let mut upper = Self::version_prefix(doc_id, u64::MAX);
        upper.extend_from_slice(&[0xFF; VERSION_KEY_LEN - VERSION_PREFIX_LEN]);

        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() < VERSION_PREFIX_LEN || &key[..DOC_PREFIX_LEN] != doc_id.as_bytes() {
                    return Ok(None);
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[DOC_PREFIX_LEN..VERSION_PREFIX_LEN]);
                Ok(Some(u64::from_be_bytes(buf)))
            }
            None => Ok(None),
        }
    }

    fn versions_at(&self, doc_id: Uuid, version: u64) -> Result<Vec<DocumentVersion>, StoreError> {
        self.scan_prefix(&Self::version_prefix(doc_id, version))
    }

    fn delete_version(&self, row: &DocumentVersion) -> Result<(), StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        self.db
            .delete_cf_opt(&cf, Self::version_key(row), &self.write_opts())?;
        Ok(())
    }

    fn list_versions(&self, doc_id: Uuid) -> Result<Vec<DocumentVersion>, StoreError> {
        self.scan_prefix(doc_id.as_bytes())
    }
}
