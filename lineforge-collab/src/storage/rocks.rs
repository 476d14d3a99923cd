//! RocksDB-backed snapshot persistence.
//!
//! Column families:
//! - `snapshots` — Full snapshot state (bincode, LZ4 compressed), keyed by state key
//! - `metadata`  — Size and version bookkeeping for each saved state (bincode)
//!
//! The checksum is never trusted from disk: it is recomputed from the loaded
//! contents, and a mismatch with the recorded one is logged.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::snapshot::{SnapshotPersistence, SnapshotState, StoreError};

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
    /// Key the shared snapshot is stored under
    pub state_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lineforge_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
            state_key: "localstorage-sync".to_string(),
        }
    }
}

impl StoreConfig {
    /// Config at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            state_key: "localstorage-sync".to_string(),
        }
    }
}

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: u64,
    pub key_count: u64,
    /// Uncompressed encoded size in bytes
    pub raw_size: u64,
    pub compressed_size: u64,
    /// Checksum at save time, for diagnostics only
    pub checksum: String,
    /// Milliseconds since the Unix epoch
    pub saved_at: i64,
}

impl SnapshotMetadata {
    fn encode(&self) -> Result<Vec<u8>, DbError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DbError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DbError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// On-disk form of [`SnapshotState`]; the checksum is not part of it.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    version: u64,
    entries: Vec<(String, String)>,
    updated_at_ms: Option<i64>,
}

impl StoredSnapshot {
    fn from_state(state: &SnapshotState) -> Self {
        Self {
            version: state.version,
            entries: state
                .snapshot
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            updated_at_ms: state.updated_at.map(|t| t.timestamp_millis()),
        }
    }

    fn into_state(self) -> SnapshotState {
        let updated_at = self.updated_at_ms.and_then(DateTime::<Utc>::from_timestamp_millis);
        SnapshotState::new(self.version, self.entries.into_iter().collect(), updated_at)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum DbError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::DatabaseError(e) => write!(f, "Database error: {e}"),
            DbError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            DbError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            DbError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<rocksdb::Error> for DbError {
    fn from(e: rocksdb::Error) -> Self {
        DbError::DatabaseError(e.to_string())
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::DatabaseError(e) | DbError::SerializationError(e) => StoreError::Persistence(e),
            DbError::DeserializationError(e) | DbError::CompressionError(e) => StoreError::Corrupt(e),
        }
    }
}

/// RocksDB-backed snapshot store.
pub struct SnapshotDb {
    /// RocksDB instance (single-threaded mode — writes are serialized by the snapshot actor)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SnapshotDb {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, DbError> {
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

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are LZ4 compressed before they reach RocksDB
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Save the full state and its metadata in one atomic batch.
    pub fn save_state(&self, state: &SnapshotState) -> Result<SnapshotMetadata, DbError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let raw = bincode::serde::encode_to_vec(
            StoredSnapshot::from_state(state),
            bincode::config::standard(),
        )
        .map_err(|e| DbError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let meta = SnapshotMetadata {
            version: state.version,
            key_count: state.snapshot.len() as u64,
            raw_size: raw.len() as u64,
            compressed_size: compressed.len() as u64,
            checksum: state.checksum.clone(),
            saved_at: Utc::now().timestamp_millis(),
        };

        let key = self.config.state_key.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot version {} ({} keys, {} → {} bytes)",
            meta.version,
            meta.key_count,
            meta.raw_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    /// Load the saved state, if any.
    pub fn load_state(&self) -> Result<Option<SnapshotState>, DbError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(&cf, self.config.state_key.as_bytes())? else {
            return Ok(None);
        };

        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| DbError::CompressionError(e.to_string()))?;
        let (stored, _): (StoredSnapshot, usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| DbError::DeserializationError(e.to_string()))?;
        let state = stored.into_state();

        if let Some(meta) = self.load_metadata()? {
            if meta.checksum != state.checksum {
                log::warn!(
                    "Stored checksum {} differs from recomputed {}",
                    meta.checksum,
                    state.checksum
                );
            }
        }
        Ok(Some(state))
    }

    pub fn load_metadata(&self) -> Result<Option<SnapshotMetadata>, DbError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, self.config.state_key.as_bytes())?
            .map(|bytes| SnapshotMetadata::decode(&bytes))
            .transpose()
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, DbError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| DbError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotPersistence for SnapshotDb {
    fn load(&self) -> Result<Option<SnapshotState>, StoreError> {
        Ok(self.load_state()?)
    }

    fn save(&self, state: &SnapshotState) -> Result<(), StoreError> {
        self.save_state(state)?;
        Ok(())
    }
}
