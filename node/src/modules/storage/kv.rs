//! Key-value storage backing the ingestion bookkeeping.
//!
//! The datastore facade in `modules::ingest` layers its namespaces on top of
//! the [`KvStore`] trait; `RocksDbKvStore` is the durable implementation and
//! `MemoryKvStore` backs embedding and tests.

use crate::utils::env::{env_bool, env_i32, env_path, env_usize};
use errors::AppError;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use tracing::{debug, error, info};

/// Configuration for the key-value store
#[derive(Debug, Clone)]
pub struct KvConfig {
    pub path: PathBuf,
    pub enable_compression: bool,
    pub max_open_files: i32,
    pub write_buffer_size: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/indexer-kv"),
            enable_compression: true,
            max_open_files: 1000,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl KvConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            path: env_path("KV_STORE_PATH", "/tmp/indexer-kv"),
            enable_compression: env_bool("KV_ENABLE_COMPRESSION", true),
            max_open_files: env_i32("KV_MAX_OPEN_FILES", 1000),
            write_buffer_size: env_usize("KV_WRITE_BUFFER_SIZE", 64 * 1024 * 1024),
        }
    }
}

/// Errors that can occur during KV operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<KvError> for AppError {
    fn from(err: KvError) -> Self {
        AppError::Storage(format!("KV store error: {}", err).into())
    }
}

/// Trait defining key-value store operations.
///
/// A missing key is not an error: `get` returns `None`.
pub trait KvStore: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Put a key-value pair
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Delete a key. Deleting an absent key is a no-op.
    fn delete(&self, key: &[u8]) -> Result<(), KvError>;

    /// Collect all entries whose key starts with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;

    /// Delete a set of keys in a single atomic batch.
    fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<(), KvError>;

    /// Flush all pending writes to disk
    fn flush(&self) -> Result<(), KvError>;
}

/// RocksDB implementation of the KvStore trait
pub struct RocksDbKvStore {
    db: Arc<DB>,
    path: PathBuf,
}

impl RocksDbKvStore {
    /// Create a new RocksDB-backed KV store
    pub fn new<P: AsRef<Path>>(path: P, config: &KvConfig) -> Result<Self, KvError> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!(
            path = %path_str,
            enable_compression = config.enable_compression,
            max_open_files = config.max_open_files,
            "Opening RocksDB KV store"
        );

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                error!(path = %path_str, error = %e, "Failed to create parent directory");
                KvError::Config(format!("Failed to create directory: {}", e))
            })?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(3);
        opts.set_keep_log_file_num(5);

        if config.enable_compression {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            debug!("Compression enabled (LZ4)");
        }

        let db = DB::open(&opts, path).map_err(|e| {
            error!(path = %path_str, error = %e, "Failed to open RocksDB");
            KvError::Storage(format!("Failed to open database: {}", e))
        })?;

        info!(path = %path_str, "RocksDB KV store opened successfully");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Get the path where this KV store is located
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for RocksDbKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        self.db.get(key).map_err(|e| {
            error!(error = %e, "Failed to get value");
            KvError::Storage(format!("Get operation failed: {}", e))
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.db.put(key, value).map_err(|e| {
            error!(error = %e, "Failed to put value");
            KvError::Storage(format!("Put operation failed: {}", e))
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.db.delete(key).map_err(|e| {
            error!(error = %e, "Failed to delete key");
            KvError::Storage(format!("Delete operation failed: {}", e))
        })
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward));

        for item in iter {
            match item {
                Ok((key, value)) => {
                    // Iteration is ordered, so the first non-matching key ends
                    // the scan.
                    if !key.starts_with(prefix) {
                        break;
                    }
                    entries.push((key.to_vec(), value.to_vec()));
                }
                Err(e) => {
                    error!(error = %e, "Iterator error during prefix scan");
                    return Err(KvError::Storage(format!("Iterator error: {}", e)));
                }
            }
        }

        Ok(entries)
    }

    fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key);
        }

        self.db.write(batch).map_err(|e| {
            error!(error = %e, "Failed to write delete batch");
            KvError::Storage(format!("Batch delete failed: {}", e))
        })
    }

    fn flush(&self) -> Result<(), KvError> {
        self.db.flush().map_err(|e| {
            error!(error = %e, "Failed to flush KV store");
            KvError::Storage(format!("Flush operation failed: {}", e))
        })
    }
}

impl Drop for RocksDbKvStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "Failed to flush KV store during drop");
        }
        info!(path = %self.path.display(), "RocksDB KV store closed");
    }
}

/// In-memory implementation of [`KvStore`].
///
/// An ordered map gives the same prefix-scan semantics as the RocksDB
/// iterator. Not durable; intended for embedding and tests.
#[derive(Default)]
pub struct MemoryKvStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let map = self
            .map
            .read()
            .map_err(|_| KvError::Storage("lock poisoned".to_string()))?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        let mut map = self
            .map
            .write()
            .map_err(|_| KvError::Storage("lock poisoned".to_string()))?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        let mut map = self
            .map
            .write()
            .map_err(|_| KvError::Storage("lock poisoned".to_string()))?;
        map.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let map = self
            .map
            .read()
            .map_err(|_| KvError::Storage("lock poisoned".to_string()))?;
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<(), KvError> {
        let mut map = self
            .map
            .write()
            .map_err(|_| KvError::Storage("lock poisoned".to_string()))?;
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), KvError> {
        Ok(())
    }
}
