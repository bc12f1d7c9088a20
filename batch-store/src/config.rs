//! Store configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// RocksDB tuning
    pub rocksdb: RocksDbConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/batch-store"),
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// RocksDB tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Background compaction and flush jobs
    pub max_background_jobs: i32,

    /// Collect RocksDB statistics
    pub enable_statistics: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}
