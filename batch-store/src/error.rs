//! Error types for the persistent store

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Store errors
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Bincode encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Missing column family
    #[error("Column family not found: {0}")]
    MissingColumnFamily(&'static str),

    /// Index key that does not decode to an ID
    #[error("Corrupt index key in {0}")]
    CorruptIndex(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<Error> for batch_engine::Error {
    fn from(err: Error) -> Self {
        batch_engine::Error::Storage(err.to_string())
    }
}
