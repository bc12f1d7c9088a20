//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// JetStream acknowledgement or stream error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Publish did not complete in time
    #[error("Publish timed out after {0}ms")]
    Timeout(u64),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for batch_engine::Error {
    fn from(err: Error) -> Self {
        batch_engine::Error::Publish(err.to_string())
    }
}
