//! Error types for the batching engine

use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Request rejected before any state was created
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    /// Batch not found
    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    /// Repository collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Event publishing failure
    #[error("Event publish error: {0}")]
    Publish(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
