//! Persistence capability for transactions and batches

pub mod memory;

pub use memory::MemoryRepository;

use crate::{
    types::{Transaction, TransactionBatch, TransactionStats, TransactionStatus},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable store for engine state
///
/// Implementations must make each call atomic for the record it touches.
/// The engine never holds a repository lock across calls.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Insert a new transaction. Fails if the ID already exists.
    async fn create_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Overwrite an existing transaction
    async fn update_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Overwrite an existing transaction only while its stored status is
    /// `expected`. Returns `false`, writing nothing, when the status differs.
    async fn update_transaction_if(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
    ) -> Result<bool>;

    /// Fetch a transaction
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Un-submitted transactions (pending or queued), oldest first
    async fn get_pending_transactions(&self, limit: usize) -> Result<Vec<Transaction>>;

    /// Un-submitted transactions whose expiry has passed
    async fn get_expired_transactions(&self, now: DateTime<Utc>) -> Result<Vec<Transaction>>;

    /// Number of transactions in a status
    async fn count_by_status(&self, status: TransactionStatus) -> Result<u64>;

    /// Insert a new batch. Fails if the ID already exists.
    async fn create_batch(&self, batch: &TransactionBatch) -> Result<()>;

    /// Overwrite an existing batch
    async fn update_batch(&self, batch: &TransactionBatch) -> Result<()>;

    /// Fetch a batch
    async fn get_batch(&self, id: Uuid) -> Result<Option<TransactionBatch>>;

    /// Transactions currently assigned to a batch
    async fn get_transactions_by_batch(&self, batch_id: Uuid) -> Result<Vec<Transaction>>;

    /// Aggregate statistics
    ///
    /// Called once per monitoring sample. Both bundled repositories compute
    /// it by scanning every record, so the cost grows with history; size
    /// `sample_interval_ms` accordingly.
    async fn transaction_stats(&self) -> Result<TransactionStats>;
}
