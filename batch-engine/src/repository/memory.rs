use super::TransactionRepository;
use crate::{
    types::{Transaction, TransactionBatch, TransactionStats, TransactionStatus},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    transactions: DashMap<Uuid, Transaction>,
    batches: DashMap<Uuid, TransactionBatch>,
    failing: AtomicBool,
}

impl MemoryRepository {
    /// Create empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (fault injection)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("repository unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionRepository for MemoryRepository {
    async fn create_transaction(&self, tx: &Transaction) -> Result<()> {
        self.check()?;
        match self.transactions.entry(tx.id) {
            Entry::Occupied(_) => Err(Error::InvalidState(format!(
                "transaction {} already exists",
                tx.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(tx.clone());
                Ok(())
            }
        }
    }

    async fn update_transaction(&self, tx: &Transaction) -> Result<()> {
        self.check()?;
        match self.transactions.get_mut(&tx.id) {
            Some(mut stored) => {
                *stored = tx.clone();
                Ok(())
            }
            None => Err(Error::TransactionNotFound(tx.id)),
        }
    }

    async fn update_transaction_if(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
    ) -> Result<bool> {
        self.check()?;
        match self.transactions.get_mut(&tx.id) {
            Some(mut stored) if stored.status == expected => {
                *stored = tx.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::TransactionNotFound(tx.id)),
        }
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.check()?;
        Ok(self.transactions.get(&id).map(|tx| tx.clone()))
    }

    async fn get_pending_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.check()?;
        let mut pending: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| tx.status.is_unsubmitted())
            .map(|tx| tx.clone())
            .collect();

        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_expired_transactions(&self, now: DateTime<Utc>) -> Result<Vec<Transaction>> {
        self.check()?;
        Ok(self
            .transactions
            .iter()
            .filter(|tx| tx.status.is_unsubmitted() && tx.is_expired(now))
            .map(|tx| tx.clone())
            .collect())
    }

    async fn count_by_status(&self, status: TransactionStatus) -> Result<u64> {
        self.check()?;
        Ok(self
            .transactions
            .iter()
            .filter(|tx| tx.status == status)
            .count() as u64)
    }

    async fn create_batch(&self, batch: &TransactionBatch) -> Result<()> {
        self.check()?;
        match self.batches.entry(batch.id) {
            Entry::Occupied(_) => Err(Error::InvalidState(format!(
                "batch {} already exists",
                batch.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(batch.clone());
                Ok(())
            }
        }
    }

    async fn update_batch(&self, batch: &TransactionBatch) -> Result<()> {
        self.check()?;
        match self.batches.get_mut(&batch.id) {
            Some(mut stored) => {
                *stored = batch.clone();
                Ok(())
            }
            None => Err(Error::BatchNotFound(batch.id)),
        }
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<TransactionBatch>> {
        self.check()?;
        Ok(self.batches.get(&id).map(|batch| batch.clone()))
    }

    async fn get_transactions_by_batch(&self, batch_id: Uuid) -> Result<Vec<Transaction>> {
        self.check()?;
        let mut members: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|tx| tx.batch_id == Some(batch_id))
            .map(|tx| tx.clone())
            .collect();

        // Submission order when the batch is known
        if let Some(batch) = self.batches.get(&batch_id) {
            let position = |id: &Uuid| batch.transaction_ids.iter().position(|m| m == id);
            members.sort_by_key(|tx| position(&tx.id));
        }
        Ok(members)
    }

    async fn transaction_stats(&self) -> Result<TransactionStats> {
        self.check()?;
        let transactions: Vec<Transaction> =
            self.transactions.iter().map(|tx| tx.clone()).collect();
        let batches: Vec<TransactionBatch> =
            self.batches.iter().map(|batch| batch.clone()).collect();
        Ok(TransactionStats::from_records(&transactions, &batches))
    }
}
