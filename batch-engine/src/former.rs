//! Batch formation
//!
//! On every tick the former claims ready groups from the queue, prices them
//! with the fee optimizer and persists the batch before any member is marked
//! `Batched`. If the batch cannot be persisted the group goes back to the
//! queue untouched.

use crate::{
    config::BatchConfig,
    events::{EventKind, EventSink, LifecycleEvent},
    fees::FeeOptimizer,
    metrics::Metrics,
    queue::PriorityQueue,
    repository::TransactionRepository,
    types::{Transaction, TransactionBatch, TransactionStatus},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A persisted batch and its members in submission order
#[derive(Debug, Clone)]
pub struct FormedBatch {
    /// Batch record
    pub batch: TransactionBatch,
    /// Members, already `Batched`
    pub members: Vec<Transaction>,
}

/// Groups queued transactions into fee-optimized batches
pub struct BatchFormer {
    config: BatchConfig,
    queue: Arc<PriorityQueue>,
    repository: Arc<dyn TransactionRepository>,
    fees: FeeOptimizer,
    events: EventSink,
    metrics: Metrics,
}

impl std::fmt::Debug for BatchFormer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFormer")
            .field("config", &self.config)
            .field("fees", &self.fees)
            .finish_non_exhaustive()
    }
}

impl BatchFormer {
    /// Create batch former
    pub fn new(
        config: BatchConfig,
        queue: Arc<PriorityQueue>,
        repository: Arc<dyn TransactionRepository>,
        fees: FeeOptimizer,
        events: EventSink,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            queue,
            repository,
            fees,
            events,
            metrics,
        }
    }

    /// Form every batch that is ready at `now`
    pub async fn form_batches(&self, now: DateTime<Utc>) -> Vec<FormedBatch> {
        let groups = self.queue.take_ready_groups(now, &self.config);
        if groups.is_empty() {
            return Vec::new();
        }

        let mut formed = Vec::with_capacity(groups.len());

        for group in groups {
            // Members are in queue order, so the first carries the highest priority
            let Some(priority) = group.members.first().map(|tx| tx.priority) else {
                continue;
            };

            let types: Vec<_> = group.members.iter().map(|tx| tx.tx_type).collect();
            let fees = self.fees.optimize(&types);
            let ids = group.members.iter().map(|tx| tx.id).collect();
            let batch = TransactionBatch::new(group.key.clone(), priority, ids, &fees, now);

            if let Err(e) = self.repository.create_batch(&batch).await {
                error!(
                    batch_key = %group.key,
                    members = group.members.len(),
                    error = %e,
                    "Failed to persist batch, returning members to queue"
                );
                self.queue.restore(group);
                continue;
            }

            if group.undersized {
                debug!(
                    batch_id = %batch.id,
                    size = group.members.len(),
                    min = self.config.min_batch_size,
                    "Forming undersized batch after max wait"
                );
            }

            let mut members = group.members;
            for (tx, fee) in members.iter_mut().zip(&fees.member_fees) {
                tx.transition(TransactionStatus::Batched, now);
                tx.batch_id = Some(batch.id);
                tx.fee_drops = Some(*fee);

                if let Err(e) = self.repository.update_transaction(tx).await {
                    error!(
                        tx_id = %tx.id,
                        batch_id = %batch.id,
                        error = %e,
                        "Failed to persist batched transaction"
                    );
                }
                self.events
                    .emit(LifecycleEvent::transaction(EventKind::Batched, tx, now));
            }

            self.metrics.batches_formed.inc();
            self.metrics.batch_size.observe(members.len() as f64);

            info!(
                batch_id = %batch.id,
                key = %batch.key,
                size = batch.transaction_count,
                total_fee = batch.total_fee,
                optimized_fee = batch.optimized_fee,
                savings = batch.fee_savings,
                "Formed batch"
            );

            formed.push(FormedBatch { batch, members });
        }

        self.metrics.queue_depth.set(self.queue.len() as i64);
        formed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fees::FeePolicy,
        repository::MemoryRepository,
        types::{BatchStatus, Priority, TransactionRequest},
    };
    use chrono::Duration;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    struct Fixture {
        queue: Arc<PriorityQueue>,
        repository: Arc<MemoryRepository>,
        former: BatchFormer,
    }

    fn fixture(max: usize, min: usize, wait_ms: u64) -> Fixture {
        let queue = Arc::new(PriorityQueue::new());
        let repository = Arc::new(MemoryRepository::new());
        let former = BatchFormer::new(
            BatchConfig {
                max_batch_size: max,
                min_batch_size: min,
                max_wait_time_ms: wait_ms,
                tick_interval_ms: 100,
            },
            queue.clone(),
            repository.clone(),
            FeeOptimizer::new(FeePolicy::default()),
            EventSink::default(),
            Metrics::new().unwrap(),
        );
        Fixture {
            queue,
            repository,
            former,
        }
    }

    async fn enqueue(f: &Fixture, priority: Priority, now: DateTime<Utc>) -> Transaction {
        let request = TransactionRequest::payment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
            "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
            Decimal::new(10, 0),
            "XRP",
        )
        .with_priority(priority);
        let mut tx = Transaction::new(request, 3, now).unwrap();
        tx.status = TransactionStatus::Queued;
        tx.queued_at = Some(now);
        f.repository.create_transaction(&tx).await.unwrap();
        f.queue.push(tx.clone());
        tx
    }

    #[tokio::test]
    async fn test_forms_full_batch_with_fees() {
        let f = fixture(4, 2, 60_000);
        let now = Utc::now();
        for _ in 0..4 {
            enqueue(&f, Priority::Normal, now).await;
        }

        let formed = f.former.form_batches(now).await;
        assert_eq!(formed.len(), 1);

        let batch = &formed[0].batch;
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.transaction_count, 4);
        assert_eq!(batch.total_fee, 40);
        assert_eq!(batch.optimized_fee, 25);
        assert_eq!(batch.fee_savings, 15);

        let stored = f.repository.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(&stored, batch);

        for tx in &formed[0].members {
            let stored = f.repository.get_transaction(tx.id).await.unwrap().unwrap();
            assert_eq!(stored.status, TransactionStatus::Batched);
            assert_eq!(stored.batch_id, Some(batch.id));
        }
        assert_eq!(formed[0].members[0].fee_drops, Some(10));
        assert_eq!(formed[0].members[1].fee_drops, Some(5));
    }

    #[tokio::test]
    async fn test_waits_until_max_wait() {
        let f = fixture(10, 2, 5_000);
        let start = Utc::now();
        for _ in 0..4 {
            enqueue(&f, Priority::Normal, start).await;
        }

        assert!(f
            .former
            .form_batches(start + Duration::seconds(4))
            .await
            .is_empty());

        let formed = f.former.form_batches(start + Duration::seconds(5)).await;
        assert_eq!(formed.len(), 1);
        assert_eq!(formed[0].members.len(), 4);
    }

    #[tokio::test]
    async fn test_batch_priority_from_first_member() {
        let f = fixture(3, 1, 60_000);
        let now = Utc::now();
        enqueue(&f, Priority::Low, now).await;
        enqueue(&f, Priority::High, now).await;
        enqueue(&f, Priority::Normal, now).await;

        let formed = f.former.form_batches(now).await;
        assert_eq!(formed[0].batch.priority, Priority::High);
        assert_eq!(formed[0].members[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_persist_failure_restores_group() {
        let f = fixture(2, 1, 60_000);
        let now = Utc::now();
        enqueue(&f, Priority::Normal, now).await;
        enqueue(&f, Priority::Normal, now).await;

        f.repository.set_failing(true);
        assert!(f.former.form_batches(now).await.is_empty());
        assert_eq!(f.queue.len(), 2);

        f.repository.set_failing(false);
        assert_eq!(f.former.form_batches(now).await.len(), 1);
        assert!(f.queue.is_empty());
    }
}
