//! Expiration of un-submitted transactions
//!
//! Only Pending and Queued transactions expire. Anything already claimed by
//! a batch is left to the submitter, which checks expiry again before a retry.

use crate::{
    events::{EventKind, EventSink, LifecycleEvent},
    metrics::Metrics,
    queue::PriorityQueue,
    repository::TransactionRepository,
    types::{Transaction, TransactionStatus},
    Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Expires queued and orphaned pending transactions
pub struct ExpirationSweeper {
    queue: Arc<PriorityQueue>,
    repository: Arc<dyn TransactionRepository>,
    events: EventSink,
    metrics: Metrics,
}

impl std::fmt::Debug for ExpirationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpirationSweeper")
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl ExpirationSweeper {
    /// Create sweeper
    pub fn new(
        queue: Arc<PriorityQueue>,
        repository: Arc<dyn TransactionRepository>,
        events: EventSink,
        metrics: Metrics,
    ) -> Self {
        Self {
            queue,
            repository,
            events,
            metrics,
        }
    }

    /// Expire everything whose deadline passed at `now`. Returns the expired IDs.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut expired = Vec::new();

        for tx in self.queue.remove_expired(now) {
            if let Some(id) = self.expire(tx, now).await {
                expired.push(id);
            }
        }

        // Rows persisted but never pushed (crash between the two writes)
        for tx in self.repository.get_expired_transactions(now).await? {
            if tx.status != TransactionStatus::Pending || self.queue.contains(&tx.id) {
                // Queued rows missing from the queue are being claimed right now
                continue;
            }
            if let Some(id) = self.expire(tx, now).await {
                expired.push(id);
            }
        }

        if expired.is_empty() {
            debug!("Expiration sweep found nothing");
        } else {
            info!(count = expired.len(), "Expired transactions");
        }

        Ok(expired)
    }

    /// Mark one un-submitted transaction Expired unless its row moved on meanwhile
    pub(crate) async fn expire(&self, mut tx: Transaction, now: DateTime<Utc>) -> Option<Uuid> {
        if !tx.status.is_unsubmitted() {
            return None;
        }

        let previous = tx.status;
        tx.transition(TransactionStatus::Expired, now);
        tx.next_attempt_at = None;

        match self.repository.update_transaction_if(&tx, previous).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(tx_id = %tx.id, "Transaction changed state before expiry, skipping");
                return None;
            }
            Err(e) => {
                error!(tx_id = %tx.id, error = %e, "Failed to persist expired transaction");
                return None;
            }
        }

        self.metrics.expired.inc();
        self.events
            .emit(LifecycleEvent::transaction(EventKind::Expired, &tx, now));
        Some(tx.id)
    }
}
