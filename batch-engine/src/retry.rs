//! Retry handling for recoverable ledger failures
//!
//! A recoverable failure puts the transaction back on the queue with an
//! exponential backoff delay until its retry budget is spent. Backoff is
//! monotonic in the attempt number and capped at `max_delay_ms`.

use crate::{
    config::RetryConfig,
    events::{EventKind, EventSink, LifecycleEvent},
    metrics::Metrics,
    queue::PriorityQueue,
    repository::TransactionRepository,
    types::{Transaction, TransactionStatus},
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of a recoverable failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back on the queue, eligible again at `next_attempt_at`
    Requeued {
        /// Attempt number (1-based)
        attempt: u32,
        /// Earliest next submission
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry budget spent; transaction failed
    Exhausted,
    /// Expiry passed while in flight; transaction expired
    Expired,
}

/// Requeues or fails transactions after recoverable errors
pub struct RetryManager {
    config: RetryConfig,
    repository: Arc<dyn TransactionRepository>,
    queue: Arc<PriorityQueue>,
    events: EventSink,
    metrics: Metrics,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryManager {
    /// Create retry manager
    pub fn new(
        config: RetryConfig,
        repository: Arc<dyn TransactionRepository>,
        queue: Arc<PriorityQueue>,
        events: EventSink,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            repository,
            queue,
            events,
            metrics,
        }
    }

    /// Delay before attempt `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(&self.config, attempt)
    }

    /// Apply the retry policy to a transaction in memory
    pub fn decide(&self, tx: &mut Transaction, reason: &str, now: DateTime<Utc>) -> RetryDecision {
        decide(&self.config, tx, reason, now)
    }

    /// Apply the retry policy, persist the result and requeue if allowed
    pub async fn handle_recoverable(
        &self,
        tx: &mut Transaction,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let decision = self.decide(tx, reason, now);

        if let Err(e) = self.repository.update_transaction(tx).await {
            error!(tx_id = %tx.id, error = %e, "Failed to persist retry decision");
        }

        match &decision {
            RetryDecision::Requeued {
                attempt,
                next_attempt_at,
            } => {
                warn!(
                    tx_id = %tx.id,
                    attempt,
                    max_retries = tx.max_retries,
                    next_attempt_at = %next_attempt_at,
                    reason,
                    "Requeueing transaction after recoverable failure"
                );
                self.queue.push(tx.clone());
                self.metrics.retried.inc();
                self.events
                    .emit(LifecycleEvent::transaction(EventKind::Retried, tx, now));
            }
            RetryDecision::Exhausted => {
                warn!(
                    tx_id = %tx.id,
                    retries = tx.retry_count,
                    reason,
                    "Retry budget exhausted"
                );
                self.metrics.failed.inc();
                self.events
                    .emit(LifecycleEvent::transaction(EventKind::Failed, tx, now));
            }
            RetryDecision::Expired => {
                info!(tx_id = %tx.id, "Transaction expired before retry");
                self.metrics.expired.inc();
                self.events
                    .emit(LifecycleEvent::transaction(EventKind::Expired, tx, now));
            }
        }

        decision
    }
}

/// `initial * multiplier^(attempt-1)`, capped at `max_delay_ms`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let delay = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = delay.min(config.max_delay_ms as f64).max(0.0);

    Duration::milliseconds(capped as i64)
}

/// Pure retry policy
pub fn decide(
    config: &RetryConfig,
    tx: &mut Transaction,
    reason: &str,
    now: DateTime<Utc>,
) -> RetryDecision {
    tx.last_error = Some(reason.to_string());

    if tx.is_expired(now) {
        tx.transition(TransactionStatus::Expired, now);
        tx.batch_id = None;
        tx.next_attempt_at = None;
        return RetryDecision::Expired;
    }

    if tx.can_retry() {
        tx.retry_count += 1;
        let next_attempt_at = now + backoff_delay(config, tx.retry_count);

        tx.transition(TransactionStatus::Queued, now);
        tx.batch_id = None;
        tx.fee_drops = None;
        tx.next_attempt_at = Some(next_attempt_at);

        return RetryDecision::Requeued {
            attempt: tx.retry_count,
            next_attempt_at,
        };
    }

    tx.transition(TransactionStatus::Failed, now);
    tx.next_attempt_at = None;
    RetryDecision::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionRequest;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn config() -> RetryConfig {
        RetryConfig {
            default_max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }

    fn in_flight(max_retries: u32) -> Transaction {
        let request = TransactionRequest::payment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
            "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
            Decimal::new(7, 0),
            "XRP",
        )
        .with_max_retries(max_retries);
        let mut tx = Transaction::new(request, 3, Utc::now()).unwrap();
        tx.status = TransactionStatus::Batched;
        tx.batch_id = Some(Uuid::new_v4());
        tx
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let config = config();
        let delays: Vec<i64> = (1..=6)
            .map(|n| backoff_delay(&config, n).num_milliseconds())
            .collect();

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000, 5_000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_requeue_clears_batch_assignment() {
        let now = Utc::now();
        let mut tx = in_flight(2);

        let decision = decide(&config(), &mut tx, "network error", now);
        assert_eq!(
            decision,
            RetryDecision::Requeued {
                attempt: 1,
                next_attempt_at: now + Duration::seconds(1),
            }
        );
        assert_eq!(tx.status, TransactionStatus::Queued);
        assert_eq!(tx.retry_count, 1);
        assert!(tx.batch_id.is_none());
        assert_eq!(tx.last_error.as_deref(), Some("network error"));
        assert!(!tx.is_due(now));
    }

    #[test]
    fn test_requeue_keeps_outstanding_ledger_hash() {
        let now = Utc::now();
        let mut tx = in_flight(2);
        tx.status = TransactionStatus::Processing;
        tx.ledger_hash = Some("C0FFEE".to_string());
        tx.expires_at = Some(now - Duration::milliseconds(1));

        // Accepted work is not expired; it is polled again on the next attempt
        assert!(matches!(
            decide(&config(), &mut tx, "timed out", now),
            RetryDecision::Requeued { .. }
        ));
        assert_eq!(tx.ledger_hash.as_deref(), Some("C0FFEE"));
    }

    #[test]
    fn test_exhaustion_fails_and_keeps_batch() {
        let now = Utc::now();
        let mut tx = in_flight(1);
        let batch_id = tx.batch_id;

        assert!(matches!(
            decide(&config(), &mut tx, "timeout", now),
            RetryDecision::Requeued { .. }
        ));

        tx.batch_id = batch_id;
        assert_eq!(decide(&config(), &mut tx, "timeout", now), RetryDecision::Exhausted);
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.retry_count, 1);
        assert_eq!(tx.batch_id, batch_id);
    }

    #[test]
    fn test_zero_budget_fails_immediately() {
        let mut tx = in_flight(0);
        assert_eq!(
            decide(&config(), &mut tx, "timeout", Utc::now()),
            RetryDecision::Exhausted
        );
        assert_eq!(tx.retry_count, 0);
    }

    #[test]
    fn test_expired_during_flight() {
        let now = Utc::now();
        let mut tx = in_flight(3);
        tx.expires_at = Some(now - Duration::milliseconds(1));

        assert_eq!(decide(&config(), &mut tx, "timeout", now), RetryDecision::Expired);
        assert_eq!(tx.status, TransactionStatus::Expired);
        assert_eq!(tx.retry_count, 0);
    }
}
