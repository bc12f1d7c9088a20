//! Batch submission to the ledger
//!
//! Members of a batch are submitted one after another in batch order; only
//! whole batches run concurrently. Every member ends in exactly one outcome
//! (confirmed, failed, requeued or expired) and the batch counts it once.

use crate::{
    config::SubmitterConfig,
    events::{EventKind, EventSink, LifecycleEvent},
    former::FormedBatch,
    ledger::{ConfirmationStatus, LedgerClient, LedgerError, SubmitRequest},
    metrics::Metrics,
    repository::TransactionRepository,
    retry::{RetryDecision, RetryManager},
    types::{Transaction, TransactionBatch, TransactionStatus},
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Final outcome of one member submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOutcome {
    /// Validated on the ledger
    Confirmed,
    /// Terminal failure
    Failed,
    /// Returned to the queue for another attempt
    Requeued,
    /// Expired while in flight
    Expired,
}

/// Submits formed batches and records outcomes
pub struct Submitter {
    config: SubmitterConfig,
    ledger: Arc<dyn LedgerClient>,
    repository: Arc<dyn TransactionRepository>,
    retry: Arc<RetryManager>,
    events: EventSink,
    metrics: Metrics,
}

impl std::fmt::Debug for Submitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submitter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Submitter {
    /// Create submitter
    pub fn new(
        config: SubmitterConfig,
        ledger: Arc<dyn LedgerClient>,
        repository: Arc<dyn TransactionRepository>,
        retry: Arc<RetryManager>,
        events: EventSink,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            ledger,
            repository,
            retry,
            events,
            metrics,
        }
    }

    /// Submit every member of a batch and return the completed batch
    pub async fn submit_batch(&self, formed: FormedBatch) -> TransactionBatch {
        let FormedBatch { mut batch, members } = formed;

        batch.mark_processing(Utc::now());
        self.persist_batch(&batch).await;

        debug!(batch_id = %batch.id, size = members.len(), "Submitting batch");

        for (position, mut tx) in members.into_iter().enumerate() {
            match self.submit_member(&batch, position as u32, &mut tx).await {
                MemberOutcome::Confirmed => batch.record_success(),
                MemberOutcome::Failed | MemberOutcome::Requeued | MemberOutcome::Expired => {
                    batch.record_failure()
                }
            }
            self.persist_batch(&batch).await;
        }

        let now = Utc::now();
        if batch.try_complete(now) {
            self.persist_batch(&batch).await;
            self.metrics.fee_savings.inc_by(batch.fee_savings);

            info!(
                batch_id = %batch.id,
                status = batch.status.as_str(),
                confirmed = batch.success_count,
                failed = batch.failure_count,
                "Batch completed"
            );
            self.events
                .emit(LifecycleEvent::batch(EventKind::BatchCompleted, &batch, now));
        }

        batch
    }

    /// Submit one member and drive it to an outcome
    ///
    /// A member requeued while its earlier submission was still unresolved
    /// keeps that ledger hash; it is polled again instead of being
    /// resubmitted, and only submitted anew once the ledger reports it dropped.
    pub async fn submit_member(
        &self,
        batch: &TransactionBatch,
        position: u32,
        tx: &mut Transaction,
    ) -> MemberOutcome {
        if let Some(tx_hash) = tx.ledger_hash.clone() {
            tx.transition(TransactionStatus::Processing, Utc::now());
            self.persist(tx).await;

            match self.await_confirmation(&tx_hash).await {
                Ok(ledger_index) => return self.confirm(batch, tx, &tx_hash, ledger_index).await,
                Err(LedgerError::Dropped(_)) => {
                    info!(
                        tx_id = %tx.id,
                        tx_hash = %tx_hash,
                        "Earlier submission dropped, submitting again"
                    );
                    tx.ledger_hash = None;
                    tx.processed_at = None;
                }
                Err(e) => return self.handle_failure(tx, e).await,
            }
        }

        let request = SubmitRequest {
            transaction_id: tx.id,
            batch_id: batch.id,
            position,
            tx_type: tx.tx_type,
            from: tx.from_address.clone(),
            to: tx.to_address.clone(),
            amount: tx.amount,
            currency: tx.currency.clone(),
            destination_tag: tx.destination_tag,
            memo: tx.memo.clone(),
            fee_drops: tx.fee_drops.unwrap_or(0),
        };

        let started = Instant::now();
        let submit = self.ledger.submit(&request);
        let submitted = match timeout(self.config.submit_timeout(), submit).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(self.config.submit_timeout_ms)),
        };
        self.metrics
            .submission_duration
            .observe(started.elapsed().as_secs_f64());

        let receipt = match submitted {
            Ok(receipt) => receipt,
            Err(e) => return self.handle_failure(tx, e).await,
        };

        let processed_at = Utc::now();
        tx.transition(TransactionStatus::Processing, processed_at);
        tx.processed_at = Some(processed_at);
        tx.ledger_hash = Some(receipt.tx_hash.clone());
        self.persist(tx).await;

        match self.await_confirmation(&receipt.tx_hash).await {
            Ok(ledger_index) => self.confirm(batch, tx, &receipt.tx_hash, ledger_index).await,
            Err(e) => self.handle_failure(tx, e).await,
        }
    }

    async fn confirm(
        &self,
        batch: &TransactionBatch,
        tx: &mut Transaction,
        tx_hash: &str,
        ledger_index: u64,
    ) -> MemberOutcome {
        let now = Utc::now();
        let confirmed_at = tx.processed_at.map_or(now, |processed| now.max(processed));
        tx.transition(TransactionStatus::Confirmed, confirmed_at);
        tx.confirmed_at = Some(confirmed_at);
        tx.next_attempt_at = None;
        self.persist(tx).await;

        self.metrics.confirmed.inc();
        info!(
            tx_id = %tx.id,
            batch_id = %batch.id,
            tx_hash,
            ledger_index,
            "Transaction confirmed"
        );
        self.events.emit(LifecycleEvent::transaction(
            EventKind::Confirmed,
            tx,
            confirmed_at,
        ));
        MemberOutcome::Confirmed
    }

    /// Poll until validated, rejected, dropped or out of attempts
    async fn await_confirmation(&self, tx_hash: &str) -> Result<u64, LedgerError> {
        let attempts = self.config.confirmation_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(self.config.poll_interval()).await;
            }

            match timeout(self.config.submit_timeout(), self.ledger.confirmation(tx_hash)).await {
                Ok(Ok(ConfirmationStatus::Validated { ledger_index })) => return Ok(ledger_index),
                Ok(Ok(ConfirmationStatus::Rejected { code, message })) => {
                    return Err(LedgerError::Rejected { code, message })
                }
                Ok(Ok(ConfirmationStatus::Dropped)) => {
                    return Err(LedgerError::Dropped(tx_hash.to_string()))
                }
                Ok(Ok(ConfirmationStatus::Pending)) => {}
                Ok(Err(e)) if e.is_recoverable() => {
                    debug!(tx_hash, error = %e, "Confirmation poll failed");
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(tx_hash, "Confirmation poll timed out");
                }
            }
        }

        let waited_ms = self.config.confirmation_poll_interval_ms * (attempts as u64 - 1);
        Err(LedgerError::Timeout(waited_ms))
    }

    async fn handle_failure(&self, tx: &mut Transaction, e: LedgerError) -> MemberOutcome {
        let now = Utc::now();

        if e.is_recoverable() {
            if matches!(e, LedgerError::Dropped(_)) {
                // Nothing left on the ledger; the next attempt submits again
                tx.ledger_hash = None;
                tx.processed_at = None;
            }
            return match self.retry.handle_recoverable(tx, &e.to_string(), now).await {
                RetryDecision::Requeued { .. } => MemberOutcome::Requeued,
                RetryDecision::Exhausted => MemberOutcome::Failed,
                RetryDecision::Expired => MemberOutcome::Expired,
            };
        }

        tx.transition(TransactionStatus::Failed, now);
        tx.last_error = Some(e.to_string());
        tx.next_attempt_at = None;
        self.persist(tx).await;

        self.metrics.failed.inc();
        error!(tx_id = %tx.id, batch_id = ?tx.batch_id, error = %e, "Transaction failed");
        self.events
            .emit(LifecycleEvent::transaction(EventKind::Failed, tx, now));
        MemberOutcome::Failed
    }

    async fn persist(&self, tx: &Transaction) {
        if let Err(e) = self.repository.update_transaction(tx).await {
            error!(
                tx_id = %tx.id,
                status = %tx.status,
                error = %e,
                "Failed to persist transaction"
            );
        }
    }

    async fn persist_batch(&self, batch: &TransactionBatch) {
        if let Err(e) = self.repository.update_batch(batch).await {
            warn!(batch_id = %batch.id, error = %e, "Failed to persist batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RetryConfig,
        fees::{FeeOptimizer, FeePolicy},
        ledger::{MockLedgerClient, MockOutcome},
        queue::PriorityQueue,
        repository::MemoryRepository,
        types::{BatchStatus, Priority, TransactionRequest},
    };
    use rust_decimal::Decimal;
    use uuid::Uuid;

    const ALICE: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
    const BOB: &str = "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";
    const CAROL: &str = "rDsbeomae4FXwgQTJp9Rs64Qg9vDiTCdBv";

    struct Fixture {
        ledger: Arc<MockLedgerClient>,
        repository: Arc<MemoryRepository>,
        queue: Arc<PriorityQueue>,
        submitter: Submitter,
    }

    fn fixture(ledger: MockLedgerClient, config: SubmitterConfig) -> Fixture {
        let ledger = Arc::new(ledger);
        let repository = Arc::new(MemoryRepository::new());
        let queue = Arc::new(PriorityQueue::new());
        let metrics = Metrics::new().unwrap();
        let retry = Arc::new(RetryManager::new(
            RetryConfig {
                default_max_retries: 1,
                initial_delay_ms: 10,
                max_delay_ms: 100,
                backoff_multiplier: 2.0,
            },
            repository.clone(),
            queue.clone(),
            EventSink::default(),
            metrics.clone(),
        ));
        let submitter = Submitter::new(
            config,
            ledger.clone(),
            repository.clone(),
            retry,
            EventSink::default(),
            metrics,
        );
        Fixture {
            ledger,
            repository,
            queue,
            submitter,
        }
    }

    fn fast_config() -> SubmitterConfig {
        SubmitterConfig {
            max_concurrent_batches: 1,
            submit_timeout_ms: 200,
            confirmation_poll_interval_ms: 5,
            confirmation_attempts: 3,
        }
    }

    async fn formed(f: &Fixture, destinations: &[&str], max_retries: u32) -> FormedBatch {
        let now = Utc::now();
        let mut members = Vec::new();
        for to in destinations {
            let request = TransactionRequest::payment(
                Uuid::new_v4(),
                Uuid::new_v4(),
                ALICE,
                *to,
                Decimal::ONE,
                "XRP",
            )
            .with_max_retries(max_retries);
            members.push(Transaction::new(request, 3, now).unwrap());
        }

        let types: Vec<_> = members.iter().map(|tx| tx.tx_type).collect();
        let fees = FeeOptimizer::new(FeePolicy::default()).optimize(&types);
        let batch = TransactionBatch::new(
            members[0].batch_key(),
            Priority::Normal,
            members.iter().map(|tx| tx.id).collect(),
            &fees,
            now,
        );
        f.repository.create_batch(&batch).await.unwrap();

        for (tx, fee) in members.iter_mut().zip(&fees.member_fees) {
            tx.status = TransactionStatus::Batched;
            tx.batch_id = Some(batch.id);
            tx.fee_drops = Some(*fee);
            f.repository.create_transaction(tx).await.unwrap();
        }

        FormedBatch { batch, members }
    }

    #[tokio::test]
    async fn test_all_members_confirmed() {
        let f = fixture(MockLedgerClient::new().with_confirm_after_polls(1), fast_config());
        let formed = formed(&f, &[BOB, CAROL], 3).await;
        let ids: Vec<Uuid> = formed.members.iter().map(|tx| tx.id).collect();

        let batch = f.submitter.submit_batch(formed).await;
        assert_eq!(batch.status, BatchStatus::Confirmed);
        assert_eq!(batch.success_count, 2);
        assert!(batch.processed_at.is_some());
        assert!(batch.completed_at.is_some());

        for id in ids {
            let tx = f.repository.get_transaction(id).await.unwrap().unwrap();
            assert_eq!(tx.status, TransactionStatus::Confirmed);
            assert!(tx.ledger_hash.is_some());
            assert!(tx.processed_at.unwrap() <= tx.confirmed_at.unwrap());
        }

        // Batch order preserved
        let positions: Vec<u32> = f.ledger.submissions().iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_terminal_failure_does_not_stop_batch() {
        let f = fixture(MockLedgerClient::new(), fast_config());
        f.ledger.script(
            BOB,
            [MockOutcome::Fail(LedgerError::InvalidDestination("tecNO_DST".into()))],
        );
        let formed = formed(&f, &[BOB, CAROL], 3).await;
        let failed_id = formed.members[0].id;

        let batch = f.submitter.submit_batch(formed).await;
        assert_eq!(batch.status, BatchStatus::PartiallyFailed);
        assert_eq!(batch.success_count + batch.failure_count, batch.transaction_count);

        let failed = f.repository.get_transaction(failed_id).await.unwrap().unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        assert_eq!(failed.batch_id, Some(batch.id));
        assert!(failed.last_error.unwrap().contains("tecNO_DST"));

        let stored = f.repository.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn test_recoverable_failure_requeues() {
        let f = fixture(MockLedgerClient::new(), fast_config());
        f.ledger
            .script(BOB, [MockOutcome::Fail(LedgerError::Network("reset".into()))]);
        let formed = formed(&f, &[BOB], 2).await;
        let id = formed.members[0].id;

        let batch = f.submitter.submit_batch(formed).await;
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.failure_count, 1);

        let tx = f.repository.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Queued);
        assert_eq!(tx.retry_count, 1);
        assert!(tx.batch_id.is_none());
        assert!(f.queue.contains(&id));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let f = fixture(MockLedgerClient::new(), fast_config());
        f.ledger
            .script(BOB, [MockOutcome::Fail(LedgerError::Network("reset".into()))]);
        let formed = formed(&f, &[BOB], 0).await;
        let id = formed.members[0].id;

        f.submitter.submit_batch(formed).await;

        let tx = f.repository.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.retry_count, 0);
        assert!(!f.queue.contains(&id));
    }

    #[tokio::test]
    async fn test_submit_timeout_is_recoverable() {
        let mut config = fast_config();
        config.submit_timeout_ms = 20;
        let f = fixture(MockLedgerClient::new(), config);
        f.ledger.script(BOB, [MockOutcome::Hang]);
        let formed = formed(&f, &[BOB], 2).await;
        let id = formed.members[0].id;

        f.submitter.submit_batch(formed).await;

        let tx = f.repository.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Queued);
        assert!(tx.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unvalidated_submission_keeps_ledger_hash() {
        let f = fixture(MockLedgerClient::new(), fast_config());
        f.ledger.script(BOB, [MockOutcome::NeverValidate]);
        let formed = formed(&f, &[BOB], 2).await;
        let id = formed.members[0].id;

        f.submitter.submit_batch(formed).await;

        let tx = f.repository.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Queued);
        assert_eq!(tx.retry_count, 1);
        assert!(tx.ledger_hash.is_some());
        assert!(tx.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_late_validation_is_not_resubmitted() {
        // Validates on the fifth poll; each attempt polls three times
        let f = fixture(MockLedgerClient::new().with_confirm_after_polls(4), fast_config());
        let formed = formed(&f, &[BOB], 2).await;
        let batch = formed.batch.clone();
        let mut tx = formed.members[0].clone();

        assert_eq!(
            f.submitter.submit_member(&batch, 0, &mut tx).await,
            MemberOutcome::Requeued
        );
        let first_hash = tx.ledger_hash.clone().unwrap();

        // Formed again into a later batch
        tx.status = TransactionStatus::Batched;
        tx.batch_id = Some(batch.id);
        assert_eq!(
            f.submitter.submit_member(&batch, 0, &mut tx).await,
            MemberOutcome::Confirmed
        );

        assert_eq!(f.ledger.submissions().len(), 1);
        assert_eq!(tx.ledger_hash.as_deref(), Some(first_hash.as_str()));
        assert_eq!(tx.status, TransactionStatus::Confirmed);
        assert!(tx.processed_at.unwrap() <= tx.confirmed_at.unwrap());
    }

    #[tokio::test]
    async fn test_unresolved_hash_is_never_resubmitted() {
        let f = fixture(MockLedgerClient::new(), fast_config());
        f.ledger.script(BOB, [MockOutcome::NeverValidate]);
        let formed = formed(&f, &[BOB], 1).await;
        let batch = formed.batch.clone();
        let mut tx = formed.members[0].clone();

        assert_eq!(
            f.submitter.submit_member(&batch, 0, &mut tx).await,
            MemberOutcome::Requeued
        );
        assert_eq!(f.ledger.submissions().len(), 1);

        // Still unresolved: the retry budget runs out without a second submit
        tx.status = TransactionStatus::Batched;
        tx.batch_id = Some(batch.id);
        assert_eq!(
            f.submitter.submit_member(&batch, 0, &mut tx).await,
            MemberOutcome::Failed
        );
        assert_eq!(f.ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_reported_during_polling_requeues_without_hash() {
        let f = fixture(MockLedgerClient::new(), fast_config());
        f.ledger.script(BOB, [MockOutcome::Drop]);
        let formed = formed(&f, &[BOB], 2).await;
        let batch = formed.batch.clone();
        let mut tx = formed.members[0].clone();

        assert_eq!(
            f.submitter.submit_member(&batch, 0, &mut tx).await,
            MemberOutcome::Requeued
        );
        assert!(tx.ledger_hash.is_none());
        assert!(tx.processed_at.is_none());

        tx.status = TransactionStatus::Batched;
        tx.batch_id = Some(batch.id);
        assert_eq!(
            f.submitter.submit_member(&batch, 0, &mut tx).await,
            MemberOutcome::Confirmed
        );
        assert_eq!(f.ledger.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_on_validation_is_terminal() {
        let f = fixture(MockLedgerClient::new(), fast_config());
        f.ledger
            .script(BOB, [MockOutcome::RejectOnValidation("tecPATH_DRY".into())]);
        let formed = formed(&f, &[BOB], 2).await;
        let id = formed.members[0].id;

        let batch = f.submitter.submit_batch(formed).await;
        assert_eq!(batch.status, BatchStatus::Failed);

        let tx = f.repository.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.retry_count, 0);
    }
}
