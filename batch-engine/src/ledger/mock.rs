use super::{ConfirmationStatus, LedgerClient, LedgerError, SubmitReceipt, SubmitRequest};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Scripted result for the next submission to a destination
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Accept and validate normally
    Accept,
    /// Fail the submit call
    Fail(LedgerError),
    /// Never answer the submit call
    Hang,
    /// Accept, then reject during validation
    RejectOnValidation(String),
    /// Accept but never validate
    NeverValidate,
    /// Accept, then drop without validating
    Drop,
}

#[derive(Debug, Clone)]
struct MockSubmission {
    polls: u32,
    outcome: SubmissionOutcome,
}

#[derive(Debug, Clone)]
enum SubmissionOutcome {
    Validate,
    Reject(String),
    Drop,
    Never,
}

/// Submit calls remembered by default
pub const DEFAULT_LOG_CAPACITY: usize = 1_024;

/// In-process ledger simulator
///
/// Outcomes can be scripted per destination address; unscripted submissions
/// succeed with probability `success_rate`. A submission is forgotten once
/// its final status has been reported, and only the most recent
/// `log_capacity` submit calls are kept.
#[derive(Debug)]
pub struct MockLedgerClient {
    latency_ms: u64,
    success_rate: f64,
    confirm_after_polls: u32,
    scripts: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    submissions: Mutex<HashMap<String, MockSubmission>>,
    log: Mutex<VecDeque<SubmitRequest>>,
    log_capacity: usize,
    ledger_index: AtomicU64,
}

impl Default for MockLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedgerClient {
    /// Instant, always-succeeding ledger
    pub fn new() -> Self {
        Self {
            latency_ms: 0,
            success_rate: 1.0,
            confirm_after_polls: 0,
            scripts: Mutex::new(HashMap::new()),
            submissions: Mutex::new(HashMap::new()),
            log: Mutex::new(VecDeque::new()),
            log_capacity: DEFAULT_LOG_CAPACITY,
            ledger_index: AtomicU64::new(80_000_000),
        }
    }

    /// Simulated network latency per call
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Probability (0.0 - 1.0) that an unscripted submission is accepted
    pub fn with_success_rate(mut self, success_rate: f64) -> Self {
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self
    }

    /// Confirmation polls answered with Pending before validating
    pub fn with_confirm_after_polls(mut self, polls: u32) -> Self {
        self.confirm_after_polls = polls;
        self
    }

    /// Submit calls remembered by [`submissions`](Self::submissions); 0 disables the log
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Queue outcomes for submissions to `destination`, consumed in order
    pub fn script(&self, destination: &str, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.scripts
            .lock()
            .entry(destination.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Most recent submit calls, in arrival order
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.log.lock().iter().cloned().collect()
    }

    /// Accepted submissions whose final status has not been reported yet
    pub fn outstanding(&self) -> usize {
        self.submissions.lock().len()
    }

    fn record(&self, request: &SubmitRequest) {
        if self.log_capacity == 0 {
            return;
        }
        let mut log = self.log.lock();
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(request.clone());
    }

    fn next_outcome(&self, destination: &str) -> MockOutcome {
        let scripted = self
            .scripts
            .lock()
            .get_mut(destination)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(outcome) => outcome,
            None if rand::thread_rng().gen::<f64>() < self.success_rate => MockOutcome::Accept,
            None => MockOutcome::Fail(LedgerError::Network(
                "simulated connection reset".to_string(),
            )),
        }
    }

    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
    }

    fn hash(request: &SubmitRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.transaction_id.as_bytes());
        hasher.update(request.batch_id.as_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitReceipt, LedgerError> {
        self.record(request);
        self.simulate_latency().await;

        let outcome = match self.next_outcome(request.to.as_str()) {
            MockOutcome::Accept => SubmissionOutcome::Validate,
            MockOutcome::RejectOnValidation(code) => SubmissionOutcome::Reject(code),
            MockOutcome::NeverValidate => SubmissionOutcome::Never,
            MockOutcome::Drop => SubmissionOutcome::Drop,
            MockOutcome::Fail(error) => {
                warn!(tx_id = %request.transaction_id, %error, "Mock ledger: simulated failure");
                return Err(error);
            }
            MockOutcome::Hang => return std::future::pending().await,
        };

        let tx_hash = Self::hash(request);
        debug!(tx_id = %request.transaction_id, %tx_hash, "Mock ledger: accepted");

        self.submissions.lock().insert(
            tx_hash.clone(),
            MockSubmission { polls: 0, outcome },
        );

        Ok(SubmitReceipt {
            tx_hash,
            submitted_at: Utc::now(),
        })
    }

    async fn confirmation(&self, tx_hash: &str) -> Result<ConfirmationStatus, LedgerError> {
        self.simulate_latency().await;

        let mut submissions = self.submissions.lock();
        let submission = submissions
            .get_mut(tx_hash)
            .ok_or_else(|| LedgerError::Rejected {
                code: "txnNotFound".to_string(),
                message: format!("unknown transaction {}", tx_hash),
            })?;

        if submission.polls < self.confirm_after_polls {
            submission.polls += 1;
            return Ok(ConfirmationStatus::Pending);
        }

        let status = match &submission.outcome {
            SubmissionOutcome::Never => return Ok(ConfirmationStatus::Pending),
            SubmissionOutcome::Validate => ConfirmationStatus::Validated {
                ledger_index: self.ledger_index.fetch_add(1, Ordering::Relaxed),
            },
            SubmissionOutcome::Reject(code) => ConfirmationStatus::Rejected {
                code: code.clone(),
                message: "rejected during validation".to_string(),
            },
            SubmissionOutcome::Drop => ConfirmationStatus::Dropped,
        };

        // Final status reported
        submissions.remove(tx_hash);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Currency, TransactionType};
    use rust_decimal::Decimal;

    const ALICE: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
    const BOB: &str = "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";

    fn request() -> SubmitRequest {
        SubmitRequest {
            transaction_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            position: 0,
            tx_type: TransactionType::Payment,
            from: Address::parse(ALICE).unwrap(),
            to: Address::parse(BOB).unwrap(),
            amount: Decimal::new(5, 0),
            currency: Currency::native(),
            destination_tag: None,
            memo: None,
            fee_drops: 10,
        }
    }

    #[tokio::test]
    async fn test_accept_and_validate() {
        let ledger = MockLedgerClient::new().with_confirm_after_polls(1);
        let receipt = ledger.submit(&request()).await.unwrap();
        assert_eq!(receipt.tx_hash.len(), 64);

        assert_eq!(
            ledger.confirmation(&receipt.tx_hash).await.unwrap(),
            ConfirmationStatus::Pending
        );
        assert!(matches!(
            ledger.confirmation(&receipt.tx_hash).await.unwrap(),
            ConfirmationStatus::Validated { .. }
        ));
    }

    #[tokio::test]
    async fn test_scripted_outcomes_consumed_in_order() {
        let ledger = MockLedgerClient::new();
        ledger.script(
            BOB,
            [
                MockOutcome::Fail(LedgerError::InsufficientFunds("tecUNFUNDED".into())),
                MockOutcome::RejectOnValidation("tecNO_DST".into()),
            ],
        );

        assert_eq!(
            ledger.submit(&request()).await,
            Err(LedgerError::InsufficientFunds("tecUNFUNDED".into()))
        );

        let receipt = ledger.submit(&request()).await.unwrap();
        assert!(matches!(
            ledger.confirmation(&receipt.tx_hash).await.unwrap(),
            ConfirmationStatus::Rejected { .. }
        ));

        // Script exhausted
        assert!(ledger.submit(&request()).await.is_ok());
        assert_eq!(ledger.submissions().len(), 3);
    }

    #[tokio::test]
    async fn test_settled_submissions_are_forgotten() {
        let ledger = MockLedgerClient::new();
        ledger.script(BOB, [MockOutcome::Drop, MockOutcome::NeverValidate]);

        let dropped = ledger.submit(&request()).await.unwrap();
        let pending = ledger.submit(&request()).await.unwrap();
        let validated = ledger.submit(&request()).await.unwrap();
        assert_eq!(ledger.outstanding(), 3);

        assert_eq!(
            ledger.confirmation(&dropped.tx_hash).await.unwrap(),
            ConfirmationStatus::Dropped
        );
        assert_eq!(
            ledger.confirmation(&pending.tx_hash).await.unwrap(),
            ConfirmationStatus::Pending
        );
        assert!(matches!(
            ledger.confirmation(&validated.tx_hash).await.unwrap(),
            ConfirmationStatus::Validated { .. }
        ));

        // Only the never-validating submission is still tracked
        assert_eq!(ledger.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_submission_log_is_bounded() {
        let ledger = MockLedgerClient::new().with_log_capacity(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let request = request();
            ids.push(request.transaction_id);
            ledger.submit(&request).await.unwrap();
        }

        let logged: Vec<Uuid> = ledger
            .submissions()
            .iter()
            .map(|s| s.transaction_id)
            .collect();
        assert_eq!(logged, ids[1..].to_vec());

        let silent = MockLedgerClient::new().with_log_capacity(0);
        silent.submit(&request()).await.unwrap();
        assert!(silent.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_zero_success_rate() {
        let ledger = MockLedgerClient::new().with_success_rate(0.0);
        assert!(matches!(
            ledger.submit(&request()).await,
            Err(LedgerError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_hash() {
        let ledger = MockLedgerClient::new();
        assert!(ledger.confirmation("DEADBEEF").await.is_err());
    }
}
