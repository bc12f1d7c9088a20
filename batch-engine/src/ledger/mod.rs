//! Ledger client capability
//!
//! The engine never talks to a ledger directly. Submission goes through the
//! [`LedgerClient`] trait so that a network client, a test double or a
//! simulator can be plugged in.

pub mod mock;

pub use mock::{MockLedgerClient, MockOutcome};

use crate::types::{Address, Currency, TransactionType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Ledger submission errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    /// Connection or transport failure
    #[error("network error: {0}")]
    Network(String),

    /// No answer within the configured timeout
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Account sequence already used or not yet valid
    #[error("sequence conflict: {0}")]
    SequenceConflict(String),

    /// Destination account does not exist or refuses the payment
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Source account cannot cover amount plus fee
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// An accepted submission left the ledger without validating
    #[error("submission {0} dropped without validation")]
    Dropped(String),

    /// Ledger refused the transaction
    #[error("rejected ({code}): {message}")]
    Rejected {
        /// Ledger result code
        code: String,
        /// Human readable reason
        message: String,
    },
}

impl LedgerError {
    /// Whether another attempt may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LedgerError::Network(_)
                | LedgerError::Timeout(_)
                | LedgerError::SequenceConflict(_)
                | LedgerError::Dropped(_)
        )
    }
}

/// One member submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Transaction ID
    pub transaction_id: Uuid,
    /// Batch the transaction is submitted with
    pub batch_id: Uuid,
    /// Position inside the batch
    pub position: u32,
    /// Ledger transaction type
    pub tx_type: TransactionType,
    /// Source account
    pub from: Address,
    /// Destination account
    pub to: Address,
    /// Amount
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Destination tag
    pub destination_tag: Option<u32>,
    /// Memo
    pub memo: Option<String>,
    /// Fee share in drops
    pub fee_drops: u64,
}

/// Receipt returned when the ledger accepts a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Ledger transaction hash
    pub tx_hash: String,
    /// Acceptance time
    pub submitted_at: DateTime<Utc>,
}

/// Validation state of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    /// Not yet in a validated ledger
    Pending,
    /// Included in a validated ledger
    Validated {
        /// Ledger sequence that included the transaction
        ledger_index: u64,
    },
    /// Past its last valid ledger without validating; safe to submit again
    Dropped,
    /// Will never validate
    Rejected {
        /// Ledger result code
        code: String,
        /// Human readable reason
        message: String,
    },
}

/// External ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a signed member transaction
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitReceipt, LedgerError>;

    /// Query validation state of an accepted submission
    async fn confirmation(&self, tx_hash: &str) -> Result<ConfirmationStatus, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(LedgerError::Network("reset".into()).is_recoverable());
        assert!(LedgerError::Timeout(500).is_recoverable());
        assert!(LedgerError::SequenceConflict("tefPAST_SEQ".into()).is_recoverable());
        assert!(LedgerError::Dropped("A1B2".into()).is_recoverable());

        assert!(!LedgerError::InvalidDestination("tecNO_DST".into()).is_recoverable());
        assert!(!LedgerError::InsufficientFunds("tecUNFUNDED".into()).is_recoverable());
        assert!(!LedgerError::Rejected {
            code: "temMALFORMED".into(),
            message: "bad".into()
        }
        .is_recoverable());
    }
}
