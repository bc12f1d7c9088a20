//! Core types for the transaction queue
//!
//! All types are designed for:
//! - Deterministic serialization (bincode and JSON repositories store them verbatim)
//! - Exact arithmetic (Decimal for amounts, integer drops for fees)
//! - Explicit lifecycle state (no implicit transitions outside the engine)

use crate::{fees::FeeBreakdown, Error, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Alphabet of the ledger's base58 account encoding
const ACCOUNT_ALPHABET: &str = "rpshnaf39wBUDNEGHJKLM4PQRST7VWXYZ2bcdeCg65jkm8oFqi1tuvAxyz";

/// Native currency code
pub const NATIVE_CURRENCY: &str = "XRP";

/// Classic ledger account address (`r...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    /// Parse and validate a classic address
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();

        if !(25..=35).contains(&raw.len()) {
            return Err(Error::Validation(format!(
                "address '{}' must be 25-35 characters",
                raw
            )));
        }

        if !raw.starts_with('r') {
            return Err(Error::Validation(format!(
                "address '{}' must start with 'r'",
                raw
            )));
        }

        if let Some(bad) = raw.chars().find(|c| !ACCOUNT_ALPHABET.contains(*c)) {
            return Err(Error::Validation(format!(
                "address '{}' contains invalid character '{}'",
                raw, bad
            )));
        }

        Ok(Self(raw.to_string()))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currency code: native `XRP`, a 3-character issued code or a 40-hex code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Native currency
    pub fn native() -> Self {
        Self(NATIVE_CURRENCY.to_string())
    }

    /// Parse and validate a currency code
    pub fn parse(raw: &str) -> Result<Self> {
        let code = raw.trim();

        let standard = code.len() == 3 && code.chars().all(|c| c.is_ascii_alphanumeric());
        let hex = code.len() == 40 && code.chars().all(|c| c.is_ascii_hexdigit());

        if standard {
            Ok(Self(code.to_ascii_uppercase()))
        } else if hex {
            Ok(Self(code.to_ascii_uppercase()))
        } else {
            Err(Error::Validation(format!("invalid currency code '{}'", raw)))
        }
    }

    /// Whether this is the ledger's native currency
    pub fn is_native(&self) -> bool {
        self.0 == NATIVE_CURRENCY
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ledger transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Value transfer
    Payment,
    /// Lock funds in escrow
    EscrowCreate,
    /// Release escrowed funds
    EscrowFinish,
    /// Return escrowed funds
    EscrowCancel,
    /// Create or modify a trust line
    TrustSet,
}

impl TransactionType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Payment => "payment",
            TransactionType::EscrowCreate => "escrow_create",
            TransactionType::EscrowFinish => "escrow_finish",
            TransactionType::EscrowCancel => "escrow_cancel",
            TransactionType::TrustSet => "trust_set",
        }
    }

    /// Whether the transaction moves value to the destination
    pub fn moves_value(&self) -> bool {
        matches!(
            self,
            TransactionType::Payment | TransactionType::EscrowCreate
        )
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue priority tier. Declaration order gives `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Best effort
    Low,
    /// Default tier
    Normal,
    /// Ahead of normal traffic
    High,
    /// Always first
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransactionStatus {
    /// Persisted, not yet visible to the batch former
    Pending = 1,
    /// Waiting in the priority queue
    Queued = 2,
    /// Claimed into a batch
    Batched = 3,
    /// Accepted by the ledger, awaiting validation
    Processing = 4,
    /// Validated on the ledger
    Confirmed = 5,
    /// Permanently failed
    Failed = 6,
    /// Expired before submission
    Expired = 7,
    /// Withdrawn before batching
    Cancelled = 8,
}

impl TransactionStatus {
    /// Every status, in lifecycle order
    pub const ALL: [TransactionStatus; 8] = [
        TransactionStatus::Pending,
        TransactionStatus::Queued,
        TransactionStatus::Batched,
        TransactionStatus::Processing,
        TransactionStatus::Confirmed,
        TransactionStatus::Failed,
        TransactionStatus::Expired,
        TransactionStatus::Cancelled,
    ];

    /// No further transitions allowed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed
                | TransactionStatus::Failed
                | TransactionStatus::Expired
                | TransactionStatus::Cancelled
        )
    }

    /// Not yet handed to the submitter
    pub fn is_unsubmitted(&self) -> bool {
        matches!(self, TransactionStatus::Pending | TransactionStatus::Queued)
    }

    /// Stable byte used for storage indices
    pub fn as_byte(&self) -> u8 {
        *self as u8
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Queued => "queued",
            TransactionStatus::Batched => "batched",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Expired => "expired",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Batch lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Formed, not yet submitted
    Pending,
    /// Submission in progress
    Processing,
    /// Every member confirmed
    Confirmed,
    /// Some members confirmed, some did not
    PartiallyFailed,
    /// No member confirmed
    Failed,
}

impl BatchStatus {
    /// All members reached an outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Confirmed | BatchStatus::PartiallyFailed | BatchStatus::Failed
        )
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Confirmed => "confirmed",
            BatchStatus::PartiallyFailed => "partially_failed",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Transactions sharing a key share a fee model and may be batched together
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    /// Ledger transaction type
    pub tx_type: TransactionType,
    /// Currency
    pub currency: Currency,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tx_type, self.currency)
    }
}

/// Request to place a transaction on the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Owning enterprise
    pub enterprise_id: Uuid,
    /// Requesting user
    pub user_id: Uuid,
    /// Ledger transaction type
    pub tx_type: TransactionType,
    /// Queue priority
    #[serde(default)]
    pub priority: Priority,
    /// Source account
    pub from_address: String,
    /// Destination account
    pub to_address: String,
    /// Amount
    pub amount: Decimal,
    /// Currency code
    pub currency: String,
    /// Destination tag
    #[serde(default)]
    pub destination_tag: Option<u32>,
    /// Free-form memo
    #[serde(default)]
    pub memo: Option<String>,
    /// Overrides the engine's default retry budget
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Expire the request this many milliseconds after enqueue
    #[serde(default)]
    pub expires_in_ms: Option<u64>,
}

impl TransactionRequest {
    /// Normal-priority payment with engine defaults
    pub fn payment(
        enterprise_id: Uuid,
        user_id: Uuid,
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            enterprise_id,
            user_id,
            tx_type: TransactionType::Payment,
            priority: Priority::Normal,
            from_address: from_address.into(),
            to_address: to_address.into(),
            amount,
            currency: currency.into(),
            destination_tag: None,
            memo: None,
            max_retries: None,
            expires_in_ms: None,
        }
    }

    /// Set transaction type
    pub fn with_type(mut self, tx_type: TransactionType) -> Self {
        self.tx_type = tx_type;
        self
    }

    /// Set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set expiry relative to enqueue time
    pub fn with_expiry_ms(mut self, expires_in_ms: u64) -> Self {
        self.expires_in_ms = Some(expires_in_ms);
        self
    }

    /// Set destination tag
    pub fn with_destination_tag(mut self, tag: u32) -> Self {
        self.destination_tag = Some(tag);
        self
    }
}

/// A unit of ledger work and its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: Uuid,
    /// Owning enterprise
    pub enterprise_id: Uuid,
    /// Requesting user
    pub user_id: Uuid,
    /// Ledger transaction type
    pub tx_type: TransactionType,
    /// Queue priority
    pub priority: Priority,
    /// Source account
    pub from_address: Address,
    /// Destination account
    pub to_address: Address,
    /// Amount
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Destination tag
    pub destination_tag: Option<u32>,
    /// Memo
    pub memo: Option<String>,

    /// Lifecycle status
    pub status: TransactionStatus,
    /// Batch this transaction belongs to (set once grouped)
    pub batch_id: Option<Uuid>,
    /// Recoverable failures retried so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Fee share assigned by the fee optimizer (drops)
    pub fee_drops: Option<u64>,
    /// Hash assigned by the ledger on acceptance
    pub ledger_hash: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
    /// First time the transaction entered the queue
    pub queued_at: Option<DateTime<Utc>>,
    /// Not eligible for batching before this instant (retry backoff)
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Expiry deadline for un-submitted work
    pub expires_at: Option<DateTime<Utc>>,
    /// Accepted by the ledger
    pub processed_at: Option<DateTime<Utc>>,
    /// Validated on the ledger
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Validate a request and build a Pending transaction
    pub fn new(
        request: TransactionRequest,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let from_address = Address::parse(&request.from_address)
            .map_err(|e| Error::Validation(format!("from_address: {}", e)))?;
        let to_address = Address::parse(&request.to_address)
            .map_err(|e| Error::Validation(format!("to_address: {}", e)))?;
        let currency = Currency::parse(&request.currency)?;

        if request.tx_type.moves_value() && from_address == to_address {
            return Err(Error::Validation(
                "source and destination must differ".to_string(),
            ));
        }

        if request.amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let expires_at = match request.expires_in_ms {
            Some(0) => {
                return Err(Error::Validation(
                    "expiry must be in the future".to_string(),
                ))
            }
            Some(ms) => {
                let deadline = i64::try_from(ms)
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .and_then(|ttl| now.checked_add_signed(ttl));
                match deadline {
                    Some(deadline) => Some(deadline),
                    None => {
                        return Err(Error::Validation(format!(
                            "expiry of {}ms is out of range",
                            ms
                        )))
                    }
                }
            }
            None => None,
        };

        Ok(Self {
            id: Uuid::now_v7(),
            enterprise_id: request.enterprise_id,
            user_id: request.user_id,
            tx_type: request.tx_type,
            priority: request.priority,
            from_address,
            to_address,
            amount: request.amount,
            currency,
            destination_tag: request.destination_tag,
            memo: request.memo,
            status: TransactionStatus::Pending,
            batch_id: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            fee_drops: None,
            ledger_hash: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            next_attempt_at: None,
            expires_at,
            processed_at: None,
            confirmed_at: None,
        })
    }

    /// Compatibility key for batching
    pub fn batch_key(&self) -> BatchKey {
        BatchKey {
            tx_type: self.tx_type,
            currency: self.currency.clone(),
        }
    }

    /// Expiry deadline has passed and the ledger has not accepted the transaction.
    ///
    /// Once a submission carries a ledger hash it may still validate, so it
    /// is no longer eligible for expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ledger_hash.is_none() && self.expires_at.map_or(false, |deadline| deadline <= now)
    }

    /// Retry backoff has elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Retry budget remains
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Time from creation to ledger validation
    pub fn processing_time(&self) -> Option<Duration> {
        self.confirmed_at.map(|confirmed| confirmed - self.created_at)
    }

    /// Apply a status change and stamp `updated_at`
    pub fn transition(&mut self, status: TransactionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// A fee-sharing submission unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionBatch {
    /// Batch ID
    pub id: Uuid,
    /// Highest member priority
    pub priority: Priority,
    /// Compatibility key shared by every member
    pub key: BatchKey,
    /// Batch status
    pub status: BatchStatus,
    /// Members in submission order
    pub transaction_ids: Vec<Uuid>,

    /// Member count
    pub transaction_count: u32,
    /// Members confirmed
    pub success_count: u32,
    /// Members that left the batch without confirming
    pub failure_count: u32,

    /// Sum of standard per-transaction fees (drops)
    pub total_fee: u64,
    /// Fee actually charged (drops)
    pub optimized_fee: u64,
    /// `total_fee - optimized_fee`
    pub fee_savings: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// First submission attempt
    pub processed_at: Option<DateTime<Utc>>,
    /// Every member reached an outcome
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransactionBatch {
    /// Create a batch from claimed members and their computed fees
    pub fn new(
        key: BatchKey,
        priority: Priority,
        transaction_ids: Vec<Uuid>,
        fees: &FeeBreakdown,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            priority,
            key,
            status: BatchStatus::Pending,
            transaction_count: transaction_ids.len() as u32,
            transaction_ids,
            success_count: 0,
            failure_count: 0,
            total_fee: fees.total_fee,
            optimized_fee: fees.optimized_fee,
            fee_savings: fees.fee_savings,
            created_at: now,
            processed_at: None,
            completed_at: None,
        }
    }

    /// Members without an outcome yet
    pub fn outstanding(&self) -> u32 {
        self.transaction_count
            .saturating_sub(self.success_count + self.failure_count)
    }

    /// Record a confirmed member
    pub fn record_success(&mut self) {
        if self.outstanding() > 0 {
            self.success_count += 1;
        }
    }

    /// Record a member that failed, was requeued or expired
    pub fn record_failure(&mut self) {
        if self.outstanding() > 0 {
            self.failure_count += 1;
        }
    }

    /// Mark submission started (first attempt only)
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        if self.completed_at.is_none() {
            self.status = BatchStatus::Processing;
            self.processed_at.get_or_insert(now);
        }
    }

    /// Finalize once every member has an outcome. Returns true on the completing call.
    pub fn try_complete(&mut self, now: DateTime<Utc>) -> bool {
        if self.completed_at.is_some() || self.outstanding() > 0 {
            return false;
        }

        self.status = if self.failure_count == 0 {
            BatchStatus::Confirmed
        } else if self.success_count == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyFailed
        };
        self.completed_at = Some(now);
        true
    }
}

/// Aggregate transaction statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionStats {
    /// Transactions ever persisted
    pub total_transactions: u64,
    /// Count per status
    pub by_status: BTreeMap<TransactionStatus, u64>,
    /// Mean created → confirmed time over confirmed transactions (ms)
    pub average_processing_time_ms: f64,
    /// Batches ever formed
    pub total_batches: u64,
    /// Fees paid across batches (drops)
    pub total_fees_drops: u64,
    /// Fee savings across batches (drops)
    pub total_savings_drops: u64,
}

impl TransactionStats {
    /// Fold stored records into aggregate statistics
    pub fn from_records<'a>(
        transactions: impl IntoIterator<Item = &'a Transaction>,
        batches: impl IntoIterator<Item = &'a TransactionBatch>,
    ) -> Self {
        let mut stats = TransactionStats::default();
        let mut processing_ms_total = 0i64;
        let mut confirmed = 0i64;

        for tx in transactions {
            stats.total_transactions += 1;
            *stats.by_status.entry(tx.status).or_insert(0) += 1;

            if let Some(elapsed) = tx.processing_time() {
                processing_ms_total += elapsed.num_milliseconds().max(0);
                confirmed += 1;
            }
        }

        for batch in batches {
            stats.total_batches += 1;
            stats.total_fees_drops = stats.total_fees_drops.saturating_add(batch.optimized_fee);
            stats.total_savings_drops = stats.total_savings_drops.saturating_add(batch.fee_savings);
        }

        if confirmed > 0 {
            stats.average_processing_time_ms = processing_ms_total as f64 / confirmed as f64;
        }

        stats
    }

    /// Count for a single status
    pub fn count(&self, status: TransactionStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}
