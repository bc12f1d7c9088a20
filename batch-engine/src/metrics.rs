//! Metrics collection for observability
//!
//! Each engine owns its registry so several engines can live in one process.
//!
//! # Metrics
//!
//! - `batch_engine_transactions_enqueued_total` - Transactions accepted
//! - `batch_engine_batches_formed_total` - Batches formed
//! - `batch_engine_transactions_confirmed_total` - Transactions validated
//! - `batch_engine_transactions_failed_total` - Terminal failures
//! - `batch_engine_transactions_retried_total` - Requeues after recoverable failures
//! - `batch_engine_transactions_expired_total` - Expirations
//! - `batch_engine_fee_savings_drops_total` - Fee savings from batching
//! - `batch_engine_batch_size` - Histogram of batch sizes
//! - `batch_engine_submission_duration_seconds` - Histogram of ledger submit latencies
//! - `batch_engine_queue_depth` - Transactions waiting in the queue
//! - `batch_engine_backlog` - Un-submitted transactions (pending + queued)
//! - `batch_engine_health` - 0 healthy, 1 degraded, 2 unhealthy

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Transactions accepted
    pub enqueued: IntCounter,

    /// Batches formed
    pub batches_formed: IntCounter,

    /// Transactions validated
    pub confirmed: IntCounter,

    /// Terminal failures
    pub failed: IntCounter,

    /// Requeues
    pub retried: IntCounter,

    /// Expirations
    pub expired: IntCounter,

    /// Fee savings (drops)
    pub fee_savings: IntCounter,

    /// Batch size histogram
    pub batch_size: Histogram,

    /// Submit latency histogram
    pub submission_duration: Histogram,

    /// Queue depth
    pub queue_depth: IntGauge,

    /// Un-submitted backlog
    pub backlog: IntGauge,

    /// Health level
    pub health: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let enqueued = counter(
            "batch_engine_transactions_enqueued_total",
            "Transactions accepted into the queue",
        )?;
        let batches_formed = counter("batch_engine_batches_formed_total", "Batches formed")?;
        let confirmed = counter(
            "batch_engine_transactions_confirmed_total",
            "Transactions validated on the ledger",
        )?;
        let failed = counter(
            "batch_engine_transactions_failed_total",
            "Transactions permanently failed",
        )?;
        let retried = counter(
            "batch_engine_transactions_retried_total",
            "Transactions requeued after a recoverable failure",
        )?;
        let expired = counter(
            "batch_engine_transactions_expired_total",
            "Transactions expired before submission",
        )?;
        let fee_savings = counter(
            "batch_engine_fee_savings_drops_total",
            "Fee savings from batching in drops",
        )?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("batch_engine_batch_size", "Histogram of batch sizes")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        let submission_duration = Histogram::with_opts(
            HistogramOpts::new(
                "batch_engine_submission_duration_seconds",
                "Histogram of ledger submit latencies",
            )
            .buckets(vec![0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(submission_duration.clone()))?;

        let queue_depth = gauge("batch_engine_queue_depth", "Transactions waiting in the queue")?;
        let backlog = gauge("batch_engine_backlog", "Un-submitted transactions")?;
        let health = gauge(
            "batch_engine_health",
            "Health level: 0 healthy, 1 degraded, 2 unhealthy",
        )?;

        Ok(Self {
            enqueued,
            batches_formed,
            confirmed,
            failed,
            retried,
            expired,
            fee_savings,
            batch_size,
            submission_duration,
            queue_depth,
            backlog,
            health,
            registry,
        })
    }

    /// Render the registry in Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
