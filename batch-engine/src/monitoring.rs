//! Queue monitoring and health assessment
//!
//! Read-only: sampling never mutates transactions or batches.

use crate::{
    config::MonitoringConfig,
    metrics::Metrics,
    queue::PriorityQueue,
    repository::TransactionRepository,
    types::TransactionStatus,
    Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Overall health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Within thresholds
    Healthy,
    /// Degraded threshold crossed
    Degraded,
    /// Unhealthy threshold crossed
    Unhealthy,
}

impl HealthStatus {
    /// Gauge level
    pub fn level(&self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// Point-in-time queue metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Pending transactions
    pub pending_count: u64,
    /// Queued transactions
    pub queued_count: u64,
    /// Batched or processing transactions
    pub processing_count: u64,
    /// Confirmed transactions
    pub completed_count: u64,
    /// Failed transactions
    pub failed_count: u64,
    /// Expired transactions
    pub expired_count: u64,
    /// Entries in the in-memory queue
    pub queue_depth: u64,
    /// Mean created → confirmed time (ms)
    pub average_processing_time_ms: f64,
    /// Fees paid (drops)
    pub total_fees_drops: u64,
    /// Fees saved by batching (drops)
    pub total_savings_drops: u64,
    /// Sample time
    pub last_updated: DateTime<Utc>,
}

/// Health assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Worst status across checks
    pub overall_status: HealthStatus,
    /// Un-submitted transactions (pending + queued)
    pub backlog: u64,
    /// failed / (confirmed + failed)
    pub failure_rate: f64,
    /// Human readable findings
    pub issues: Vec<String>,
    /// Assessment time
    pub checked_at: DateTime<Utc>,
}

/// Dashboard snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardData {
    /// Queue metrics
    pub metrics: QueueMetrics,
    /// Count per status
    pub status_distribution: BTreeMap<TransactionStatus, u64>,
    /// Health
    pub system_health: SystemHealth,
}

/// Classify health from backlog and failure rate
pub fn assess_health(
    backlog: u64,
    failure_rate: f64,
    config: &MonitoringConfig,
    now: DateTime<Utc>,
) -> SystemHealth {
    let mut overall_status = HealthStatus::Healthy;
    let mut issues = Vec::new();

    if backlog >= config.backlog_unhealthy {
        overall_status = overall_status.max(HealthStatus::Unhealthy);
        issues.push(format!(
            "Backlog of {} transactions exceeds {}",
            backlog, config.backlog_unhealthy
        ));
    } else if backlog >= config.backlog_degraded {
        overall_status = overall_status.max(HealthStatus::Degraded);
        issues.push(format!(
            "Backlog of {} transactions exceeds {}",
            backlog, config.backlog_degraded
        ));
    }

    if failure_rate >= config.failure_rate_unhealthy {
        overall_status = overall_status.max(HealthStatus::Unhealthy);
        issues.push(format!(
            "Failure rate {:.1}% exceeds {:.1}%",
            failure_rate * 100.0,
            config.failure_rate_unhealthy * 100.0
        ));
    } else if failure_rate >= config.failure_rate_degraded {
        overall_status = overall_status.max(HealthStatus::Degraded);
        issues.push(format!(
            "Failure rate {:.1}% exceeds {:.1}%",
            failure_rate * 100.0,
            config.failure_rate_degraded * 100.0
        ));
    }

    SystemHealth {
        overall_status,
        backlog,
        failure_rate,
        issues,
        checked_at: now,
    }
}

/// Samples repository state into dashboard snapshots
pub struct MonitoringService {
    config: MonitoringConfig,
    repository: Arc<dyn TransactionRepository>,
    queue: Arc<PriorityQueue>,
    metrics: Metrics,
    latest: RwLock<Option<DashboardData>>,
}

impl std::fmt::Debug for MonitoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MonitoringService {
    /// Create monitoring service
    pub fn new(
        config: MonitoringConfig,
        repository: Arc<dyn TransactionRepository>,
        queue: Arc<PriorityQueue>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            repository,
            queue,
            metrics,
            latest: RwLock::new(None),
        }
    }

    /// Take a fresh sample and store it as the latest snapshot
    pub async fn sample(&self, now: DateTime<Utc>) -> Result<DashboardData> {
        let mut status_distribution = BTreeMap::new();
        for status in TransactionStatus::ALL {
            let count = self.repository.count_by_status(status).await?;
            status_distribution.insert(status, count);
        }
        let stats = self.repository.transaction_stats().await?;

        let count = |status: TransactionStatus| {
            status_distribution.get(&status).copied().unwrap_or(0)
        };
        let confirmed = count(TransactionStatus::Confirmed);
        let failed = count(TransactionStatus::Failed);
        let backlog = count(TransactionStatus::Pending) + count(TransactionStatus::Queued);

        let failure_rate = if confirmed + failed == 0 {
            0.0
        } else {
            failed as f64 / (confirmed + failed) as f64
        };

        let metrics = QueueMetrics {
            pending_count: count(TransactionStatus::Pending),
            queued_count: count(TransactionStatus::Queued),
            processing_count: count(TransactionStatus::Batched)
                + count(TransactionStatus::Processing),
            completed_count: confirmed,
            failed_count: failed,
            expired_count: count(TransactionStatus::Expired),
            queue_depth: self.queue.len() as u64,
            average_processing_time_ms: stats.average_processing_time_ms,
            total_fees_drops: stats.total_fees_drops,
            total_savings_drops: stats.total_savings_drops,
            last_updated: now,
        };

        let system_health = assess_health(backlog, failure_rate, &self.config, now);

        self.metrics.queue_depth.set(metrics.queue_depth as i64);
        self.metrics.backlog.set(backlog as i64);
        self.metrics.health.set(system_health.overall_status.level());

        if system_health.overall_status == HealthStatus::Healthy {
            debug!(backlog, failure_rate, "Queue healthy");
        } else {
            warn!(
                status = ?system_health.overall_status,
                issues = ?system_health.issues,
                "Queue health degraded"
            );
        }

        let dashboard = DashboardData {
            metrics,
            status_distribution,
            system_health,
        };
        *self.latest.write() = Some(dashboard.clone());
        Ok(dashboard)
    }

    /// Most recent snapshot
    pub fn latest(&self) -> Option<DashboardData> {
        self.latest.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        repository::MemoryRepository,
        types::{Transaction, TransactionRequest},
    };
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn transaction(status: TransactionStatus) -> Transaction {
        let request = TransactionRequest::payment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
            "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
            Decimal::ONE,
            "XRP",
        );
        let mut tx = Transaction::new(request, 3, Utc::now()).unwrap();
        tx.status = status;
        tx
    }

    #[test]
    fn test_assess_health_thresholds() {
        let config = MonitoringConfig::default();
        let now = Utc::now();

        let healthy = assess_health(10, 0.0, &config, now);
        assert_eq!(healthy.overall_status, HealthStatus::Healthy);
        assert!(healthy.issues.is_empty());

        let degraded = assess_health(1_500, 0.01, &config, now);
        assert_eq!(degraded.overall_status, HealthStatus::Degraded);
        assert_eq!(degraded.issues.len(), 1);

        let unhealthy = assess_health(1_500, 0.5, &config, now);
        assert_eq!(unhealthy.overall_status, HealthStatus::Unhealthy);
        assert_eq!(unhealthy.issues.len(), 2);
    }

    #[test]
    fn test_health_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[tokio::test]
    async fn test_sample_counts_and_latest() {
        let repository = Arc::new(MemoryRepository::new());
        let queue = Arc::new(PriorityQueue::new());
        let service = MonitoringService::new(
            MonitoringConfig::default(),
            repository.clone(),
            queue.clone(),
            Metrics::new().unwrap(),
        );

        assert!(service.latest().is_none());

        for status in [
            TransactionStatus::Queued,
            TransactionStatus::Queued,
            TransactionStatus::Processing,
            TransactionStatus::Confirmed,
            TransactionStatus::Confirmed,
            TransactionStatus::Confirmed,
            TransactionStatus::Failed,
        ] {
            let tx = transaction(status);
            repository.create_transaction(&tx).await.unwrap();
            if status == TransactionStatus::Queued {
                queue.push(tx);
            }
        }

        let dashboard = service.sample(Utc::now()).await.unwrap();
        assert_eq!(dashboard.metrics.queued_count, 2);
        assert_eq!(dashboard.metrics.processing_count, 1);
        assert_eq!(dashboard.metrics.completed_count, 3);
        assert_eq!(dashboard.metrics.failed_count, 1);
        assert_eq!(dashboard.metrics.queue_depth, 2);
        assert_eq!(dashboard.status_distribution[&TransactionStatus::Cancelled], 0);
        assert_eq!(dashboard.system_health.backlog, 2);
        assert_eq!(dashboard.system_health.failure_rate, 0.25);
        assert_eq!(
            dashboard.system_health.overall_status,
            HealthStatus::Unhealthy
        );

        assert_eq!(service.latest(), Some(dashboard));
    }
}
