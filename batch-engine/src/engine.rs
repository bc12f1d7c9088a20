//! Batching engine
//!
//! Owns the queue and every component, and runs three background loops:
//! batch formation (with bounded concurrent submission), expiration sweeps
//! and monitoring samples, plus the lifecycle event dispatcher. Loops stop
//! cooperatively through a `watch` channel; `stop()` returns once every loop
//! and every in-flight batch submission has finished and buffered events
//! have been handed to the publisher.

use crate::{
    config::Config,
    events::{EventDispatcher, EventKind, EventPublisher, EventSink, LifecycleEvent},
    expiration::ExpirationSweeper,
    fees::FeeOptimizer,
    former::BatchFormer,
    ledger::LedgerClient,
    metrics::Metrics,
    monitoring::{DashboardData, MonitoringService},
    queue::PriorityQueue,
    repository::TransactionRepository,
    retry::RetryManager,
    submitter::Submitter,
    types::{Transaction, TransactionBatch, TransactionRequest, TransactionStatus},
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Transaction queue and batching engine
pub struct BatchEngine {
    inner: Arc<EngineInner>,
    workers: Mutex<Option<Workers>>,
    dispatcher: Mutex<Option<EventDispatcher>>,
}

struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    events: Option<(watch::Sender<bool>, JoinHandle<EventDispatcher>)>,
}

struct EngineInner {
    config: Config,
    repository: Arc<dyn TransactionRepository>,
    queue: Arc<PriorityQueue>,
    former: BatchFormer,
    submitter: Arc<Submitter>,
    sweeper: ExpirationSweeper,
    monitoring: MonitoringService,
    events: EventSink,
    metrics: Metrics,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("service", &self.inner.config.service_name)
            .field("queue_depth", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}

impl BatchEngine {
    /// Create engine with its collaborators
    ///
    /// Lifecycle events are buffered from the start but only handed to
    /// `publisher` while the engine is running.
    pub fn new(
        config: Config,
        repository: Arc<dyn TransactionRepository>,
        ledger: Arc<dyn LedgerClient>,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Metrics::new()?;
        let (events, dispatcher) =
            EventSink::channel(publisher, config.events.buffer_capacity);
        let queue = Arc::new(PriorityQueue::new());

        let retry = Arc::new(RetryManager::new(
            config.retry.clone(),
            repository.clone(),
            queue.clone(),
            events.clone(),
            metrics.clone(),
        ));

        let former = BatchFormer::new(
            config.batch.clone(),
            queue.clone(),
            repository.clone(),
            FeeOptimizer::new(config.fees.clone()),
            events.clone(),
            metrics.clone(),
        );

        let submitter = Arc::new(Submitter::new(
            config.submitter.clone(),
            ledger,
            repository.clone(),
            retry,
            events.clone(),
            metrics.clone(),
        ));

        let sweeper = ExpirationSweeper::new(
            queue.clone(),
            repository.clone(),
            events.clone(),
            metrics.clone(),
        );

        let monitoring = MonitoringService::new(
            config.monitoring.clone(),
            repository.clone(),
            queue.clone(),
            metrics.clone(),
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                repository,
                queue,
                former,
                submitter,
                sweeper,
                monitoring,
                events,
                metrics,
            }),
            workers: Mutex::new(None),
            dispatcher: Mutex::new(dispatcher),
        })
    }

    /// Validate, persist and queue a transaction
    pub async fn enqueue(&self, request: TransactionRequest) -> Result<Transaction> {
        let inner = &self.inner;
        let now = Utc::now();

        let mut tx = Transaction::new(request, inner.config.retry.default_max_retries, now)?;
        inner.repository.create_transaction(&tx).await?;

        // Persist Queued before the former can see it, so a claim is never overwritten
        tx.transition(TransactionStatus::Queued, now);
        tx.queued_at = Some(now);
        if !inner
            .repository
            .update_transaction_if(&tx, TransactionStatus::Pending)
            .await?
        {
            let current = inner.transaction(tx.id).await?;
            warn!(
                tx_id = %tx.id,
                status = %current.status,
                "Transaction changed state during enqueue"
            );
            return Err(Error::InvalidState(format!(
                "transaction {} became {} before it was queued",
                tx.id, current.status
            )));
        }
        inner.queue.push(tx.clone());

        inner.metrics.enqueued.inc();
        inner.metrics.queue_depth.set(inner.queue.len() as i64);

        debug!(
            tx_id = %tx.id,
            enterprise_id = %tx.enterprise_id,
            tx_type = %tx.tx_type,
            priority = %tx.priority,
            "Transaction queued"
        );
        inner
            .events
            .emit(LifecycleEvent::transaction(EventKind::Enqueued, &tx, now));

        Ok(tx)
    }

    /// Withdraw a transaction that has not been batched yet
    pub async fn cancel(&self, id: Uuid) -> Result<Transaction> {
        let inner = &self.inner;
        let now = Utc::now();

        let (mut tx, was_queued) = match inner.queue.remove(&id) {
            Some(tx) => (tx, true),
            None => {
                let tx = inner
                    .repository
                    .get_transaction(id)
                    .await?
                    .ok_or(Error::TransactionNotFound(id))?;
                if tx.status != TransactionStatus::Pending {
                    return Err(Error::InvalidState(format!(
                        "transaction {} is {} and can no longer be cancelled",
                        id, tx.status
                    )));
                }
                (tx, false)
            }
        };

        let previous = tx.clone();
        tx.transition(TransactionStatus::Cancelled, now);
        tx.next_attempt_at = None;

        match inner
            .repository
            .update_transaction_if(&tx, previous.status)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::InvalidState(format!(
                    "transaction {} changed state and can no longer be cancelled",
                    id
                )))
            }
            Err(e) => {
                if was_queued {
                    inner.queue.push(previous);
                }
                return Err(e);
            }
        }

        info!(tx_id = %tx.id, "Transaction cancelled");
        inner
            .events
            .emit(LifecycleEvent::transaction(EventKind::Cancelled, &tx, now));
        Ok(tx)
    }

    /// Look up a transaction
    pub async fn transaction(&self, id: Uuid) -> Result<Transaction> {
        self.inner.transaction(id).await
    }

    /// Look up a batch
    pub async fn batch(&self, id: Uuid) -> Result<TransactionBatch> {
        self.inner
            .repository
            .get_batch(id)
            .await?
            .ok_or(Error::BatchNotFound(id))
    }

    /// Transactions currently assigned to a batch
    pub async fn batch_transactions(&self, id: Uuid) -> Result<Vec<Transaction>> {
        self.batch(id).await?;
        self.inner.repository.get_transactions_by_batch(id).await
    }

    /// Form and submit every batch that is ready now
    pub async fn form_batches_now(&self) -> Vec<TransactionBatch> {
        self.form_batches_at(Utc::now()).await
    }

    /// Form every batch ready at `now` and submit them, waiting for completion
    pub async fn form_batches_at(&self, now: DateTime<Utc>) -> Vec<TransactionBatch> {
        let formed = self.inner.former.form_batches(now).await;

        let mut completed = Vec::with_capacity(formed.len());
        for batch in formed {
            completed.push(self.inner.submitter.submit_batch(batch).await);
        }
        completed
    }

    /// Expire everything whose deadline has passed
    pub async fn sweep_expired(&self) -> Result<Vec<Uuid>> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Expire everything whose deadline passed at `now`
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.inner.sweeper.sweep(now).await
    }

    /// Take a fresh monitoring sample
    pub async fn sample_dashboard(&self) -> Result<DashboardData> {
        self.inner.monitoring.sample(Utc::now()).await
    }

    /// Latest monitoring sample
    pub fn dashboard(&self) -> Option<DashboardData> {
        self.inner.monitoring.latest()
    }

    /// Transactions waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    /// Engine metrics
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Whether background loops are running
    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Recover queued work and start the background loops. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            debug!("Engine already running");
            return Ok(());
        }

        let recovered = self.inner.recover(Utc::now()).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = vec![
            tokio::spawn(run_former(self.inner.clone(), shutdown_rx.clone())),
            tokio::spawn(run_sweeper(self.inner.clone(), shutdown_rx.clone())),
            tokio::spawn(run_monitor(self.inner.clone(), shutdown_rx)),
        ];

        let events = self.dispatcher.lock().await.take().map(|dispatcher| {
            let (events_shutdown, events_rx) = watch::channel(false);
            (events_shutdown, tokio::spawn(dispatcher.run(events_rx)))
        });

        *workers = Some(Workers {
            shutdown,
            handles,
            events,
        });

        info!(
            service = %self.inner.config.service_name,
            recovered,
            max_batch_size = self.inner.config.batch.max_batch_size,
            max_wait_ms = self.inner.config.batch.max_wait_time_ms,
            "Batch engine started"
        );
        Ok(())
    }

    /// Stop the background loops and wait for in-flight submissions. Idempotent.
    pub async fn stop(&self) {
        let Some(workers) = self.workers.lock().await.take() else {
            return;
        };

        let _ = workers.shutdown.send(true);
        for handle in workers.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Engine worker terminated abnormally");
            }
        }

        // Loops are done emitting; flush what they left in the buffer
        if let Some((events_shutdown, handle)) = workers.events {
            let _ = events_shutdown.send(true);
            match handle.await {
                Ok(dispatcher) => *self.dispatcher.lock().await = Some(dispatcher),
                Err(e) => error!(error = %e, "Event dispatcher terminated abnormally"),
            }
        }

        info!(queue_depth = self.inner.queue.len(), "Batch engine stopped");
    }
}

impl EngineInner {
    async fn transaction(&self, id: Uuid) -> Result<Transaction> {
        self.repository
            .get_transaction(id)
            .await?
            .ok_or(Error::TransactionNotFound(id))
    }

    /// Reload un-submitted rows into the queue
    async fn recover(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self
            .repository
            .get_pending_transactions(self.config.expiration.recovery_limit)
            .await?;

        let mut recovered = 0;
        for mut tx in rows {
            if self.queue.contains(&tx.id) {
                continue;
            }
            if tx.is_expired(now) {
                self.sweeper.expire(tx, now).await;
                continue;
            }

            if tx.status == TransactionStatus::Pending {
                tx.transition(TransactionStatus::Queued, now);
                tx.queued_at.get_or_insert(now);
                match self
                    .repository
                    .update_transaction_if(&tx, TransactionStatus::Pending)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(tx_id = %tx.id, error = %e, "Failed to recover pending transaction");
                        continue;
                    }
                }
            }

            if self.queue.push(tx) {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered queued transactions");
        }
        self.metrics.queue_depth.set(self.queue.len() as i64);
        Ok(recovered)
    }
}

async fn run_former(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(inner.config.batch.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let permits = Arc::new(Semaphore::new(inner.config.submitter.max_concurrent_batches));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Leave work queued while every submission slot is busy
                if permits.available_permits() == 0 {
                    continue;
                }

                for formed in inner.former.form_batches(Utc::now()).await {
                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    let submitter = inner.submitter.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        submitter.submit_batch(formed).await
                    });
                }
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Batch submission task failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if !in_flight.is_empty() {
        info!(in_flight = in_flight.len(), "Waiting for in-flight batches");
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Batch submission task failed");
        }
    }
}

async fn run_sweeper(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_millis(
        inner.config.expiration.sweep_interval_ms,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner.sweeper.sweep(Utc::now()).await {
                    error!(error = %e, "Expiration sweep failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_monitor(inner: Arc<EngineInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_millis(
        inner.config.monitoring.sample_interval_ms,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = inner.monitoring.sample(Utc::now()).await {
                    error!(error = %e, "Monitoring sample failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
