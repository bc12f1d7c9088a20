//! Lifecycle event publishing
//!
//! Every state change of interest is emitted as a [`LifecycleEvent`]. Events
//! are best effort: emitting never waits on the publisher, and a publish
//! failure is logged and never rolls back the state change that produced it.

use crate::{types::Transaction, types::TransactionBatch, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Transaction accepted into the queue
    Enqueued,
    /// Transaction claimed into a batch
    Batched,
    /// Transaction validated on the ledger
    Confirmed,
    /// Transaction permanently failed
    Failed,
    /// Transaction requeued after a recoverable failure
    Retried,
    /// Transaction expired before submission
    Expired,
    /// Transaction withdrawn by the caller
    Cancelled,
    /// Every member of a batch reached an outcome
    BatchCompleted,
}

impl EventKind {
    /// Subject token
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Enqueued => "enqueued",
            EventKind::Batched => "batched",
            EventKind::Confirmed => "confirmed",
            EventKind::Failed => "failed",
            EventKind::Retried => "retried",
            EventKind::Expired => "expired",
            EventKind::Cancelled => "cancelled",
            EventKind::BatchCompleted => "batch_completed",
        }
    }
}

/// Event emitted on a lifecycle change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Event ID (also the deduplication key downstream)
    pub event_id: Uuid,
    /// Kind
    pub kind: EventKind,
    /// Transaction, absent for batch-level events
    pub transaction_id: Option<Uuid>,
    /// Batch, when known
    pub batch_id: Option<Uuid>,
    /// Owning enterprise, absent for batch-level events
    pub enterprise_id: Option<Uuid>,
    /// Status name after the change
    pub status: String,
    /// Error or extra context
    pub detail: Option<String>,
    /// When the change happened
    pub occurred_at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Event describing a transaction's current state
    pub fn transaction(kind: EventKind, tx: &Transaction, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            transaction_id: Some(tx.id),
            batch_id: tx.batch_id,
            enterprise_id: Some(tx.enterprise_id),
            status: tx.status.as_str().to_string(),
            detail: tx.last_error.clone(),
            occurred_at: now,
        }
    }

    /// Event describing a batch's current state
    pub fn batch(kind: EventKind, batch: &TransactionBatch, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            transaction_id: None,
            batch_id: Some(batch.id),
            enterprise_id: None,
            status: batch.status.as_str().to_string(),
            detail: Some(format!(
                "{} confirmed, {} failed, {} drops saved",
                batch.success_count, batch.failure_count, batch.fee_savings
            )),
            occurred_at: now,
        }
    }
}

/// Event publishing capability
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event
    async fn publish(&self, event: &LifecycleEvent) -> Result<()>;
}

/// In-process publisher backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl BroadcastPublisher {
    /// Create publisher buffering `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        // No subscribers is not an error
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Non-blocking handle the engine components emit events through
///
/// Events go into a bounded channel drained by an [`EventDispatcher`]; a
/// full buffer drops the event instead of stalling the caller.
#[derive(Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::Sender<LifecycleEvent>>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.sender.is_some())
            .finish()
    }
}

impl EventSink {
    /// Sink feeding `publisher` through a buffer of `capacity` events
    pub fn channel(
        publisher: Option<Arc<dyn EventPublisher>>,
        capacity: usize,
    ) -> (Self, Option<EventDispatcher>) {
        let Some(publisher) = publisher else {
            return (Self::default(), None);
        };

        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Some(sender),
            },
            Some(EventDispatcher {
                publisher,
                receiver,
            }),
        )
    }

    /// Queue an event for publishing; returns false if it was dropped
    pub fn emit(&self, event: LifecycleEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    event_id = %event.event_id,
                    kind = event.kind.as_str(),
                    "Event buffer full, dropping lifecycle event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event_id = %event.event_id, "Event dispatcher gone, dropping event");
                false
            }
        }
    }
}

/// Drains an [`EventSink`] into its publisher
pub struct EventDispatcher {
    publisher: Arc<dyn EventPublisher>,
    receiver: mpsc::Receiver<LifecycleEvent>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Publish events until `shutdown` flips, then flush what is buffered.
    ///
    /// Returns itself so the engine can run it again after a restart.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        loop {
            tokio::select! {
                biased;
                received = self.receiver.recv() => match received {
                    Some(event) => self.publish(event).await,
                    None => return self,
                },
                _ = shutdown.changed() => break,
            }
        }

        let mut flushed = 0usize;
        while let Ok(event) = self.receiver.try_recv() {
            self.publish(event).await;
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, "Flushed buffered lifecycle events");
        }
        self
    }

    async fn publish(&self, event: LifecycleEvent) {
        if let Err(e) = self.publisher.publish(&event).await {
            warn!(
                event_id = %event.event_id,
                kind = event.kind.as_str(),
                error = %e,
                "Failed to publish lifecycle event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{types::TransactionRequest, Error};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, _event: &LifecycleEvent) -> Result<()> {
            Err(Error::Publish("broker unavailable".to_string()))
        }
    }

    fn transaction() -> Transaction {
        let request = TransactionRequest::payment(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
            "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
            Decimal::ONE,
            "XRP",
        );
        Transaction::new(request, 3, Utc::now()).unwrap()
    }

    struct SlowPublisher {
        delay: std::time::Duration,
        published: AtomicUsize,
    }

    #[async_trait]
    impl EventPublisher for SlowPublisher {
        async fn publish(&self, _event: &LifecycleEvent) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.published.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    fn enqueued() -> LifecycleEvent {
        LifecycleEvent::transaction(EventKind::Enqueued, &transaction(), Utc::now())
    }

    #[tokio::test]
    async fn test_broadcast_delivery() {
        let publisher = BroadcastPublisher::new(16);
        let mut rx = publisher.subscribe();
        let (sink, dispatcher) = EventSink::channel(Some(Arc::new(publisher)), 16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(dispatcher.unwrap().run(shutdown_rx));

        let tx = transaction();
        assert!(sink.emit(LifecycleEvent::transaction(EventKind::Enqueued, &tx, Utc::now())));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Enqueued);
        assert_eq!(event.transaction_id, Some(tx.id));
        assert_eq!(event.status, "pending");

        shutdown.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = BroadcastPublisher::new(4);
        assert!(publisher.publish(&enqueued()).await.is_ok());
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_slow_publisher() {
        let publisher = Arc::new(SlowPublisher {
            delay: std::time::Duration::from_millis(200),
            published: AtomicUsize::new(0),
        });
        let (sink, dispatcher) = EventSink::channel(Some(publisher.clone()), 8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(dispatcher.unwrap().run(shutdown_rx));

        let started = std::time::Instant::now();
        for _ in 0..3 {
            assert!(sink.emit(enqueued()));
        }
        assert!(started.elapsed() < std::time::Duration::from_millis(100));

        // Shutdown flushes everything still buffered
        shutdown.send(true).unwrap();
        running.await.unwrap();
        assert_eq!(publisher.published.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_events() {
        let (sink, dispatcher) = EventSink::channel(Some(Arc::new(BroadcastPublisher::new(4))), 1);
        assert!(dispatcher.is_some());

        // Nothing drains the buffer
        assert!(sink.emit(enqueued()));
        assert!(!sink.emit(enqueued()));
    }

    #[tokio::test]
    async fn test_failing_publisher_is_swallowed() {
        let (sink, dispatcher) = EventSink::channel(Some(Arc::new(FailingPublisher)), 4);
        let (shutdown, shutdown_rx) = watch::channel(false);
        assert!(sink.emit(enqueued()));
        shutdown.send(true).unwrap();
        dispatcher.unwrap().run(shutdown_rx).await;

        // Disabled sink is a no-op
        let (disabled, none) = EventSink::channel(None, 4);
        assert!(none.is_none());
        assert!(!disabled.emit(enqueued()));
    }
}
