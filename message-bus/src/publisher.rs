//! Lifecycle event publisher with retry logic

use crate::{client::NatsClient, message::Message, metrics::PublisherMetrics, Error, Result};
use async_nats::HeaderMap;
use async_trait::async_trait;
use batch_engine::events::{EventPublisher, LifecycleEvent};
use bytes::Bytes;
use prometheus::Registry;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Timeout for a single publish attempt
    pub publish_timeout: Duration,

    /// Max attempts per event
    pub max_retry_attempts: u32,

    /// Initial retry delay
    pub initial_retry_delay: Duration,

    /// Max retry delay
    pub max_retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            max_retry_attempts: 3,
            initial_retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Publishes engine lifecycle events to NATS
pub struct NatsEventPublisher {
    client: Arc<NatsClient>,
    config: PublisherConfig,
    metrics: PublisherMetrics,
}

impl std::fmt::Debug for NatsEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsEventPublisher")
            .field("client", &self.client)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NatsEventPublisher {
    /// Create publisher, registering its metrics in `registry`
    pub fn new(
        client: Arc<NatsClient>,
        config: PublisherConfig,
        registry: &Registry,
    ) -> Result<Self> {
        Ok(Self {
            client,
            config,
            metrics: PublisherMetrics::new(registry)?,
        })
    }

    /// Publish an enveloped event
    pub async fn publish_message(&self, message: &Message) -> Result<()> {
        let start = Instant::now();
        let kind = message.event.kind.as_str();
        let subject = message.subject(&self.client.config().subject_prefix);
        let subject = subject.as_str();
        let payload = Bytes::from(message.to_bytes()?);

        let mut headers = HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.id.to_string().as_str());
        headers.insert("Event-Kind", kind);

        debug!(event_id = %message.id, subject = %subject, "Publishing event");

        let result = retry_with_backoff(&self.config, || {
            self.publish_once(subject, headers.clone(), payload.clone())
        })
        .await;

        self.metrics
            .publish_duration
            .with_label_values(&[kind])
            .observe(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .publish_total
            .with_label_values(&[kind, status])
            .inc();

        result
    }

    /// Single publish attempt
    async fn publish_once(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<()> {
        let timeout = self.config.publish_timeout;
        let attempt = async {
            if let Some(js) = self.client.jetstream() {
                let ack = js
                    .publish_with_headers(subject.to_string(), headers, payload)
                    .await
                    .map_err(|e| Error::Publish(e.to_string()))?;
                ack.await
                    .map_err(|e| Error::JetStream(format!("Publish ack failed: {}", e)))?;
            } else {
                let client = self.client.client();
                client
                    .publish_with_headers(subject.to_string(), headers, payload)
                    .await
                    .map_err(|e| Error::Publish(e.to_string()))?;
                client
                    .flush()
                    .await
                    .map_err(|e| Error::Publish(format!("Flush failed: {}", e)))?;
            }
            Ok::<(), Error>(())
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| Error::Timeout(timeout.as_millis() as u64))?
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, event: &LifecycleEvent) -> batch_engine::Result<()> {
        let message = Message::new(event.clone(), self.client.config().partitions);
        Ok(self.publish_message(&message).await?)
    }
}

/// Run `op` until it succeeds or attempts are exhausted, doubling the delay
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    config: &PublisherConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut delay = config.initial_retry_delay;

    loop {
        attempts += 1;

        match op().await {
            Ok(value) => {
                if attempts > 1 {
                    info!(attempts, "Published after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempts >= config.max_retry_attempts.max(1) {
                    error!(attempts, error = %e, "Publish failed");
                    return Err(e);
                }

                warn!(attempt = attempts, delay = ?delay, error = %e, "Publish failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(config.max_retry_delay);
            }
        }
    }
}
