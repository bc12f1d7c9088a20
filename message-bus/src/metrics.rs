//! Prometheus metrics for the event publisher

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Publisher metrics registered in a caller-supplied registry
#[derive(Debug, Clone)]
pub struct PublisherMetrics {
    /// Events published, by kind and outcome
    pub publish_total: IntCounterVec,

    /// Publish duration including retries, by kind
    pub publish_duration: HistogramVec,
}

impl PublisherMetrics {
    /// Create and register metrics
    pub fn new(registry: &Registry) -> crate::Result<Self> {
        let publish_total = IntCounterVec::new(
            Opts::new("message_bus_publish_total", "Total events published"),
            &["kind", "status"],
        )?;
        let publish_duration = HistogramVec::new(
            HistogramOpts::new(
                "message_bus_publish_duration_seconds",
                "Event publish duration in seconds",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(publish_total.clone()))?;
        registry.register(Box::new(publish_duration.clone()))?;

        Ok(Self {
            publish_total,
            publish_duration,
        })
    }
}
