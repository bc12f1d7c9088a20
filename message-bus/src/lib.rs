//! NATS publishing of batching engine lifecycle events
//!
//! Provides an [`batch_engine::events::EventPublisher`] backed by NATS with:
//! - Subjects partitioned by enterprise (or batch) for ordered consumers
//! - Optional JetStream persistence with `Nats-Msg-Id` deduplication
//! - Retry logic with exponential backoff
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod error;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod types;

pub use client::{NatsClient, NatsConfig};
pub use error::{Error, Result};
pub use message::Message;
pub use publisher::{NatsEventPublisher, PublisherConfig};
pub use types::PartitionKey;
