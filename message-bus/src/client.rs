//! NATS connection and JetStream stream setup

use crate::{Error, Result};
use async_nats::jetstream::{
    self,
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// NATS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL
    pub url: String,

    /// Subject prefix, events go to `<prefix>.<kind>.<partition>`
    pub subject_prefix: String,

    /// Number of subject partitions
    pub partitions: u32,

    /// Publish through JetStream for persistence and deduplication
    pub use_jetstream: bool,

    /// JetStream stream name
    pub stream_name: String,

    /// Deduplication window (seconds)
    pub duplicate_window_secs: u64,

    /// Retention (seconds)
    pub max_age_secs: u64,

    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "treasury.tx".to_string(),
            partitions: 16,
            use_jetstream: true,
            stream_name: "TREASURY_TX_EVENTS".to_string(),
            duplicate_window_secs: 300, // 5 min deduplication
            max_age_secs: 7 * 24 * 3600, // 7 days
            connect_timeout_ms: 5_000,
        }
    }
}

impl NatsConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::Config("partitions must be > 0".to_string()));
        }
        if self.subject_prefix.is_empty()
            || self
                .subject_prefix
                .split('.')
                .any(|token| token.is_empty() || token.contains(['*', '>', ' ']))
        {
            return Err(Error::Config(format!(
                "invalid subject prefix: {:?}",
                self.subject_prefix
            )));
        }
        if self.use_jetstream && self.stream_name.is_empty() {
            return Err(Error::Config("stream_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Stream capturing every subject under the prefix
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.stream_name.clone(),
            description: Some("Transaction lifecycle events".to_string()),
            subjects: vec![format!("{}.>", self.subject_prefix)],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(self.max_age_secs),
            storage: StorageType::File,
            duplicate_window: Duration::from_secs(self.duplicate_window_secs),
            ..Default::default()
        }
    }
}

/// Connected NATS client
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: Option<jetstream::Context>,
    config: NatsConfig,
}

impl std::fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsClient")
            .field("config", &self.config)
            .field("jetstream", &self.jetstream.is_some())
            .finish()
    }
}

impl NatsClient {
    /// Connect and, with JetStream enabled, ensure the stream exists
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        config.validate()?;
        info!(url = %config.url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .connect(config.url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let jetstream = if config.use_jetstream {
            let context = jetstream::new(client.clone());
            match context.get_or_create_stream(config.stream_config()).await {
                Ok(_) => info!(stream = %config.stream_name, "Stream ready"),
                Err(e) => {
                    error!(stream = %config.stream_name, error = %e, "Failed to create stream");
                    return Err(Error::JetStream(e.to_string()));
                }
            }
            Some(context)
        } else {
            None
        };

        Ok(Self {
            client,
            jetstream,
            config,
        })
    }

    /// Core client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// JetStream context, when enabled
    pub fn jetstream(&self) -> Option<&jetstream::Context> {
        self.jetstream.as_ref()
    }

    /// Configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}
