//! Transaction batching server
//!
//! Runs the batching engine over a RocksDB store and a simulated ledger,
//! optionally publishing lifecycle events to NATS.

mod config;

use anyhow::Context;
use batch_engine::{events::EventPublisher, ledger::MockLedgerClient, BatchEngine};
use batch_store::RocksRepository;
use config::ServerConfig;
use message_bus::{NatsClient, NatsEventPublisher, PublisherConfig};
use prometheus::Registry;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Batch server starting...");

    let config = ServerConfig::load()?;
    info!(
        data_dir = ?config.store.data_dir,
        max_batch_size = config.engine.batch.max_batch_size,
        nats = config.nats.enabled,
        "Configuration loaded"
    );

    let repository = Arc::new(
        RocksRepository::open(&config.store).context("Failed to open transaction store")?,
    );

    let ledger = Arc::new(
        MockLedgerClient::new()
            .with_latency_ms(config.ledger.latency_ms)
            .with_success_rate(config.ledger.success_rate)
            .with_confirm_after_polls(config.ledger.confirm_after_polls),
    );

    let bus_registry = Registry::new();
    let publisher: Option<Arc<dyn EventPublisher>> = if config.nats.enabled {
        let client = NatsClient::connect(config.nats.client.clone())
            .await
            .context("Failed to connect to NATS")?;
        let publisher =
            NatsEventPublisher::new(Arc::new(client), PublisherConfig::default(), &bus_registry)?;
        Some(Arc::new(publisher))
    } else {
        None
    };

    let engine = BatchEngine::new(config.engine.clone(), repository, ledger, publisher)?;
    engine.start().await?;
    info!("Batch engine running");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down batch server");
    engine.stop().await;
    debug!(metrics = %engine.metrics().render(), "Final engine metrics");

    Ok(())
}
