//! Transaction Queue & Batching Engine
//!
//! Accepts approved transfer intents, orders them by priority, groups
//! compatible requests into fee-optimized batches and submits them to the
//! ledger network.
//!
//! # Architecture
//!
//! ```text
//! enqueue ──► PriorityQueue ──► BatchFormer (tick) ──► FeeOptimizer
//!                 ▲                                        │
//!                 │ requeue (backoff)                      ▼
//!           RetryManager ◄── recoverable ── Submitter ──► LedgerClient
//!                                               │
//!                                  terminal / confirmed ──► Repository
//!
//! ExpirationSweeper (tick) ──► Repository + PriorityQueue
//! MonitoringService (tick) ──► Repository (read-only)
//! ```
//!
//! # Invariants
//!
//! - A transaction is claimed by at most one batch
//! - `success_count + failure_count == transaction_count` once a batch completes
//! - `retry_count <= max_retries` for every transaction
//! - In-flight (batched/processing) transactions are never expired
//!
//! # Example
//!
//! ```no_run
//! use batch_engine::{
//!     ledger::mock::MockLedgerClient, repository::MemoryRepository, BatchEngine, Config,
//!     TransactionRequest,
//! };
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> batch_engine::Result<()> {
//!     let engine = BatchEngine::new(
//!         Config::default(),
//!         Arc::new(MemoryRepository::new()),
//!         Arc::new(MockLedgerClient::new()),
//!         None,
//!     )?;
//!     engine.start().await?;
//!
//!     let tx = engine
//!         .enqueue(TransactionRequest::payment(
//!             Uuid::new_v4(),
//!             Uuid::new_v4(),
//!             "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
//!             "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
//!             Decimal::new(2500, 2),
//!             "XRP",
//!         ))
//!         .await?;
//!     println!("queued {}", tx.id);
//!
//!     engine.stop().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]
#![warn(missing_debug_implementations, clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod expiration;
pub mod fees;
pub mod former;
pub mod ledger;
pub mod metrics;
pub mod monitoring;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod submitter;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::BatchEngine;
pub use error::{Error, Result};
pub use types::*;
