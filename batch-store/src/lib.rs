//! RocksDB persistence for the batching engine
//!
//! [`RocksRepository`] implements [`batch_engine::repository::TransactionRepository`]
//! with bincode-encoded records and two secondary indexes:
//!
//! - `status_index`: `status_byte ‖ tx_id` for pending scans and counts
//! - `batch_index`: `batch_id ‖ tx_id` for batch membership
//!
//! Record and index writes for one transaction go through a single
//! `WriteBatch`, so a crash never leaves an index entry without its row.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod storage;

pub use config::{RocksDbConfig, StoreConfig};
pub use error::{Error, Result};
pub use storage::RocksRepository;
