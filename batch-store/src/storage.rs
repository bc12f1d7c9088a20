//! RocksDB-backed transaction repository
//!
//! # Column Families
//!
//! - `transactions` - Transaction records (key: tx_id)
//! - `batches` - Batch records (key: batch_id)
//! - `status_index` - Status lookup (key: status_byte || tx_id)
//! - `batch_index` - Batch membership (key: batch_id || tx_id)

use crate::{
    config::StoreConfig,
    error::{Error, Result},
};
use async_trait::async_trait;
use batch_engine::{
    repository::TransactionRepository,
    types::{Transaction, TransactionBatch, TransactionStats, TransactionStatus},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Column family names
const CF_TRANSACTIONS: &str = "transactions";
const CF_BATCHES: &str = "batches";
const CF_STATUS_INDEX: &str = "status_index";
const CF_BATCH_INDEX: &str = "batch_index";

/// Result of a row replacement
enum Replaced {
    Written,
    Missing,
    StatusChanged,
}

/// Persistent repository over RocksDB
pub struct RocksRepository {
    db: Arc<DB>,
    // Serializes read-modify-write of rows and their index entries
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for RocksRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksRepository")
            .field("path", &self.db.path())
            .finish_non_exhaustive()
    }
}

impl RocksRepository {
    /// Open or create database
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        // Rows are rewritten on every status change
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_BATCHES, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_STATUS_INDEX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_BATCH_INDEX, Self::cf_options_index()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        info!(path = ?path, "Opened transaction store");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf(&self, name: &'static str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or(Error::MissingColumnFamily(name))
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &'static str, id: Uuid) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn exists(&self, cf_name: &'static str, id: Uuid) -> Result<bool> {
        let cf = self.cf(cf_name)?;
        Ok(self.db.get_pinned_cf(&cf, id.as_bytes())?.is_some())
    }

    /// IDs stored under `prefix` in an index column family
    fn scan_index(&self, cf_name: &'static str, prefix: &[u8]) -> Result<Vec<Uuid>> {
        let cf = self.cf(cf_name)?;
        let mut ids = Vec::new();

        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            let id = Uuid::from_slice(&key[prefix.len()..])
                .map_err(|_| Error::CorruptIndex(cf_name))?;
            ids.push(id);
        }

        Ok(ids)
    }

    fn load_all<T: DeserializeOwned>(&self, cf_name: &'static str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    fn transactions_with_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>> {
        let mut transactions = Vec::new();
        for id in self.scan_index(CF_STATUS_INDEX, &[status.as_byte()])? {
            if let Some(tx) = self.get(CF_TRANSACTIONS, id)? {
                transactions.push(tx);
            }
        }
        Ok(transactions)
    }

    fn unsubmitted(&self) -> Result<Vec<Transaction>> {
        let mut transactions = self.transactions_with_status(TransactionStatus::Pending)?;
        transactions.extend(self.transactions_with_status(TransactionStatus::Queued)?);
        Ok(transactions)
    }

    fn put_transaction(
        &self,
        write_batch: &mut WriteBatch,
        tx: &Transaction,
    ) -> Result<()> {
        let cf_tx = self.cf(CF_TRANSACTIONS)?;
        let cf_status = self.cf(CF_STATUS_INDEX)?;

        write_batch.put_cf(&cf_tx, tx.id.as_bytes(), encode(tx)?);
        write_batch.put_cf(&cf_status, status_key(tx.status, tx.id), b"");
        if let Some(batch_id) = tx.batch_id {
            let cf_batch = self.cf(CF_BATCH_INDEX)?;
            write_batch.put_cf(&cf_batch, pair_key(batch_id, tx.id), b"");
        }
        Ok(())
    }

    fn insert_transaction(&self, tx: &Transaction) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if self.exists(CF_TRANSACTIONS, tx.id)? {
            return Ok(false);
        }

        let mut write_batch = WriteBatch::default();
        self.put_transaction(&mut write_batch, tx)?;
        self.db.write(write_batch)?;
        Ok(true)
    }

    fn replace_transaction(
        &self,
        tx: &Transaction,
        expected: Option<TransactionStatus>,
    ) -> Result<Replaced> {
        let _guard = self.write_lock.lock();
        let Some(previous) = self.get::<Transaction>(CF_TRANSACTIONS, tx.id)? else {
            return Ok(Replaced::Missing);
        };
        if expected.map_or(false, |status| status != previous.status) {
            return Ok(Replaced::StatusChanged);
        }

        let mut write_batch = WriteBatch::default();
        let cf_status = self.cf(CF_STATUS_INDEX)?;
        write_batch.delete_cf(&cf_status, status_key(previous.status, previous.id));
        if let Some(batch_id) = previous.batch_id {
            let cf_batch = self.cf(CF_BATCH_INDEX)?;
            write_batch.delete_cf(&cf_batch, pair_key(batch_id, previous.id));
        }
        self.put_transaction(&mut write_batch, tx)?;
        self.db.write(write_batch)?;

        debug!(
            tx_id = %tx.id,
            from = previous.status.as_str(),
            to = tx.status.as_str(),
            "Stored transaction"
        );
        Ok(Replaced::Written)
    }

    fn write_batch_record(&self, batch: &TransactionBatch, must_exist: bool) -> Result<bool> {
        let _guard = self.write_lock.lock();
        if self.exists(CF_BATCHES, batch.id)? != must_exist {
            return Ok(false);
        }
        let cf = self.cf(CF_BATCHES)?;
        self.db.put_cf(&cf, batch.id.as_bytes(), encode(batch)?)?;
        Ok(true)
    }

    fn batch_members(&self, batch_id: Uuid) -> Result<Vec<Transaction>> {
        let mut members = Vec::new();
        for id in self.scan_index(CF_BATCH_INDEX, batch_id.as_bytes())? {
            if let Some(tx) = self.get::<Transaction>(CF_TRANSACTIONS, id)? {
                members.push(tx);
            }
        }

        if let Some(batch) = self.get::<TransactionBatch>(CF_BATCHES, batch_id)? {
            let position = |id: &Uuid| batch.transaction_ids.iter().position(|m| m == id);
            members.sort_by_key(|tx| position(&tx.id));
        }
        Ok(members)
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn status_key(status: TransactionStatus, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status.as_byte());
    key.extend_from_slice(id.as_bytes());
    key
}

fn pair_key(prefix: Uuid, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

#[async_trait]
impl TransactionRepository for RocksRepository {
    async fn create_transaction(&self, tx: &Transaction) -> batch_engine::Result<()> {
        if self.insert_transaction(tx)? {
            Ok(())
        } else {
            Err(batch_engine::Error::InvalidState(format!(
                "transaction {} already exists",
                tx.id
            )))
        }
    }

    async fn update_transaction(&self, tx: &Transaction) -> batch_engine::Result<()> {
        match self.replace_transaction(tx, None)? {
            Replaced::Missing => Err(batch_engine::Error::TransactionNotFound(tx.id)),
            Replaced::Written | Replaced::StatusChanged => Ok(()),
        }
    }

    async fn update_transaction_if(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
    ) -> batch_engine::Result<bool> {
        match self.replace_transaction(tx, Some(expected))? {
            Replaced::Written => Ok(true),
            Replaced::StatusChanged => Ok(false),
            Replaced::Missing => Err(batch_engine::Error::TransactionNotFound(tx.id)),
        }
    }

    async fn get_transaction(&self, id: Uuid) -> batch_engine::Result<Option<Transaction>> {
        Ok(self.get(CF_TRANSACTIONS, id)?)
    }

    async fn get_pending_transactions(
        &self,
        limit: usize,
    ) -> batch_engine::Result<Vec<Transaction>> {
        let mut pending = self.unsubmitted()?;
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn get_expired_transactions(
        &self,
        now: DateTime<Utc>,
    ) -> batch_engine::Result<Vec<Transaction>> {
        Ok(self
            .unsubmitted()?
            .into_iter()
            .filter(|tx| tx.is_expired(now))
            .collect())
    }

    async fn count_by_status(&self, status: TransactionStatus) -> batch_engine::Result<u64> {
        Ok(self.scan_index(CF_STATUS_INDEX, &[status.as_byte()])?.len() as u64)
    }

    async fn create_batch(&self, batch: &TransactionBatch) -> batch_engine::Result<()> {
        if self.write_batch_record(batch, false)? {
            Ok(())
        } else {
            Err(batch_engine::Error::InvalidState(format!(
                "batch {} already exists",
                batch.id
            )))
        }
    }

    async fn update_batch(&self, batch: &TransactionBatch) -> batch_engine::Result<()> {
        if self.write_batch_record(batch, true)? {
            Ok(())
        } else {
            Err(batch_engine::Error::BatchNotFound(batch.id))
        }
    }

    async fn get_batch(&self, id: Uuid) -> batch_engine::Result<Option<TransactionBatch>> {
        Ok(self.get(CF_BATCHES, id)?)
    }

    async fn get_transactions_by_batch(
        &self,
        batch_id: Uuid,
    ) -> batch_engine::Result<Vec<Transaction>> {
        Ok(self.batch_members(batch_id)?)
    }

    // Full scan of both record families, once per monitoring sample
    async fn transaction_stats(&self) -> batch_engine::Result<TransactionStats> {
        let transactions: Vec<Transaction> = self.load_all(CF_TRANSACTIONS)?;
        let batches: Vec<TransactionBatch> = self.load_all(CF_BATCHES)?;
        Ok(TransactionStats::from_records(&transactions, &batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> (StoreConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        (config, temp_dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (config, _temp) = test_config();
        let repo = RocksRepository::open(&config).unwrap();
        for name in [CF_TRANSACTIONS, CF_BATCHES, CF_STATUS_INDEX, CF_BATCH_INDEX] {
            assert!(repo.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_index_keys() {
        let id = Uuid::new_v4();
        let key = status_key(TransactionStatus::Queued, id);
        assert_eq!(key.len(), 17);
        assert_eq!(key[0], TransactionStatus::Queued.as_byte());
        assert_eq!(&key[1..], id.as_bytes());

        let batch_id = Uuid::new_v4();
        let key = pair_key(batch_id, id);
        assert_eq!(&key[..16], batch_id.as_bytes());
        assert_eq!(&key[16..], id.as_bytes());
    }

    #[test]
    fn test_scan_index_stops_at_prefix_boundary() {
        let (config, _temp) = test_config();
        let repo = RocksRepository::open(&config).unwrap();
        let cf = repo.cf(CF_STATUS_INDEX).unwrap();

        let queued = Uuid::new_v4();
        let batched = Uuid::new_v4();
        repo.db
            .put_cf(&cf, status_key(TransactionStatus::Queued, queued), b"")
            .unwrap();
        repo.db
            .put_cf(&cf, status_key(TransactionStatus::Batched, batched), b"")
            .unwrap();

        let ids = repo
            .scan_index(CF_STATUS_INDEX, &[TransactionStatus::Queued.as_byte()])
            .unwrap();
        assert_eq!(ids, vec![queued]);
    }
}
