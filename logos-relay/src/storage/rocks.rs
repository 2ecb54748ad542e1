//! RocksDB-backed storage.
//!
//! Column families:
//! - `logs`   - append-only update logs (LZ4 compressed, keyed by `<key>\0<seq:8 BE>`)
//! - `values` - snapshots and TTL-bound presence entries (bincode envelope, LZ4 payload)
//!
//! Sequence numbers are global and monotonically increasing; they are
//! recovered from the `logs` family on open. Appends hold the sequence lock
//! through the write, so a reader never sees a later entry before an earlier one. Atomic batches map onto a single
//! `WriteBatch`, so a snapshot write and a log clear land together.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use super::{Backend, BatchOp, LogSlice, StoreError};

const CF_LOGS: &str = "logs";
const CF_VALUES: &str = "values";

const COLUMN_FAMILIES: &[&str] = &[CF_LOGS, CF_VALUES];

/// Separates a log key from the entry sequence number.
const LOG_SEPARATOR: u8 = 0x00;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relay_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Envelope for entries of the `values` family.
#[derive(Debug, Serialize, Deserialize)]
struct StoredValue {
    /// Expiry in milliseconds since the epoch; `None` never expires.
    expires_at_ms: Option<u64>,
    /// LZ4-compressed payload
    compressed: Vec<u8>,
}

impl StoredValue {
    fn new(payload: &[u8], expires_at_ms: Option<u64>) -> Self {
        Self {
            expires_at_ms,
            compressed: lz4_flex::compress_prepend_size(payload),
        }
    }

    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }

    fn payload(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(value)
    }
}

/// RocksDB-backed relay storage.
pub struct RocksBackend {
    /// RocksDB instance (single-threaded CF mode; concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next log sequence number
    sequence: Mutex<u64>,
}

impl RocksBackend {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened relay store at {} (next log sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: Mutex::new(sequence),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_LOGS => {
                // Many small appends; payloads are already LZ4.
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_VALUES => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            _ => {}
        }

        opts
    }

    /// Highest sequence number present in any log, plus one.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_LOGS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_LOGS}' not found")))?;

        let mut next = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(seq) = sequence_of(&key) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Collect `(seq, decompressed)` for every entry of a log.
    fn scan_log(&self, key: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_LOGS)?;
        let prefix = log_prefix(key);

        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (entry_key, value) = item?;
            if !entry_key.starts_with(&prefix) {
                break;
            }
            let Some(seq) = sequence_of(&entry_key) else {
                continue;
            };
            let blob = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            entries.push((seq, blob));
        }
        Ok(entries)
    }

    fn count_log(&self, key: &str) -> Result<usize, StoreError> {
        let cf = self.cf(CF_LOGS)?;
        let prefix = log_prefix(key);

        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (entry_key, _) = item?;
            if !entry_key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn read_value(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let cf = self.cf(CF_VALUES)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => StoredValue::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Backend for RocksBackend {
    async fn append(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError> {
        let cf = self.cf(CF_LOGS)?;
        let compressed = lz4_flex::compress_prepend_size(&value);
        {
            let mut sequence = self
                .sequence
                .lock()
                .map_err(|e| StoreError::Database(e.to_string()))?;
            self.db
                .put_cf_opt(cf, log_entry_key(key, *sequence), compressed, &self.write_opts())?;
            *sequence += 1;
        }
        self.count_log(key)
    }

    async fn read_log(&self, key: &str) -> Result<LogSlice, StoreError> {
        let entries = self.scan_log(key)?;
        let fence = entries.last().map(|(seq, _)| *seq);
        Ok(LogSlice {
            entries: entries.into_iter().map(|(_, blob)| blob).collect(),
            fence,
        })
    }

    async fn log_len(&self, key: &str) -> Result<usize, StoreError> {
        self.count_log(key)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.read_value(key)? {
            Some(stored) if stored.is_live(now_ms()) => stored.payload().map(Some),
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let cf = self.cf(CF_VALUES)?;
        let expires_at = now_ms().saturating_add(ttl.as_millis() as u64);
        let stored = StoredValue::new(&value, Some(expires_at));
        self.db
            .put_cf_opt(cf, key.as_bytes(), stored.encode()?, &self.write_opts())?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_VALUES)?;
        let existed = self
            .read_value(key)?
            .is_some_and(|stored| stored.is_live(now_ms()));
        self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
        Ok(existed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_VALUES)?;
        let now = now_ms();

        let mut live = Vec::new();
        let mut expired = WriteBatch::default();
        let mut expired_count = 0usize;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, bytes) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let stored = StoredValue::decode(&bytes)?;
            if !stored.is_live(now) {
                expired.delete_cf(cf, &key);
                expired_count += 1;
                continue;
            }
            let Ok(key) = String::from_utf8(key.to_vec()) else {
                continue;
            };
            live.push((key, stored.payload()?));
        }

        if expired_count > 0 {
            log::trace!("Dropping {expired_count} expired values under {prefix}");
            self.db.write_opt(expired, &self.write_opts())?;
        }
        Ok(live)
    }

    async fn atomic(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let cf_logs = self.cf(CF_LOGS)?;
        let cf_values = self.cf(CF_VALUES)?;

        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    let stored = StoredValue::new(&value, None);
                    batch.put_cf(cf_values, key.as_bytes(), stored.encode()?);
                }
                BatchOp::ClearLog { key } => {
                    batch.delete_range_cf(cf_logs, log_prefix(&key), log_end(&key));
                }
                BatchOp::TrimLog { key, through } => {
                    let end = match through.checked_add(1) {
                        Some(next) => log_entry_key(&key, next),
                        None => log_end(&key),
                    };
                    batch.delete_range_cf(cf_logs, log_entry_key(&key, 0), end);
                }
            }
        }

        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

/// `<key>\0`
fn log_prefix(key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 1);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(LOG_SEPARATOR);
    prefix
}

/// Exclusive upper bound of every entry key of a log.
fn log_end(key: &str) -> Vec<u8> {
    let mut end = Vec::with_capacity(key.len() + 1);
    end.extend_from_slice(key.as_bytes());
    end.push(LOG_SEPARATOR + 1);
    end
}

/// `<key>\0<seq:8 bytes big-endian>`
fn log_entry_key(key: &str, seq: u64) -> Vec<u8> {
    let mut entry = log_prefix(key);
    entry.extend_from_slice(&seq.to_be_bytes());
    entry
}

/// Trailing sequence number of a log entry key.
fn sequence_of(entry_key: &[u8]) -> Option<u64> {
    let split = entry_key.len().checked_sub(8)?;
    if split == 0 || entry_key[split - 1] != LOG_SEPARATOR {
        return None;
    }
    let bytes: [u8; 8] = entry_key[split..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
