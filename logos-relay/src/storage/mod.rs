//! Storage backends for the relay.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   ┌───────────────┐
//! │ Persistence  │   │ AwarenessStore│
//! │ (log+snapshot│   │ (TTL entries) │
//! └──────┬───────┘   └───────┬───────┘
//!        │   KeySpace (§ key layout)
//!        ▼                   ▼
//! ┌──────────────────────────────────────┐
//! │ dyn Backend                          │
//! │   MemoryBackend  - in-process        │
//! │   RocksBackend   - durable, LZ4      │
//! └──────────────────────────────────────┘
//! ```
//!
//! Key layout (prefix configurable, default `yjs`):
//!
//! | Key                                   | Contents                      |
//! |---------------------------------------|-------------------------------|
//! | `<prefix>:<doc>:updates`              | ordered list of update blobs  |
//! | `<prefix>:<doc>:snapshot`             | merged snapshot blob          |
//! | `<prefix>:<doc>:awareness:<clientId>` | presence blob, TTL-bound      |
//!
//! The surface is lists plus TTL values; a networked key-value store fits
//! behind the same trait.

pub mod memory;
pub mod rocks;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Entries of an append-only log, read in append order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSlice {
    pub entries: Vec<Vec<u8>>,
    /// Sequence number of the last entry read. Passing it back in
    /// [`BatchOp::TrimLog`] removes exactly what was read.
    pub fence: Option<u64>,
}

impl LogSlice {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: Vec<u8> },
    /// Drop every entry of the log, including ones appended after any read.
    ClearLog { key: String },
    /// Drop log entries with sequence number `<= through`.
    TrimLog { key: String, through: u64 },
}

/// Minimal key-value surface used by persistence and awareness.
///
/// Implementations must apply [`Backend::atomic`] as one unit: a concurrent
/// reader sees either none or all of the batch.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Append to a log. Returns the log length after the append.
    async fn append(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError>;

    /// Read a whole log.
    async fn read_log(&self, key: &str) -> Result<LogSlice, StoreError>;

    /// Current log length.
    async fn log_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Read a plain value. Expired values read as `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a value. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live values whose key starts with `prefix`, ordered by key.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Apply a batch as a single unit.
    async fn atomic(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;
}

/// Builds storage keys for a configurable prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn updates(&self, doc: &str) -> String {
        format!("{}:{doc}:updates", self.prefix)
    }

    pub fn snapshot(&self, doc: &str) -> String {
        format!("{}:{doc}:snapshot", self.prefix)
    }

    pub fn awareness(&self, doc: &str, client_id: u64) -> String {
        format!("{}{client_id}", self.awareness_prefix(doc))
    }

    pub fn awareness_prefix(&self, doc: &str) -> String {
        format!("{}:{doc}:awareness:", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("yjs")
    }
}
