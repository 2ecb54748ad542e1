//! Update-log + snapshot persistence for relayed documents.
//!
//! Storage is treated as one more CRDT peer: every update a client sends is
//! appended to the document's log, and once the log reaches the configured
//! threshold it is folded into a snapshot.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  <prefix>:<doc>:snapshot    merged base      │
//! │  <prefix>:<doc>:updates     u1 ◄─ u2 ◄─ uN   │
//! │                                              │
//! │  get_state = merge(snapshot, u1..uN)         │
//! │  compact   = snapshot := merge(...), trim log│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Compaction and concurrent writers
//!
//! Compaction reads the log, merges, then commits snapshot + log trim as one
//! atomic batch. With [`CompactionMode::ClearLog`] the commit clears the whole
//! log, so an update appended between the read and the commit is dropped.
//! [`CompactionMode::Fenced`] trims only through the last entry that was read.
//! Compactions issued through one `Persistence` are serialized; separate
//! processes compacting the same document are not coordinated.
//!
//! Reads take the log before the snapshot. A compaction that commits between
//! the two reads is then covered: its snapshot already contains the entries
//! that vanished from the log, and merging them twice is harmless.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (Log-Structured Storage)

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::merge::{self, MergeError};
use crate::storage::{Backend, BatchOp, KeySpace, StoreError};

/// Default number of pending updates that triggers compaction.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 100;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// How a compaction commit removes folded entries from the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionMode {
    /// Clear the entire log. Appends racing with the compaction are lost.
    #[default]
    ClearLog,
    /// Trim only the entries read during compaction.
    Fenced,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Key prefix (default: `yjs`)
    pub key_prefix: String,
    /// Log length that triggers compaction; 0 disables it (default: 100)
    pub compaction_threshold: usize,
    pub compaction_mode: CompactionMode,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: "yjs".into(),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            compaction_mode: CompactionMode::default(),
        }
    }
}

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Log entries folded into the snapshot
    pub entries: usize,
    /// Size of the new snapshot in bytes
    pub snapshot_bytes: usize,
}

/// Snapshot computed from one read of the log, not yet committed.
#[derive(Debug)]
struct CompactionPlan {
    snapshot: Vec<u8>,
    entries: usize,
    fence: Option<u64>,
}

/// Persistence provider for relayed documents.
pub struct Persistence {
    backend: Arc<dyn Backend>,
    keys: KeySpace,
    compaction_threshold: usize,
    compaction_mode: CompactionMode,
    compaction_lock: Mutex<()>,
}

impl Persistence {
    pub fn new(backend: Arc<dyn Backend>, config: PersistenceConfig) -> Self {
        Self {
            backend,
            keys: KeySpace::new(config.key_prefix),
            compaction_threshold: config.compaction_threshold,
            compaction_mode: config.compaction_mode,
            compaction_lock: Mutex::new(()),
        }
    }

    pub fn compaction_threshold(&self) -> usize {
        self.compaction_threshold
    }

    pub fn compaction_mode(&self) -> CompactionMode {
        self.compaction_mode
    }

    /// Merged state of a document, or `None` if nothing was ever stored.
    pub async fn get_state(&self, doc: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let log = self.backend.read_log(&self.keys.updates(doc)).await?;
        let snapshot = self.backend.get(&self.keys.snapshot(doc)).await?;

        let merged = merge::merge_updates(snapshot.iter().chain(log.entries.iter()))?;
        log::trace!(
            "Loaded {doc}: snapshot={} log={}",
            snapshot.is_some(),
            log.len()
        );
        Ok(merged)
    }

    /// Append an update, compacting inline once the threshold is reached.
    ///
    /// Undecodable blobs are rejected before they reach the log.
    pub async fn store_update(&self, doc: &str, update: Vec<u8>) -> Result<(), PersistenceError> {
        merge::validate_update(&update)?;

        let len = self
            .backend
            .append(&self.keys.updates(doc), update)
            .await?;

        if self.compaction_threshold > 0 && len >= self.compaction_threshold {
            if let Some(report) = self.compact(doc).await? {
                log::info!(
                    "Compacted {doc}: {} updates -> {} byte snapshot",
                    report.entries,
                    report.snapshot_bytes
                );
            }
        }
        Ok(())
    }

    /// Fold the log into the snapshot. `None` if the log was empty.
    pub async fn compact(&self, doc: &str) -> Result<Option<CompactionReport>, PersistenceError> {
        let _guard = self.compaction_lock.lock().await;
        match self.plan_compaction(doc).await? {
            Some(plan) => self.commit_compaction(doc, plan).await.map(Some),
            None => Ok(None),
        }
    }

    /// Current number of pending log entries.
    pub async fn log_len(&self, doc: &str) -> Result<usize, PersistenceError> {
        Ok(self.backend.log_len(&self.keys.updates(doc)).await?)
    }

    async fn plan_compaction(&self, doc: &str) -> Result<Option<CompactionPlan>, PersistenceError> {
        let log = self.backend.read_log(&self.keys.updates(doc)).await?;
        if log.is_empty() {
            return Ok(None);
        }
        let snapshot = self.backend.get(&self.keys.snapshot(doc)).await?;

        let Some(merged) = merge::merge_updates(snapshot.iter().chain(log.entries.iter()))? else {
            return Ok(None);
        };
        Ok(Some(CompactionPlan {
            snapshot: merged,
            entries: log.len(),
            fence: log.fence,
        }))
    }

    async fn commit_compaction(
        &self,
        doc: &str,
        plan: CompactionPlan,
    ) -> Result<CompactionReport, PersistenceError> {
        let updates = self.keys.updates(doc);
        let trim = match (self.compaction_mode, plan.fence) {
            (CompactionMode::Fenced, Some(through)) => BatchOp::TrimLog {
                key: updates,
                through,
            },
            _ => BatchOp::ClearLog { key: updates },
        };

        let report = CompactionReport {
            entries: plan.entries,
            snapshot_bytes: plan.snapshot.len(),
        };
        self.backend
            .atomic(vec![
                BatchOp::Put {
                    key: self.keys.snapshot(doc),
                    value: plan.snapshot,
                },
                trim,
            ])
            .await?;
        Ok(report)
    }
}
