//! In-process backend.
//!
//! Holds logs and values behind one async mutex, so every operation is
//! trivially atomic. Expiry uses the tokio clock, which lets tests drive TTLs
//! with a paused runtime.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Backend, BatchOp, LogSlice, StoreError};

#[derive(Debug, Default)]
struct Log {
    next_sequence: u64,
    entries: Vec<(u64, Vec<u8>)>,
}

#[derive(Debug)]
struct Value {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Value {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct State {
    logs: HashMap<String, Log>,
    values: BTreeMap<String, Value>,
}

impl State {
    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Put { key, value } => {
                self.values.insert(
                    key,
                    Value {
                        bytes: value,
                        expires_at: None,
                    },
                );
            }
            BatchOp::ClearLog { key } => {
                if let Some(log) = self.logs.get_mut(&key) {
                    log.entries.clear();
                }
            }
            BatchOp::TrimLog { key, through } => {
                if let Some(log) = self.logs.get_mut(&key) {
                    log.entries.retain(|(seq, _)| *seq > through);
                }
            }
        }
    }
}

/// Backend kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn append(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let log = state.logs.entry(key.to_owned()).or_default();
        let seq = log.next_sequence;
        log.next_sequence += 1;
        log.entries.push((seq, value));
        Ok(log.entries.len())
    }

    async fn read_log(&self, key: &str) -> Result<LogSlice, StoreError> {
        let state = self.state.lock().await;
        let Some(log) = state.logs.get(key) else {
            return Ok(LogSlice::default());
        };
        Ok(LogSlice {
            entries: log.entries.iter().map(|(_, v)| v.clone()).collect(),
            fence: log.entries.last().map(|(seq, _)| *seq),
        })
    }

    async fn log_len(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.logs.get(key).map_or(0, |log| log.entries.len()))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.values.get(key) {
            Some(value) if value.is_live(now) => return Ok(Some(value.bytes.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        state.values.remove(key);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.values.insert(
            key.to_owned(),
            Value {
                bytes: value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .values
            .remove(key)
            .is_some_and(|value| value.is_live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for (key, value) in state.values.range(prefix.to_owned()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if value.is_live(now) {
                live.push((key.clone(), value.bytes.clone()));
            } else {
                expired.push(key.clone());
            }
        }
        for key in expired {
            state.values.remove(&key);
        }
        Ok(live)
    }

    async fn atomic(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for op in ops {
            state.apply(op);
        }
        Ok(())
    }
}
