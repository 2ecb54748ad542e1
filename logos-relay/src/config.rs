//! Relay configuration.
//!
//! ```json
//! {
//!   "key_prefix": "yjs",
//!   "compaction_threshold": 100,
//!   "compaction_mode": "clear-log",
//!   "awareness_ttl_secs": 30,
//!   "storage_url": "rocksdb:///var/lib/relay"
//! }
//! ```
//!
//! Every field is optional. `storage_url` accepts `memory://` and
//! `rocksdb://<path>`; a pre-built backend can be handed to
//! [`SessionHandlerBuilder::backend`](crate::session::SessionHandlerBuilder::backend)
//! instead.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::awareness::DEFAULT_AWARENESS_TTL;
use crate::persistence::{CompactionMode, PersistenceConfig, DEFAULT_COMPACTION_THRESHOLD};
use crate::storage::{Backend, MemoryBackend, RocksBackend, StoreConfig, StoreError};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid storage url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported storage scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where documents and presence are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Memory,
    RocksDb(PathBuf),
}

/// Top-level relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Storage key prefix (default: `yjs`)
    pub key_prefix: String,
    /// Pending updates that trigger compaction; 0 disables (default: 100)
    pub compaction_threshold: usize,
    /// Log trimming on compaction (default: `clear-log`)
    pub compaction_mode: CompactionMode,
    /// Presence entry lifetime in seconds (default: 30)
    pub awareness_ttl_secs: u64,
    /// Backing store (default: `memory://`)
    pub storage_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            key_prefix: "yjs".into(),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            compaction_mode: CompactionMode::default(),
            awareness_ttl_secs: DEFAULT_AWARENESS_TTL.as_secs(),
            storage_url: "memory://".into(),
        }
    }
}

impl RelayConfig {
    /// Config for testing (in-memory, compacts early).
    pub fn for_testing() -> Self {
        Self {
            compaction_threshold: 10,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("key_prefix must not be empty".into()));
        }
        if self.awareness_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "awareness_ttl_secs must be positive".into(),
            ));
        }
        self.storage_target().map(|_| ())
    }

    pub fn awareness_ttl(&self) -> Duration {
        Duration::from_secs(self.awareness_ttl_secs)
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            key_prefix: self.key_prefix.clone(),
            compaction_threshold: self.compaction_threshold,
            compaction_mode: self.compaction_mode,
        }
    }

    /// Interpret `storage_url`.
    pub fn storage_target(&self) -> Result<StorageTarget, ConfigError> {
        let url = Url::parse(&self.storage_url)?;
        match url.scheme() {
            "memory" => Ok(StorageTarget::Memory),
            "rocksdb" => {
                if url.host_str().is_some_and(|host| !host.is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "rocksdb url must not name a host: {}",
                        self.storage_url
                    )));
                }
                if url.path().is_empty() || url.path() == "/" {
                    return Err(ConfigError::Invalid(format!(
                        "rocksdb url needs a path: {}",
                        self.storage_url
                    )));
                }
                Ok(StorageTarget::RocksDb(PathBuf::from(url.path())))
            }
            other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
    }

    /// Open the configured backend.
    pub fn open_backend(&self) -> Result<Arc<dyn Backend>, ConfigError> {
        match self.storage_target()? {
            StorageTarget::Memory => Ok(Arc::new(MemoryBackend::new())),
            StorageTarget::RocksDb(path) => {
                let store = RocksBackend::open(StoreConfig {
                    path,
                    ..Default::default()
                })?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.key_prefix, "yjs");
        assert_eq!(config.compaction_threshold, 100);
        assert_eq!(config.compaction_mode, CompactionMode::ClearLog);
        assert_eq!(config.awareness_ttl(), Duration::from_secs(30));
        assert_eq!(config.storage_target().unwrap(), StorageTarget::Memory);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            RelayConfig::from_json(r#"{"compaction_threshold": 0, "compaction_mode": "fenced"}"#)
                .unwrap();
        assert_eq!(config.compaction_threshold, 0);
        assert_eq!(config.compaction_mode, CompactionMode::Fenced);
        assert_eq!(config.key_prefix, "yjs");
        assert_eq!(config.persistence_config().compaction_threshold, 0);
    }

    #[test]
    fn test_rocksdb_url() {
        let config = RelayConfig {
            storage_url: "rocksdb:///var/lib/relay".into(),
            ..Default::default()
        };
        assert_eq!(
            config.storage_target().unwrap(),
            StorageTarget::RocksDb(PathBuf::from("/var/lib/relay"))
        );
    }

    #[test]
    fn test_rejects_bad_storage() {
        let scheme = RelayConfig {
            storage_url: "redis://localhost:6379".into(),
            ..Default::default()
        };
        assert!(matches!(
            scheme.storage_target(),
            Err(ConfigError::UnsupportedScheme(s)) if s == "redis"
        ));

        let host = RelayConfig {
            storage_url: "rocksdb://somehost/data".into(),
            ..Default::default()
        };
        assert!(matches!(host.storage_target(), Err(ConfigError::Invalid(_))));

        assert!(matches!(
            RelayConfig::from_json(r#"{"storage_url": "not a url"}"#),
            Err(ConfigError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(RelayConfig::from_json(r#"{"key_prefix": ""}"#).is_err());
        assert!(RelayConfig::from_json(r#"{"awareness_ttl_secs": 0}"#).is_err());
        assert!(matches!(
            RelayConfig::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_open_rocksdb_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            storage_url: format!("rocksdb://{}", dir.path().join("db").display()),
            ..Default::default()
        };
        assert!(config.open_backend().is_ok());
    }
}
