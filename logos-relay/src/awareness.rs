//! Presence store with per-entry expiry.
//!
//! One entry per (document, client id), holding the single-client awareness
//! payload last seen from that client. Entries are refreshed on every update
//! and deleted on graceful disconnect; the TTL covers clients that vanish
//! without saying goodbye.

use std::sync::Arc;
use std::time::Duration;

use crate::storage::{Backend, KeySpace, StoreError};

/// Default entry lifetime, matching the presence heartbeat cadence.
pub const DEFAULT_AWARENESS_TTL: Duration = Duration::from_secs(30);

/// TTL-bound presence entries keyed by document and client id.
pub struct AwarenessStore {
    backend: Arc<dyn Backend>,
    keys: KeySpace,
    ttl: Duration,
}

impl AwarenessStore {
    pub fn new(backend: Arc<dyn Backend>, keys: KeySpace, ttl: Duration) -> Self {
        Self { backend, keys, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// All live presence blobs for a document, ordered by client id.
    pub async fn get_all(&self, doc: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self
            .entries(doc)
            .await?
            .into_iter()
            .map(|(_, blob)| blob)
            .collect())
    }

    /// Live entries as `(client_id, blob)`, ordered by client id.
    pub async fn entries(&self, doc: &str) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let prefix = self.keys.awareness_prefix(doc);
        let mut entries: Vec<(u64, Vec<u8>)> = self
            .backend
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|(key, blob)| {
                let id = key.strip_prefix(&prefix)?.parse().ok()?;
                Some((id, blob))
            })
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        Ok(entries)
    }

    /// Upsert an entry and restart its TTL.
    pub async fn set(&self, doc: &str, client_id: u64, blob: Vec<u8>) -> Result<(), StoreError> {
        self.backend
            .set_ex(&self.keys.awareness(doc, client_id), blob, self.ttl)
            .await
    }

    /// Delete an entry. Returns whether one was present.
    pub async fn remove(&self, doc: &str, client_id: u64) -> Result<bool, StoreError> {
        self.backend
            .delete(&self.keys.awareness(doc, client_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn store() -> AwarenessStore {
        AwarenessStore::new(
            Arc::new(MemoryBackend::new()),
            KeySpace::default(),
            DEFAULT_AWARENESS_TTL,
        )
    }

    #[tokio::test]
    async fn test_empty_document_has_no_entries() {
        assert!(store().get_all("d").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ordered_by_numeric_client_id() {
        let s = store();
        s.set("d", 10, b"ten".to_vec()).await.unwrap();
        s.set("d", 9, b"nine".to_vec()).await.unwrap();
        s.set("other", 1, b"elsewhere".to_vec()).await.unwrap();

        let all = s.get_all("d").await.unwrap();
        assert_eq!(all, vec![b"nine".to_vec(), b"ten".to_vec()]);
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let s = store();
        s.set("d", 1, b"old".to_vec()).await.unwrap();
        s.set("d", 1, b"new".to_vec()).await.unwrap();
        assert_eq!(s.get_all("d").await.unwrap(), vec![b"new".to_vec()]);
    }

    #[tokio::test]
    async fn test_remove_absent_is_ok() {
        let s = store();
        assert!(!s.remove("d", 5).await.unwrap());
        s.set("d", 5, vec![1]).await.unwrap();
        assert!(s.remove("d", 5).await.unwrap());
        assert!(s.get_all("d").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let s = store();
        s.set("d", 1, vec![1]).await.unwrap();
        assert_eq!(s.get_all("d").await.unwrap().len(), 1);

        tokio::time::advance(DEFAULT_AWARENESS_TTL + Duration::from_millis(1)).await;
        assert!(s.get_all("d").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_ttl() {
        let s = store();
        s.set("d", 1, vec![1]).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        s.set("d", 1, vec![2]).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(s.get_all("d").await.unwrap(), vec![vec![2]]);
    }
}
