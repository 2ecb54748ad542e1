//! Channel fan-out.
//!
//! The relay publishes frames to a channel named after the document and never
//! delivers them itself; the gateway's pub/sub does. [`Publisher`] is that
//! seam. [`RoomManager`] is an in-process implementation on tokio broadcast
//! channels, for embedding the relay in one process and for tests.
//!
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` messages; lagging receivers drop the oldest.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Default per-subscriber buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Publish errors.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Delivers a payload to every subscriber of a channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the number of subscribers reached, when known.
    async fn publish(&self, channel: &str, payload: Arc<Vec<u8>>) -> Result<usize, PublishError>;
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Messages published while nobody was subscribed
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the publish path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribers of one channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connection ids subscribed to this channel
    peers: RwLock<HashSet<String>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection. Returns its receiver.
    pub async fn add_peer(&self, connection_id: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.peers.write().await.insert(connection_id.to_owned());
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &str) -> bool {
        self.peers.write().await.remove(connection_id)
    }

    /// Send pre-encoded bytes to every receiver, including the sender's own.
    pub fn broadcast_raw(&self, payload: Arc<Vec<u8>>) -> usize {
        self.atomic_stats
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        match self.sender.send(payload) {
            Ok(count) => count,
            Err(_) => {
                self.atomic_stats
                    .messages_dropped
                    .fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, connection_id: &str) -> bool {
        self.peers.read().await.contains(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps channel names to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for a channel.
    pub async fn get_or_create(&self, channel: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().await.get(channel) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(channel.to_owned())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(channel).cloned()
    }

    /// Subscribe a connection to a channel.
    pub async fn subscribe(
        &self,
        channel: &str,
        connection_id: &str,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.get_or_create(channel).await.add_peer(connection_id).await
    }

    /// Unsubscribe a connection, dropping the channel once it is empty.
    pub async fn unsubscribe(&self, channel: &str, connection_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(channel) else {
            return;
        };
        room.remove_peer(connection_id).await;
        if room.peer_count().await == 0 {
            rooms.remove(channel);
            log::debug!("Closed empty channel {channel}");
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Publisher for RoomManager {
    async fn publish(&self, channel: &str, payload: Arc<Vec<u8>>) -> Result<usize, PublishError> {
        match self.get(channel).await {
            Some(room) => Ok(room.broadcast_raw(payload)),
            None => {
                log::trace!("No subscribers on {channel}");
                Ok(0)
            }
        }
    }
}
