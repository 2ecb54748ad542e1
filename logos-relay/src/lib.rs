//! # logos-relay - Stateless Yjs relay for Logos
//!
//! Relays CRDT edits and presence between clients behind a connection
//! gateway, and persists merged document state without holding documents in
//! memory between requests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  ws   ┌─────────────┐  Request{events, meta}  ┌────────────────┐
//! │ Yjs client  │ ◄───► │  Gateway    │ ──────────────────────► │ SessionHandler │
//! └─────────────┘       │ (external)  │ ◄────────────────────── │  (stateless)   │
//!                       └──────▲──────┘  Response{events, ...}  └───┬────────┬───┘
//!                              │                                    │        │
//!                              │ publish(doc, frame)      ┌─────────▼──┐  ┌──▼──────────┐
//!                              └──────────────────────────┤ Publisher  │  │ Persistence │
//!                                                         └────────────┘  │ Awareness   │
//!                                                                         └──────┬──────┘
//!                                                                                │
//!                                                                         ┌──────▼──────┐
//!                                                                         │ dyn Backend │
//!                                                                         │ Memory/Rocks│
//!                                                                         └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: y-protocols sync/awareness wire codec
//! - [`merge`]: update merging via a scratch Yrs document
//! - [`storage`]: backend trait, key layout, in-memory and RocksDB backends
//! - [`persistence`]: update log + snapshot with threshold compaction
//! - [`awareness`]: TTL-bound presence entries
//! - [`gateway`]: request/response shapes and connection metadata
//! - [`broadcast`]: publish seam and in-process channel hub
//! - [`session`]: the per-request protocol state machine
//! - [`config`]: configuration and backend construction

pub mod awareness;
pub mod broadcast;
pub mod config;
pub mod gateway;
pub mod merge;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use awareness::AwarenessStore;
pub use broadcast::{BroadcastGroup, BroadcastStats, PublishError, Publisher, RoomManager};
pub use config::{ConfigError, RelayConfig, StorageTarget};
pub use gateway::{ConnectionMeta, InboundEvent, OutboundEvent, Request, Response};
pub use merge::{merge_updates, MergeError};
pub use persistence::{
    CompactionMode, CompactionReport, Persistence, PersistenceConfig, PersistenceError,
};
pub use protocol::{
    Message, MessageType, PresenceEntry, PresenceState, ProtocolError, SyncMessage, SyncType,
};
pub use session::{HandlerError, SessionHandler, SessionHandlerBuilder};
pub use storage::{
    Backend, BatchOp, KeySpace, LogSlice, MemoryBackend, RocksBackend, StoreConfig, StoreError,
};
