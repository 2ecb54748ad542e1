//! Stateless per-request session handler.
//!
//! Each call to [`SessionHandler::handle`] processes one batch of transport
//! events for one connection. The handler keeps no per-connection memory: the
//! only state that outlives a request is the gateway-held [`ConnectionMeta`]
//! and the storage backends.
//!
//! ```text
//! Open ──► Accept, subscribe(doc), step1(empty), step2(state)?, presence*
//!
//! Binary ─► decode ─┬─ sync/step1        ──► reply step2(state)
//!                   ├─ sync/step2|update ──► persist ──► publish frame
//!                   ├─ awareness         ──► store/bind ──► publish frame
//!                   ├─ query-awareness   ──► publish frame
//!                   └─ auth              ──► ignored
//!
//! Close ──► remove presence(client-id) ──► publish removal(clock + 1)
//! ```
//!
//! Storage failures are logged and the frame is still published: live peers
//! stay in sync, and the CRDT reconciles durability on the next sync.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::awareness::{AwarenessStore, DEFAULT_AWARENESS_TTL};
use crate::broadcast::Publisher;
use crate::config::RelayConfig;
use crate::gateway::{document_name, ConnectionMeta, InboundEvent, OutboundEvent, Request, Response};
use crate::persistence::{Persistence, PersistenceConfig};
use crate::protocol::{self, Message, PresenceEntry, SyncMessage};
use crate::storage::{Backend, KeySpace};

/// Request-level errors. Per-frame failures never surface here.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no document name in request path {0:?}")]
    MissingDocument(String),
}

/// Protocol state machine for relayed documents.
pub struct SessionHandler {
    persistence: Option<Persistence>,
    awareness: Option<AwarenessStore>,
    publisher: Arc<dyn Publisher>,
}

impl SessionHandler {
    pub fn builder(publisher: Arc<dyn Publisher>) -> SessionHandlerBuilder {
        SessionHandlerBuilder::new(publisher)
    }

    pub fn persistence(&self) -> Option<&Persistence> {
        self.persistence.as_ref()
    }

    pub fn awareness(&self) -> Option<&AwarenessStore> {
        self.awareness.as_ref()
    }

    /// Process one batch of events. Events after a close are ignored.
    pub async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let doc = document_name(&request.path)
            .ok_or_else(|| HandlerError::MissingDocument(request.path.clone()))?;
        let mut meta = request.meta;
        let mut response = Response::default();

        for event in request.events {
            match event {
                InboundEvent::Open => {
                    log::info!("Connection {} opened on {doc}", request.connection_id);
                    self.on_open(&doc, &mut response).await;
                }
                InboundEvent::Binary(frame) => {
                    self.on_frame(&doc, frame, &mut meta, &mut response).await;
                }
                InboundEvent::Text(text) => {
                    log::debug!(
                        "Ignoring {} byte text frame from {}",
                        text.len(),
                        request.connection_id
                    );
                }
                InboundEvent::Ping(payload) => {
                    response.events.push(OutboundEvent::Pong(payload));
                }
                InboundEvent::Close(code) => {
                    log::info!("Connection {} closed ({code:?})", request.connection_id);
                    self.on_close(&doc, &meta).await;
                    response.events.push(OutboundEvent::Close(code));
                    break;
                }
                InboundEvent::Disconnect => {
                    log::info!("Connection {} dropped", request.connection_id);
                    self.on_close(&doc, &meta).await;
                    break;
                }
            }
        }

        response.meta_updates = meta.changes();
        Ok(response)
    }

    async fn on_open(&self, doc: &str, response: &mut Response) {
        response.events.push(OutboundEvent::Accept);
        response.subscriptions.push(doc.to_owned());
        response
            .events
            .push(OutboundEvent::Binary(protocol::encode_request_all()));

        if let Some(state) = self.load_state(doc).await {
            response
                .events
                .push(OutboundEvent::Binary(protocol::encode_state(&state)));
        }

        if let Some(awareness) = &self.awareness {
            match awareness.get_all(doc).await {
                Ok(entries) => {
                    for blob in entries {
                        response
                            .events
                            .push(OutboundEvent::Binary(protocol::encode_presence(&blob)));
                    }
                }
                Err(e) => log::error!("Failed to load presence for {doc}: {e}"),
            }
        }
    }

    async fn on_frame(
        &self,
        doc: &str,
        frame: Vec<u8>,
        meta: &mut ConnectionMeta,
        response: &mut Response,
    ) {
        let message = match protocol::decode_envelope(&frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping undecodable frame on {doc}: {e}");
                return;
            }
        };
        log::trace!("{doc}: {:?} ({} bytes)", message.message_type(), frame.len());

        match message {
            Message::Sync(SyncMessage::Step1(_)) => {
                if let Some(state) = self.load_state(doc).await {
                    response
                        .events
                        .push(OutboundEvent::Binary(protocol::encode_state(&state)));
                }
            }
            Message::Sync(SyncMessage::Step2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                if let Some(persistence) = &self.persistence {
                    if let Err(e) = persistence.store_update(doc, update).await {
                        log::error!("Failed to persist update for {doc}: {e}");
                    }
                }
                self.publish(doc, frame).await;
            }
            Message::Awareness(payload) => {
                let entries = match protocol::decode_presence_entries(&payload) {
                    Ok(entries) => entries,
                    Err(e) => {
                        log::warn!("Dropping malformed presence on {doc}: {e}");
                        return;
                    }
                };
                for entry in &entries {
                    self.apply_presence(doc, entry, meta).await;
                }
                self.publish(doc, frame).await;
            }
            Message::QueryAwareness => self.publish(doc, frame).await,
            Message::Auth(_) => log::debug!("Ignoring auth message on {doc}"),
        }
    }

    async fn apply_presence(&self, doc: &str, entry: &PresenceEntry, meta: &mut ConnectionMeta) {
        if let Some(awareness) = &self.awareness {
            let result = if entry.is_removal() {
                awareness.remove(doc, entry.client_id).await.map(|_| ())
            } else {
                awareness
                    .set(doc, entry.client_id, protocol::encode_presence_entry(entry))
                    .await
            };
            if let Err(e) = result {
                log::error!(
                    "Failed to store presence {} for {doc}: {e}",
                    entry.client_id
                );
            }
        }

        if meta.client_id().is_none() && !entry.is_removal() {
            meta.set_client_id(entry.client_id);
        }
        if meta.client_id() == Some(entry.client_id) {
            meta.set_client_clock(entry.clock);
        }
    }

    async fn on_close(&self, doc: &str, meta: &ConnectionMeta) {
        let (Some(client_id), Some(clock)) = (meta.client_id(), meta.client_clock()) else {
            log::debug!("No bound presence on close of {doc}");
            return;
        };

        if let Some(awareness) = &self.awareness {
            if let Err(e) = awareness.remove(doc, client_id).await {
                log::error!("Failed to remove presence {client_id} for {doc}: {e}");
            }
        }
        self.publish(doc, protocol::encode_presence_removal(client_id, clock))
            .await;
    }

    async fn load_state(&self, doc: &str) -> Option<Vec<u8>> {
        let persistence = self.persistence.as_ref()?;
        match persistence.get_state(doc).await {
            Ok(state) => state,
            Err(e) => {
                log::error!("Failed to load state for {doc}: {e}");
                None
            }
        }
    }

    async fn publish(&self, channel: &str, frame: Vec<u8>) {
        if let Err(e) = self.publisher.publish(channel, Arc::new(frame)).await {
            log::error!("Failed to publish on {channel}: {e}");
        }
    }
}

/// Builder for [`SessionHandler`].
pub struct SessionHandlerBuilder {
    publisher: Arc<dyn Publisher>,
    backend: Option<Arc<dyn Backend>>,
    persistence_config: PersistenceConfig,
    awareness_ttl: Duration,
    with_persistence: bool,
    with_awareness: bool,
}

impl SessionHandlerBuilder {
    fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            backend: None,
            persistence_config: PersistenceConfig::default(),
            awareness_ttl: DEFAULT_AWARENESS_TTL,
            with_persistence: true,
            with_awareness: true,
        }
    }

    /// Storage for persistence and awareness. Without one, the handler only relays.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn persistence_config(mut self, config: PersistenceConfig) -> Self {
        self.persistence_config = config;
        self
    }

    pub fn awareness_ttl(mut self, ttl: Duration) -> Self {
        self.awareness_ttl = ttl;
        self
    }

    /// Apply prefix, compaction and TTL settings.
    pub fn config(self, config: &RelayConfig) -> Self {
        let ttl = config.awareness_ttl();
        self.persistence_config(config.persistence_config())
            .awareness_ttl(ttl)
    }

    pub fn without_persistence(mut self) -> Self {
        self.with_persistence = false;
        self
    }

    pub fn without_awareness(mut self) -> Self {
        self.with_awareness = false;
        self
    }

    pub fn build(self) -> SessionHandler {
        let keys = KeySpace::new(self.persistence_config.key_prefix.clone());
        let persistence = match &self.backend {
            Some(backend) if self.with_persistence => {
                Some(Persistence::new(backend.clone(), self.persistence_config))
            }
            _ => None,
        };
        let awareness = match self.backend {
            Some(backend) if self.with_awareness => {
                Some(AwarenessStore::new(backend, keys, self.awareness_ttl))
            }
            _ => None,
        };

        SessionHandler {
            persistence,
            awareness,
            publisher: self.publisher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::RoomManager;
    use crate::gateway::META_CLIENT_CLOCK;
    use crate::storage::MemoryBackend;

    fn handler() -> (SessionHandler, Arc<RoomManager>) {
        let rooms = Arc::new(RoomManager::default());
        let handler = SessionHandler::builder(rooms.clone())
            .backend(Arc::new(MemoryBackend::new()))
            .build();
        (handler, rooms)
    }

    fn presence_frame(entries: &[PresenceEntry]) -> Vec<u8> {
        protocol::encode_presence(&protocol::encode_presence_entries(entries))
    }

    #[tokio::test]
    async fn test_missing_document_is_rejected() {
        let (handler, _) = handler();
        let err = handler.handle(Request::new("c", "/")).await.unwrap_err();
        assert!(matches!(err, HandlerError::MissingDocument(_)));
    }

    #[tokio::test]
    async fn test_open_on_empty_document() {
        let (handler, _) = handler();
        let response = handler
            .handle(Request::new("c", "/doc").with_event(InboundEvent::Open))
            .await
            .unwrap();

        assert_eq!(response.events[0], OutboundEvent::Accept);
        assert_eq!(response.subscriptions, vec!["doc".to_string()]);
        let frames: Vec<&[u8]> = response.binary_frames().collect();
        assert_eq!(frames, vec![protocol::encode_request_all().as_slice()]);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (handler, _) = handler();
        let response = handler
            .handle(Request::new("c", "/doc").with_event(InboundEvent::Ping(vec![9])))
            .await
            .unwrap();
        assert_eq!(response.events, vec![OutboundEvent::Pong(vec![9])]);
    }

    #[tokio::test]
    async fn test_first_present_entry_binds_client() {
        let (handler, _) = handler();
        let frame = presence_frame(&[
            PresenceEntry::removed(5, 9),
            PresenceEntry::present(7, 3, "{}"),
            PresenceEntry::present(8, 1, "{}"),
        ]);
        let response = handler
            .handle(Request::new("c", "/doc").with_event(InboundEvent::Binary(frame)))
            .await
            .unwrap();

        assert_eq!(response.meta_updates.get("client-id").map(String::as_str), Some("7"));
        assert_eq!(
            response.meta_updates.get(META_CLIENT_CLOCK).map(String::as_str),
            Some("3")
        );
    }

    #[tokio::test]
    async fn test_bound_client_refreshes_clock_only() {
        let (handler, _) = handler();
        let meta = ConnectionMeta::from_pairs([("client-id", "7"), ("client-clock", "3")]);
        let frame = presence_frame(&[
            PresenceEntry::present(8, 20, "{}"),
            PresenceEntry::present(7, 4, "{}"),
        ]);
        let response = handler
            .handle(
                Request::new("c", "/doc")
                    .with_meta(meta)
                    .with_event(InboundEvent::Binary(frame)),
            )
            .await
            .unwrap();

        assert_eq!(response.meta_updates.len(), 1);
        assert_eq!(
            response.meta_updates.get(META_CLIENT_CLOCK).map(String::as_str),
            Some("4")
        );
    }

    #[tokio::test]
    async fn test_close_without_binding_publishes_nothing() {
        let (handler, rooms) = handler();
        let mut rx = rooms.subscribe("doc", "other").await;

        let response = handler
            .handle(Request::new("c", "/doc").with_event(InboundEvent::Close(Some(1000))))
            .await
            .unwrap();

        assert_eq!(response.events, vec![OutboundEvent::Close(Some(1000))]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_after_close_are_ignored() {
        let (handler, _) = handler();
        let response = handler
            .handle(
                Request::new("c", "/doc")
                    .with_event(InboundEvent::Disconnect)
                    .with_event(InboundEvent::Ping(vec![])),
            )
            .await
            .unwrap();
        assert!(response.events.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let (handler, rooms) = handler();
        let mut rx = rooms.subscribe("doc", "other").await;

        let response = handler
            .handle(
                Request::new("c", "/doc")
                    .with_event(InboundEvent::Binary(vec![9, 9]))
                    .with_event(InboundEvent::Binary(vec![3])),
            )
            .await
            .unwrap();

        assert!(response.events.is_empty());
        // The query-awareness frame after the bad one still goes out.
        assert_eq!(*rx.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_relay_only_handler() {
        let rooms = Arc::new(RoomManager::default());
        let handler = SessionHandler::builder(rooms.clone()).build();
        assert!(handler.persistence().is_none());
        assert!(handler.awareness().is_none());

        let response = handler
            .handle(Request::new("c", "/doc").with_event(InboundEvent::Open))
            .await
            .unwrap();
        assert_eq!(response.binary_frames().count(), 1);
    }
}
