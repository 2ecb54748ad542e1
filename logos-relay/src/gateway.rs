//! Request/response shapes exchanged with the connection gateway.
//!
//! The gateway terminates the real WebSocket and hands the relay one request
//! per batch of transport events. Anything the relay must remember about a
//! connection travels in [`ConnectionMeta`]: it arrives with the request and
//! the fields the relay changed go back in [`Response::meta_updates`].
//!
//! ```text
//! client ──ws──► gateway ──Request{events, meta}──► SessionHandler
//!                   ▲                                     │
//!                   └──Response{events, meta_updates}─────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use url::Url;

/// Metadata key for the bound presence client id.
pub const META_CLIENT_ID: &str = "client-id";
/// Metadata key for the last presence clock seen from the bound client.
pub const META_CLIENT_CLOCK: &str = "client-clock";

/// Transport event delivered by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Open,
    Binary(Vec<u8>),
    Text(String),
    Ping(Vec<u8>),
    /// Client sent a close frame, with its status code if any.
    Close(Option<u16>),
    /// Connection dropped without a close frame.
    Disconnect,
}

/// Transport event for the gateway to deliver to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Accept,
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<u16>),
}

/// Connection-scoped key/value metadata held by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMeta {
    values: BTreeMap<String, String>,
    changed: BTreeSet<String>,
}

impl ConnectionMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata as received from the gateway. Nothing is marked changed.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            changed: BTreeSet::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.values.get(&key) != Some(&value) {
            self.changed.insert(key.clone());
            self.values.insert(key, value);
        }
    }

    /// Bound client id, if present and numeric.
    pub fn client_id(&self) -> Option<u64> {
        self.get(META_CLIENT_ID)?.parse().ok()
    }

    /// Last presence clock, if present and numeric.
    pub fn client_clock(&self) -> Option<u64> {
        self.get(META_CLIENT_CLOCK)?.parse().ok()
    }

    pub fn set_client_id(&mut self, client_id: u64) {
        self.set(META_CLIENT_ID, client_id.to_string());
    }

    pub fn set_client_clock(&mut self, clock: u64) {
        self.set(META_CLIENT_CLOCK, clock.to_string());
    }

    /// Fields modified since this value was received.
    pub fn changes(&self) -> BTreeMap<String, String> {
        self.changed
            .iter()
            .filter_map(|key| Some((key.clone(), self.values.get(key)?.clone())))
            .collect()
    }
}

/// One batch of events for one connection.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub connection_id: String,
    /// Request path, e.g. `/collab/my-doc?token=...`
    pub path: String,
    pub meta: ConnectionMeta,
    pub events: Vec<InboundEvent>,
}

impl Request {
    pub fn new(connection_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, meta: ConnectionMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_event(mut self, event: InboundEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// What the gateway should do for the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub events: Vec<OutboundEvent>,
    /// Metadata fields to persist for the connection.
    pub meta_updates: BTreeMap<String, String>,
    /// Channels to subscribe the connection to.
    pub subscriptions: Vec<String>,
}

impl Response {
    /// Payloads of the binary frames, in send order.
    pub fn binary_frames(&self) -> impl Iterator<Item = &[u8]> {
        self.events.iter().filter_map(|event| match event {
            OutboundEvent::Binary(frame) => Some(frame.as_slice()),
            _ => None,
        })
    }
}

/// Document name from a request path: the last non-empty segment, query and
/// fragment ignored.
pub fn document_name(path: &str) -> Option<String> {
    let base = Url::parse("http://gateway.invalid/").ok()?;
    let url = base.join(path).ok()?;
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_owned)
}
