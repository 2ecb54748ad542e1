//! Binary codec for the Yjs sync and awareness protocol.
//!
//! Wire format (every integer is a lib0 variable-length unsigned int):
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────────┐
//! │ msg_type     │ body                                             │
//! ├──────────────┼──────────────────────────────────────────────────┤
//! │ 0 sync       │ sub_type (0 step1 │ 1 step2 │ 2 update)          │
//! │              │ + length-prefixed payload                        │
//! │ 1 awareness  │ length-prefixed awareness update                 │
//! │ 2 auth       │ opaque auth body (passed through untouched)      │
//! │ 3 query      │ empty                                            │
//! └──────────────┴──────────────────────────────────────────────────┘
//! ```
//!
//! Awareness update payload:
//! ```text
//! [count] ( [client_id] [clock] [state_json] ) * count
//! ```
//! A `state_json` of `"null"` retracts the client's presence. Internally that
//! is carried as [`PresenceState::Removed`]; the string form only exists on
//! the wire.
//!
//! All functions here are pure: no I/O, no shared state.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Wire form of a removed presence state.
const REMOVED_STATE: &str = "null";

/// Outer message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    QueryAwareness = 3,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            2 => Ok(Self::Auth),
            3 => Ok(Self::QueryAwareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Inner sync sub-type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncType {
    /// Carries a state vector ("this is what I have").
    Step1 = 0,
    /// Carries an update answering a step1.
    Step2 = 1,
    /// Carries an incremental update.
    Update = 2,
}

impl TryFrom<u32> for SyncType {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Step1),
            1 => Ok(Self::Step2),
            2 => Ok(Self::Update),
            other => Err(ProtocolError::UnknownSyncType(other)),
        }
    }
}

/// Sync sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Step1(Vec<u8>),
    Step2(Vec<u8>),
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn sync_type(&self) -> SyncType {
        match self {
            SyncMessage::Step1(_) => SyncType::Step1,
            SyncMessage::Step2(_) => SyncType::Step2,
            SyncMessage::Update(_) => SyncType::Update,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::Step1(p) | SyncMessage::Step2(p) | SyncMessage::Update(p) => p,
        }
    }
}

/// A decoded protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Raw awareness update payload; see [`decode_presence_entries`].
    Awareness(Vec<u8>),
    /// Auth body, kept opaque.
    Auth(Vec<u8>),
    QueryAwareness,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Sync(_) => MessageType::Sync,
            Message::Awareness(_) => MessageType::Awareness,
            Message::Auth(_) => MessageType::Auth,
            Message::QueryAwareness => MessageType::QueryAwareness,
        }
    }

    /// Sync sub-type, if this is a sync message.
    pub fn sync_type(&self) -> Option<SyncType> {
        match self {
            Message::Sync(sync) => Some(sync.sync_type()),
            _ => None,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(self.message_type() as u32);
        match self {
            Message::Sync(sync) => {
                buf.write_var(sync.sync_type() as u32);
                buf.write_buf(sync.payload());
            }
            Message::Awareness(update) => buf.write_buf(update),
            Message::Auth(body) => buf.write_all(body),
            Message::QueryAwareness => {}
        }
        buf
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var()?;
        match MessageType::try_from(tag)? {
            MessageType::Sync => {
                let sub: u32 = cursor.read_var()?;
                let sync_type = SyncType::try_from(sub)?;
                let payload = cursor.read_buf()?.to_vec();
                Ok(Message::Sync(match sync_type {
                    SyncType::Step1 => SyncMessage::Step1(payload),
                    SyncType::Step2 => SyncMessage::Step2(payload),
                    SyncType::Update => SyncMessage::Update(payload),
                }))
            }
            MessageType::Awareness => Ok(Message::Awareness(cursor.read_buf()?.to_vec())),
            MessageType::Auth => {
                let mut body = Vec::with_capacity(bytes.len());
                while let Ok(byte) = cursor.read_u8() {
                    body.push(byte);
                }
                Ok(Message::Auth(body))
            }
            MessageType::QueryAwareness => Ok(Message::QueryAwareness),
        }
    }
}

/// Presence state of a single client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    /// JSON-encoded presence record.
    Present(String),
    /// The client has left.
    Removed,
}

impl PresenceState {
    /// Interpret a wire state string. Anything that parses as JSON `null` is a removal.
    pub fn from_wire(json: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(json) {
            Ok(serde_json::Value::Null) => PresenceState::Removed,
            _ => PresenceState::Present(json.to_owned()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            PresenceState::Present(json) => json,
            PresenceState::Removed => REMOVED_STATE,
        }
    }
}

/// One client row of an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: PresenceState,
}

impl PresenceEntry {
    pub fn present(client_id: u64, clock: u64, json: impl Into<String>) -> Self {
        Self {
            client_id,
            clock,
            state: PresenceState::Present(json.into()),
        }
    }

    pub fn removed(client_id: u64, clock: u64) -> Self {
        Self {
            client_id,
            clock,
            state: PresenceState::Removed,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.state == PresenceState::Removed
    }
}

/// Step1 carrying an empty state vector: "send me everything you have".
pub fn encode_request_all() -> Vec<u8> {
    Message::Sync(SyncMessage::Step1(StateVector::default().encode_v1())).encode()
}

/// Step2 carrying a full document state.
pub fn encode_state(update: &[u8]) -> Vec<u8> {
    Message::Sync(SyncMessage::Step2(update.to_vec())).encode()
}

/// Wrap an awareness update payload in an awareness envelope.
pub fn encode_presence(update: &[u8]) -> Vec<u8> {
    Message::Awareness(update.to_vec()).encode()
}

/// Awareness envelope retracting `client_id`.
///
/// Peers drop presence updates whose clock does not strictly increase, so the
/// removal is sent at `clock + 1`.
pub fn encode_presence_removal(client_id: u64, clock: u64) -> Vec<u8> {
    let entry = PresenceEntry::removed(client_id, clock.saturating_add(1));
    encode_presence(&encode_presence_entries(std::slice::from_ref(&entry)))
}

/// Build an awareness update payload for the given rows.
pub fn encode_presence_entries(entries: &[PresenceEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_var(entries.len() as u64);
    for entry in entries {
        buf.write_var(entry.client_id);
        buf.write_var(entry.clock);
        buf.write_string(entry.state.as_wire());
    }
    buf
}

/// Single-client awareness payload, as kept by the awareness store.
pub fn encode_presence_entry(entry: &PresenceEntry) -> Vec<u8> {
    encode_presence_entries(std::slice::from_ref(entry))
}

/// Parse an awareness update payload. A single message may describe many clients.
pub fn decode_presence_entries(update: &[u8]) -> Result<Vec<PresenceEntry>, ProtocolError> {
    let mut cursor = Cursor::new(update);
    let count: u64 = cursor.read_var()?;
    // Every row takes at least three bytes, which bounds bogus counts.
    let mut entries = Vec::with_capacity((count as usize).min(update.len() / 3));
    for _ in 0..count {
        let client_id: u64 = cursor.read_var()?;
        let clock: u64 = cursor.read_var()?;
        let json = cursor.read_string()?;
        entries.push(PresenceEntry {
            client_id,
            clock,
            state: PresenceState::from_wire(json),
        });
    }
    Ok(entries)
}

/// Convenience wrapper around [`Message::decode`].
pub fn decode_envelope(bytes: &[u8]) -> Result<Message, ProtocolError> {
    Message::decode(bytes)
}

/// Codec errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u32),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
