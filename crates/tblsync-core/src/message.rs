//! Gossip messages.
//!
//! On the wire every message is a JSON object with a `type` string. The
//! transport only ever looks at that tag; everything else is carried in
//! `fields` for the driver to interpret via [`SyncMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entry::{EntryError, HostEntry};

/// Largest datagram the transport reads.
pub const MAX_DATAGRAM: usize = 1500;

pub const RESYNC: &str = "resync";
pub const REFRESH: &str = "refresh";
pub const UPDATE: &str = "update";
pub const REQUEST: &str = "request";

/// A decoded datagram: a type tag plus whatever else the object carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Synthetic full-resync tick.
    pub fn resync() -> Self {
        Self::new(RESYNC)
    }

    /// Synthetic local-refresh tick.
    pub fn refresh() -> Self {
        Self::new(REFRESH)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

// ── Domain messages ───────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("{0} message has no entry")]
    MissingEntry(String),
    #[error("invalid entry: {0}")]
    InvalidEntry(#[from] EntryError),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
}

/// The message types the sync driver understands.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Timer: time for a full anti-entropy round.
    Resync,
    /// Timer: re-read local neighbor state.
    Refresh,
    /// A peer's version of one entry.
    Update(HostEntry),
    /// A peer asking for our whole table.
    Request,
}

impl SyncMessage {
    pub fn to_message(&self) -> Message {
        match self {
            SyncMessage::Resync => Message::resync(),
            SyncMessage::Refresh => Message::refresh(),
            SyncMessage::Update(entry) => {
                Message::new(UPDATE).with_field("entry", entry.to_attributes())
            }
            SyncMessage::Request => Message::new(REQUEST),
        }
    }
}

impl TryFrom<&Message> for SyncMessage {
    type Error = MessageError;

    fn try_from(msg: &Message) -> Result<Self, Self::Error> {
        match msg.kind.as_str() {
            RESYNC => Ok(SyncMessage::Resync),
            REFRESH => Ok(SyncMessage::Refresh),
            REQUEST => Ok(SyncMessage::Request),
            UPDATE => {
                let attrs = msg
                    .get("entry")
                    .ok_or_else(|| MessageError::MissingEntry(msg.kind.clone()))?;
                Ok(SyncMessage::Update(HostEntry::from_attributes(attrs)?))
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}
