//! Binary protocol for document synchronization.
//!
//! Wire format:
//! ```text
//! ┌───────────────┬─────────────────────────────────────────────┐
//! │ discriminator │ payload                                     │
//! │ 1 byte        │ bincode (standard config, varint lengths)   │
//! └───────────────┴─────────────────────────────────────────────┘
//!
//! 0 = SYNC       { step, file, state vector | delta }
//! 1 = AWARENESS  { [(client_id, clock, state | removal)] }
//! ```
//!
//! Text frames carrying `"ping"` are answered with `"pong"` and never reach
//! the sync layer.

use serde::{Deserialize, Serialize};

use crate::presence::{ClientId, PresenceState};

/// Liveness probe sent as a text frame.
pub const PING: &str = "ping";
/// Reply to [`PING`].
pub const PONG: &str = "pong";

/// Upper bound for a decoded payload. Guards against hostile length prefixes.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame discriminator, the first byte of every binary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Sub-document state reconciliation and incremental deltas
    Sync = 0,
    /// Ephemeral presence entries
    Awareness = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Sub-protocol step inside a SYNC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStep {
    /// Sender's state vector for `file`
    Step1,
    /// Diff computed against a received state vector
    Step2,
    /// Incremental delta produced by an edit
    Update,
}

/// A SYNC payload addressed to one sub-document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub step: SyncStep,
    /// Sub-document name (the file path inside the project)
    pub file: String,
    /// Encoded state vector (Step1) or encoded yrs v1 update (Step2, Update)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn step1(file: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self { step: SyncStep::Step1, file: file.into(), payload: state_vector }
    }

    pub fn step2(file: impl Into<String>, diff: Vec<u8>) -> Self {
        Self { step: SyncStep::Step2, file: file.into(), payload: diff }
    }

    pub fn update(file: impl Into<String>, delta: Vec<u8>) -> Self {
        Self { step: SyncStep::Update, file: file.into(), payload: delta }
    }
}

/// One awareness entry on the wire. `state == None` encodes a removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    /// Per-client Lamport clock; higher wins
    pub clock: u32,
    pub state: Option<PresenceState>,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }
}

/// An AWARENESS payload: the entries that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn new(entries: Vec<AwarenessEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.entries.iter().map(|e| e.client_id).collect()
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![self.message_type() as u8];
        let body = match self {
            Frame::Sync(msg) => encode_payload(msg)?,
            Frame::Awareness(update) => encode_payload(update)?,
        };
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, body) = bytes.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match MessageType::try_from(tag)? {
            MessageType::Sync => Ok(Frame::Sync(decode_payload(body)?)),
            MessageType::Awareness => Ok(Frame::Awareness(decode_payload(body)?)),
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
    bincode::serde::encode_to_vec(value, config)
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
    let (value, read) = bincode::serde::decode_from_slice(body, config)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    if read != body.len() {
        return Err(ProtocolError::DeserializationError(format!(
            "{} trailing bytes after payload",
            body.len() - read
        )));
    }
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnknownMessageType(u8),
    EmptyFrame,
    /// Upgrade refused or failed before the socket was established
    Handshake(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnknownMessageType(t) => write!(f, "Unknown message discriminator: {t}"),
            Self::EmptyFrame => write!(f, "Empty frame"),
            Self::Handshake(e) => write!(f, "Handshake failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
