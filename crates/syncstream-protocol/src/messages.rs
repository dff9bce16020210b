//! Transfer protocol messages.
//!
//! On the wire every message is a JSON envelope
//! `{"type": "<file_*>", "data": {...}, "timestamp": <float>}`. The envelope is
//! decoded once at the framing boundary into the closed [`Message`] type so
//! downstream code can match exhaustively.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::encode_frame;
use crate::{now_timestamp, ProtocolError, TransferId};

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    FileOffer,
    FileAccept,
    FileReject,
    FileChunk,
    FileComplete,
    FileError,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::FileOffer => "file_offer",
            MessageType::FileAccept => "file_accept",
            MessageType::FileReject => "file_reject",
            MessageType::FileChunk => "file_chunk",
            MessageType::FileComplete => "file_complete",
            MessageType::FileError => "file_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file_offer" => Some(MessageType::FileOffer),
            "file_accept" => Some(MessageType::FileAccept),
            "file_reject" => Some(MessageType::FileReject),
            "file_chunk" => Some(MessageType::FileChunk),
            "file_complete" => Some(MessageType::FileComplete),
            "file_error" => Some(MessageType::FileError),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    pub transfer_id: TransferId,
    pub filename: String,
    pub file_size: u64,
    /// Hex SHA-256 of the whole file.
    pub file_hash: String,
    /// Display name of the sending peer.
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccept {
    pub transfer_id: TransferId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReject {
    pub transfer_id: TransferId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub transfer_id: TransferId,
    /// Zero-based chunk index; chunks arrive strictly in order.
    pub chunk_num: u64,
    #[serde(with = "hex_bytes")]
    pub chunk_data: Vec<u8>,
}

// Chunk bodies are up to megabytes; keep Debug output readable.
impl std::fmt::Debug for FileChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChunk")
            .field("transfer_id", &self.transfer_id)
            .field("chunk_num", &self.chunk_num)
            .field("len", &self.chunk_data.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileComplete {
    pub transfer_id: TransferId,
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub transfer_id: TransferId,
    pub error: String,
}

// ============================================================================
// Message
// ============================================================================

/// A decoded transfer protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Offer(FileOffer),
    Accept(FileAccept),
    Reject(FileReject),
    Chunk(FileChunk),
    Complete(FileComplete),
    Error(FileError),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Offer(_) => MessageType::FileOffer,
            Message::Accept(_) => MessageType::FileAccept,
            Message::Reject(_) => MessageType::FileReject,
            Message::Chunk(_) => MessageType::FileChunk,
            Message::Complete(_) => MessageType::FileComplete,
            Message::Error(_) => MessageType::FileError,
        }
    }

    pub fn transfer_id(&self) -> &str {
        match self {
            Message::Offer(m) => &m.transfer_id,
            Message::Accept(m) => &m.transfer_id,
            Message::Reject(m) => &m.transfer_id,
            Message::Chunk(m) => &m.transfer_id,
            Message::Complete(m) => &m.transfer_id,
            Message::Error(m) => &m.transfer_id,
        }
    }

    /// Serialize to the JSON envelope, stamped with the current time.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_json_at(now_timestamp())
    }

    pub fn to_json_at(&self, timestamp: f64) -> Result<Vec<u8>, ProtocolError> {
        let data = match self {
            Message::Offer(m) => serde_json::to_value(m)?,
            Message::Accept(m) => serde_json::to_value(m)?,
            Message::Reject(m) => serde_json::to_value(m)?,
            Message::Chunk(m) => serde_json::to_value(m)?,
            Message::Complete(m) => serde_json::to_value(m)?,
            Message::Error(m) => serde_json::to_value(m)?,
        };
        let envelope = Envelope {
            msg_type: self.message_type().as_str().to_string(),
            data,
            timestamp,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Serialize and length-prefix, ready to write to the socket.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode_frame(&self.to_json()?)
    }
}

/// A message together with the sender's informational timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: Message,
    pub timestamp: f64,
}

impl Frame {
    fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let msg_type = MessageType::parse(&envelope.msg_type)
            .ok_or_else(|| ProtocolError::UnknownMessageType(envelope.msg_type.clone()))?;
        let data = envelope.data;
        let message = match msg_type {
            MessageType::FileOffer => Message::Offer(serde_json::from_value(data)?),
            MessageType::FileAccept => Message::Accept(serde_json::from_value(data)?),
            MessageType::FileReject => Message::Reject(serde_json::from_value(data)?),
            MessageType::FileChunk => Message::Chunk(serde_json::from_value(data)?),
            MessageType::FileComplete => Message::Complete(serde_json::from_value(data)?),
            MessageType::FileError => Message::Error(serde_json::from_value(data)?),
        };
        Ok(Frame {
            message,
            timestamp: envelope.timestamp,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: f64,
}

// ============================================================================
// Inbound classification
// ============================================================================

/// What a received frame turned out to carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A transfer protocol message.
    Message(Frame),
    /// A control-plane string for the application.
    Text(String),
}

impl Inbound {
    /// Interpret one frame payload.
    ///
    /// A JSON object carrying a `type` field is a transfer message and must
    /// decode cleanly; every other UTF-8 payload is a control string.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload)?;

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return Ok(Inbound::Text(text.to_string())),
        };
        let is_envelope = value
            .as_object()
            .map(|o| o.contains_key("type"))
            .unwrap_or(false);
        if !is_envelope {
            return Ok(Inbound::Text(text.to_string()));
        }

        let envelope: Envelope = serde_json::from_value(value)?;
        Frame::from_envelope(envelope).map(Inbound::Message)
    }
}

/// Frame a control string.
pub fn encode_text(text: &str) -> Result<Bytes, ProtocolError> {
    encode_frame(text.as_bytes())
}

mod hex_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
