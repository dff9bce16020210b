//! SyncStream Protocol -- wire framing and message types.
//!
//! One TCP connection between exactly two peers. Every unit on the wire is a
//! 4-byte big-endian length prefix followed by a UTF-8 payload. Payloads that
//! are JSON objects with a `type` field are transfer messages; anything else
//! is a control string handed to the application as-is.

pub mod codec;
pub mod messages;

pub use codec::{encode_frame, FrameBuffer, FrameCodec};
pub use messages::*;

/// Default TCP port peers listen on.
pub const DEFAULT_PORT: u16 = 12345;

/// Default size of one file chunk in bytes (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum payload size of a single frame: 16 MB.
///
/// A length prefix above this is treated as an unrecoverable framing error.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest chunk size whose hex-encoded `file_chunk` frame still fits under
/// [`MAX_FRAME_SIZE`] with room for the JSON envelope.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Transfer identifier (opaque hex string).
pub type TransferId = String;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame payload is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the byte stream can no longer be trusted after this error.
    ///
    /// Only framing-level failures are fatal; a bad payload inside a
    /// well-formed frame is dropped and the connection stays up.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge { .. } | ProtocolError::Io(_))
    }
}

/// Sender-side wall clock as fractional unix seconds (informational only).
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
