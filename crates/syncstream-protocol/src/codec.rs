//! Length-delimited framing for the peer TCP stream.
//!
//! Wire format: 4-byte big-endian length prefix + UTF-8 payload.
//! The codec only cuts frames; interpreting payloads is left to
//! [`crate::messages::Inbound::decode`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};

/// Codec for framing opaque payloads over a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Codec with a custom frame ceiling (tests and constrained links).
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

/// Frame a single payload into a freshly allocated buffer.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    FrameCodec::new().encode(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Push-style frame reassembly for a raw read loop.
///
/// Bytes are fed in whatever sizes the socket returns; complete frames are
/// pulled out one at a time and any trailing partial frame stays buffered
/// for the next `feed`. Never blocks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codec(codec: FrameCodec) -> Self {
        Self {
            codec,
            buf: BytesMut::new(),
        }
    }

    /// Append raw bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        self.codec.decode(&mut self.buf)
    }

    /// Lazily yield every complete frame currently buffered.
    ///
    /// Iteration stops after the first error; framing errors are fatal to
    /// the stream so callers should drop the connection.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            inner: self,
            failed: false,
        }
    }

    /// Number of bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Iterator returned by [`FrameBuffer::frames`].
pub struct Frames<'a> {
    inner: &'a mut FrameBuffer,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.inner.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
