//! Encoder and decoder for tandem frames and messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use crate::version::ProtocolVersion;
use bytes::{Bytes, BytesMut};

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a complete frame for a session at `version`.
    ///
    /// `version` is `None` until the handshake has negotiated one; only
    /// handshake messages may be encoded in that state.
    pub fn encode_message(
        message: &Message,
        version: Option<ProtocolVersion>,
    ) -> Result<BytesMut, ProtocolError> {
        let frame = Frame::new(message.encode(version)?);
        frame.encode()
    }

    /// Appends the framed message to `buf`.
    pub fn encode_message_into(
        message: &Message,
        version: Option<ProtocolVersion>,
        buf: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        let frame = Frame::new(message.encode(version)?);
        frame.encode_into(buf)
    }
}

/// Decodes frames into messages.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message for a session at `version`.
    pub fn decode_message(
        &mut self,
        version: Option<ProtocolVersion>,
    ) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(Message::decode(frame.payload, version)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
