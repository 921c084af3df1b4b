//! Binary frame format.
//!
//! Every protocol message travels in exactly one frame. The frame layout is
//! the same for every protocol version, which lets the handshake run before
//! a version has been negotiated:
//!
//! ```text
//! +--------+--------+-------------+--------+---------------------+
//! | magic  | flags  | payload_len | crc32c | payload             |
//! | 4 bytes|2 bytes |   4 bytes   | 4 bytes| payload_len bytes   |
//! +--------+--------+-------------+--------+---------------------+
//! ```
//!
//! The payload is an encoded [`Message`](crate::message::Message). The
//! checksum field is zero when [`FrameFlags::CRC_PRESENT`] is unset.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying tandem frames: "TNDM"
pub const MAGIC: [u8; 4] = *b"TNDM";

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = MAGIC.len() + 2 + 4 + 4;

/// Header flag bits. Unknown bits are rejected on decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const CRC_PRESENT: u16 = 0b01;
    /// Reserved; no encoder sets it yet.
    pub const COMPRESSED: u16 = 0b10;

    const KNOWN: u16 = Self::CRC_PRESENT | Self::COMPRESSED;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(self) -> Self {
        Self(self.0 | Self::CRC_PRESENT)
    }

    pub fn has_crc(&self) -> bool {
        self.contains(Self::CRC_PRESENT)
    }

    pub fn is_compressed(&self) -> bool {
        self.contains(Self::COMPRESSED)
    }

    fn contains(&self, bit: u16) -> bool {
        self.0 & bit == bit
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        match bits & !Self::KNOWN {
            0 => Ok(Self(bits)),
            _ => Err(ProtocolError::InvalidFlags(bits)),
        }
    }
}

/// The fixed-size part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameHeader {
    flags: FrameFlags,
    payload_len: u32,
    checksum: u32,
}

impl FrameHeader {
    /// Parses a header from the front of `buf` without consuming it.
    ///
    /// Magic, flags and the length bound are checked as soon as the header
    /// is complete, so a hostile length never causes buffering.
    fn peek(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let Some(mut header) = buf.get(..FRAME_HEADER_SIZE) else {
            return Ok(None);
        };

        let mut magic = [0u8; 4];
        header.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let flags = FrameFlags::from_bits(header.get_u16())?;
        let payload_len = header.get_u32();
        check_len(payload_len as usize)?;

        Ok(Some(Self {
            flags,
            payload_len,
            checksum: header.get_u32(),
        }))
    }

    fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len as usize
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&MAGIC);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.payload_len);
        buf.put_u32(self.checksum);
    }
}

fn check_len(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// One frame: header flags and the encoded message it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a checksummed frame.
    pub fn new(payload: Bytes) -> Self {
        Self {
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`. Nothing is written on error.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        check_len(self.payload.len())?;

        let header = FrameHeader {
            flags: self.flags,
            payload_len: self.payload.len() as u32,
            checksum: if self.flags.has_crc() {
                crc32c::crc32c(&self.payload)
            } else {
                0
            },
        };

        buf.reserve(self.encoded_len());
        header.put(buf);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Removes one complete frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(header) = FrameHeader::peek(&buf[..])? else {
            return Ok(None);
        };
        if buf.len() < header.frame_len() {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.payload_len as usize).freeze();

        if header.flags.has_crc() {
            let actual = crc32c::crc32c(&payload);
            if actual != header.checksum {
                return Err(ProtocolError::CrcMismatch {
                    expected: header.checksum,
                    actual,
                });
            }
        }

        Ok(Some(Self {
            flags: header.flags,
            payload,
        }))
    }
}
