//! # tandem-protocol
//!
//! Wire protocol implementation for tandem.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - The tagged protocol message model
//! - The version capability table shared by every session
//! - Error types for framing and message decoding

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod version;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    CorrelationId, Message, MessageTag, RejectReason, Request, Response, TlsRequirement, TlsResult,
};
pub use version::{Capabilities, ProtocolVersion, Quirks, VersionEntry, VERSION_TABLE};

/// Default port for the tandem server.
pub const DEFAULT_PORT: u16 = 7450;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
