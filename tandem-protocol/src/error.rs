//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'TNDM', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("message {tag} is not supported by protocol version {version}")]
    MessageNotSupported { tag: &'static str, version: u8 },

    #[error("message {0} requires a negotiated protocol version")]
    VersionRequired(&'static str),

    #[error("truncated message: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("trailing bytes after message: {0}")]
    TrailingBytes(usize),

    #[error("invalid {name} value: {value}")]
    InvalidEnum { name: &'static str, value: String },

    #[error("correlation id does not match the id scheme of protocol version {0}")]
    CorrelationIdMismatch(u8),

    #[error("payload too large for protocol version {version}: {size} bytes")]
    PayloadTooLarge { size: usize, version: u8 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidMagic(*b"XXXX");
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::UnsupportedVersion(99);
        assert!(err.to_string().contains("99"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::CrcMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc") || msg.contains("ABC"));

        let err = ProtocolError::UnknownTag(0x7f);
        assert!(err.to_string().contains("0x7f"));

        let err = ProtocolError::MessageNotSupported {
            tag: "SUSPEND",
            version: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains("SUSPEND"));
        assert!(msg.contains("version 1"));

        let err = ProtocolError::Truncated { needed: 10 };
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::InvalidEnum {
            name: "tls requirement",
            value: "MAYBE".to_string(),
        };
        assert!(err.to_string().contains("MAYBE"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));

        let err = ProtocolError::InvalidFlags(0xFF);
        let msg = err.to_string();
        assert!(msg.contains("ff") || msg.contains("FF"));
    }
}
