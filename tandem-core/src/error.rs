//! Core error types.

use tandem_protocol::{ProtocolError, ProtocolVersion, RejectReason};
use thiserror::Error;

/// Why a handshake did not reach the established state.
///
/// Handshake failures are terminal for the connection and are never
/// retried by the engine. The error is `Clone` because the outcome is
/// observed through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error(
        "rejected by server ({reason}), acceptable versions: {}",
        format_versions(.acceptable_versions)
    )]
    Rejected {
        reason: RejectReason,
        acceptable_versions: Vec<ProtocolVersion>,
    },

    #[error("server accepted {version}, outside configured bounds [{min}, {max}]")]
    VersionOutOfBounds {
        version: ProtocolVersion,
        min: ProtocolVersion,
        max: ProtocolVersion,
    },

    #[error("TLS is required but negotiated version {version} cannot upgrade")]
    TlsUnavailable { version: ProtocolVersion },

    #[error("TLS is required but the peer answered PLAINTEXT")]
    TlsRefused,

    #[error("TLS negotiation failed")]
    TlsNegotiationFailed,

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("unexpected {tag} while {state}")]
    UnexpectedMessage { tag: &'static str, state: &'static str },

    #[error("connection closed during handshake")]
    ConnectionClosed,

    #[error("handshake timed out")]
    TimedOut,

    #[error("protocol error during handshake: {0}")]
    Protocol(String),
}

impl HandshakeError {
    /// Returns whether the failure came from the peer refusing the session.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

fn format_versions(versions: &[ProtocolVersion]) -> String {
    let list: Vec<String> = versions.iter().map(|v| v.get().to_string()).collect();
    format!("[{}]", list.join(", "))
}

/// Errors from the protocol engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("session is not established")]
    NotEstablished,

    #[error("session is closed")]
    SessionClosed,

    #[error("session is suspended")]
    SessionSuspended,

    #[error("capability '{capability}' is not supported by {version}")]
    CapabilityUnsupported {
        capability: &'static str,
        version: ProtocolVersion,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("outbound channel closed")]
    SinkClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Returns whether the error ends the session it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CoreError::NotEstablished
                | CoreError::SessionSuspended
                | CoreError::CapabilityUnsupported { .. }
                | CoreError::Config(_)
        )
    }
}
