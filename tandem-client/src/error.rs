//! Client error types.

use tandem_core::{CoreError, HandshakeError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tandem_protocol::ProtocolError),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("not connected")]
    NotConnected,

    #[error("connection already opened")]
    AlreadyOpen,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

impl ClientError {
    /// Returns whether retrying on a new connection may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) | ClientError::Timeout | ClientError::ConnectionClosed => true,
            ClientError::Handshake(e) => matches!(
                e,
                HandshakeError::TimedOut | HandshakeError::ConnectionClosed
            ),
            ClientError::Core(e) => {
                matches!(e, CoreError::SessionClosed | CoreError::SessionSuspended)
            }
            _ => false,
        }
    }
}
