//! Server error types.

use tandem_core::HandshakeError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] tandem_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] tandem_core::CoreError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ServerError {
    /// Returns whether the peer, not this server, caused the error.
    pub fn is_peer_error(&self) -> bool {
        match self {
            ServerError::Handshake(_) | ServerError::Protocol(_) => true,
            _ => false,
        }
    }
}
