//! # tandem-core
//!
//! Protocol engine for tandem.
//!
//! This crate provides:
//! - Version negotiation and the client/server handshake machines
//! - In-band TLS upgrade negotiation
//! - Keep-alive liveness monitoring
//! - Request/response correlation with expiry
//! - The per-connection session actor

pub mod actor;
pub mod adapter;
pub mod config;
pub mod correlator;
pub mod driver;
pub mod error;
pub mod handshake;
pub mod liveness;
pub mod session;
pub mod tls;

pub use actor::{run_session, InboundHandler, NoopHandler};
pub use adapter::{ChannelSink, MessageSink, Outbound, Outbox, Outgoing, SessionAdapter};
pub use config::{ProtocolConfig, VersionBounds};
pub use correlator::{CallOutcome, Correlator, CorrelatorStats, ResponseHandler};
pub use driver::{drive_handshake, TlsUpgrade};
pub use error::{CoreError, HandshakeError};
pub use handshake::{
    negotiate_version, ClientHandshake, ClientState, Established, Handshake, HandshakeMachine,
    HandshakeOutcome, HandshakeResolver, ServerHandshake, ServerState, Step,
};
pub use liveness::{LivenessMonitor, LivenessStats};
pub use session::{CloseReason, Role, Session};
pub use tls::{TlsPolicy, TlsRole};
