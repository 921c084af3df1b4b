//! # tandem-client
//!
//! Client library for tandem.
//!
//! This crate provides:
//! - Async TCP client with version negotiation
//! - In-band TLS upgrade via rustls
//! - Request/response calls with deadlines
//! - Server events and server-initiated requests

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;
pub mod tls;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig, TlsClientConfig};
pub use error::ClientError;

pub use tandem_core::{CloseReason, Established};
