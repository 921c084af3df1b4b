//! # tandem-server
//!
//! TCP server for tandem.
//!
//! This crate provides:
//! - TCP accept loop with connection limits and graceful shutdown
//! - Server-side handshake with in-band TLS upgrade
//! - Session actors dispatching to an [`InboundHandler`](tandem_core::InboundHandler)
//! - Layered YAML/environment configuration
//! - Prometheus metrics endpoint

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod stream;
pub mod tls;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, TlsConfig};
pub use error::ServerError;
pub use handler::EchoHandler;
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
pub use stream::MaybeTlsStream;
