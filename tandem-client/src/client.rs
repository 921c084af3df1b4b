//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{CloseReason, Established};
use tandem_protocol::{ProtocolVersion, TlsResult};
use tokio::sync::broadcast;

/// High-level client for tandem.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::from_connection(Connection::new(config))
    }

    /// Wraps a configured connection, e.g. one with a request handler.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(conn),
        }
    }

    /// Connects and completes the handshake.
    pub async fn connect(&self) -> Result<Established, ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the session is established.
    pub fn is_established(&self) -> bool {
        self.conn.is_established()
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.conn.negotiated_version()
    }

    pub fn negotiated_tls(&self) -> Option<TlsResult> {
        self.conn.negotiated_tls()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<Option<CloseReason>, ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Sends `payload` and waits for the response payload.
    pub async fn call(&self, payload: impl Into<Bytes>) -> Result<Bytes, ClientError> {
        self.conn.call(payload.into()).await
    }

    /// Like [`Self::call`] with a per-call deadline.
    pub async fn call_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        self.conn.call_with_timeout(payload.into(), timeout).await
    }

    /// Calls with a JSON-encoded request and decodes a JSON response.
    pub async fn call_json<T, R>(&self, request: &T) -> Result<R, ClientError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)?;
        let response = self.conn.call(Bytes::from(payload)).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    /// Sends a one-way event.
    pub fn send_event(&self, payload: impl Into<Bytes>) -> Result<(), ClientError> {
        self.conn.send_event(payload.into())
    }

    /// Subscribes to events pushed by the server.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Bytes> {
        self.conn.subscribe_events()
    }

    /// Measures the round trip of an empty call.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.conn.call(Bytes::new()).await?;
        Ok(started.elapsed())
    }
}
