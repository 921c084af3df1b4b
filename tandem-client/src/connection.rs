//! Connection management.

use crate::error::ClientError;
use crate::stream::{ClientStream, Upgrader};
use crate::tls::create_tls_connector;
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tandem_core::{
    drive_handshake, run_session, CallOutcome, ChannelSink, ClientHandshake, CloseReason,
    Established, Handshake, InboundHandler, ProtocolConfig, ResponseHandler, Role, Session,
};
use tandem_protocol::{CorrelationId, ProtocolVersion, TlsResult};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default capacity for the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// TLS material for the in-band upgrade.
#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    /// Refuse to run the session without TLS.
    pub required: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the IP of the server address).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Protocol settings. `supports_tls` and `requires_tls` are derived
    /// from [`Self::tls`].
    pub protocol: ProtocolConfig,
    /// TLS material (optional). Present means TLS is offered.
    pub tls: Option<TlsClientConfig>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            protocol: ProtocolConfig::default(),
            tls: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Restricts the offered versions.
    pub fn with_versions(mut self, min: ProtocolVersion, max: ProtocolVersion) -> Self {
        self.protocol = self.protocol.with_client_versions(min, max);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.protocol = self.protocol.with_rpc_timeout(timeout);
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    /// Returns the protocol settings the session runs with.
    pub fn effective_protocol(&self) -> ProtocolConfig {
        let mut protocol = self.protocol.clone();
        protocol.supports_tls = self.tls.is_some();
        protocol.requires_tls = self.tls.as_ref().is_some_and(|t| t.required);
        protocol
    }
}

type RequestFn = dyn Fn(Bytes) -> Option<Bytes> + Send + Sync;

/// Forwards server events to subscribers and answers server requests.
struct ClientHandler {
    events: broadcast::Sender<Bytes>,
    on_request: Option<Arc<RequestFn>>,
}

impl InboundHandler for ClientHandler {
    async fn on_request(&self, _session: Arc<Session>, payload: Bytes) -> Option<Bytes> {
        self.on_request.as_ref().and_then(|f| f(payload))
    }

    fn on_event(&self, _session: &Session, payload: Bytes) {
        // No subscribers is fine.
        let _ = self.events.send(payload);
    }
}

/// A connection to a tandem server.
///
/// A connection is opened once. After it closes, create a new one.
pub struct Connection {
    config: ConnectionConfig,
    protocol: Arc<ProtocolConfig>,
    session: OnceLock<Arc<Session>>,
    events: broadcast::Sender<Bytes>,
    on_request: Option<Arc<RequestFn>>,
    task: Mutex<Option<JoinHandle<CloseReason>>>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let protocol = Arc::new(config.effective_protocol());
        Self {
            config,
            protocol,
            session: OnceLock::new(),
            events,
            on_request: None,
            task: Mutex::new(None),
        }
    }

    /// Answers requests issued by the server on versions with
    /// bidirectional RPC. Without a handler such requests get no reply.
    pub fn with_request_handler(
        mut self,
        handler: impl Fn(Bytes) -> Option<Bytes> + Send + Sync + 'static,
    ) -> Self {
        self.on_request = Some(Arc::new(handler));
        self
    }

    /// Subscribes to events pushed by the server.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Bytes> {
        self.events.subscribe()
    }

    /// Opens the TCP connection and starts the handshake in the background.
    ///
    /// The returned [`Handshake`] resolves once the session is established
    /// or the handshake fails.
    pub async fn open(&self) -> Result<Handshake, ClientError> {
        self.protocol.validate()?;
        if self.session.get().is_some() {
            return Err(ClientError::AlreadyOpen);
        }

        let upgrader = match self.config.tls {
            Some(ref tls) => {
                let host = self.config.addr.ip().to_string();
                let (connector, server_name) = create_tls_connector(tls, &host)?;
                Some(Upgrader {
                    connector,
                    server_name,
                })
            }
            None => None,
        };

        tracing::debug!("Connecting to {}...", self.config.addr);
        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        tcp_stream.set_nodelay(true).ok();

        let (sink, outbound) = ChannelSink::new();
        let session = Arc::new(Session::new(
            Role::Client,
            self.protocol.clone(),
            Arc::new(sink),
        ));
        if self.session.set(session.clone()).is_err() {
            return Err(ClientError::AlreadyOpen);
        }

        let (handshake, resolver) = Handshake::new();
        let handler = Arc::new(ClientHandler {
            events: self.events.clone(),
            on_request: self.on_request.clone(),
        });
        let stream = ClientStream::new(tcp_stream, upgrader);
        let timeout = self.protocol.handshake_timeout();
        let mut machine = ClientHandshake::new(&self.protocol);

        let task = tokio::spawn(async move {
            match drive_handshake(&session, stream, &mut machine, timeout).await {
                Ok((stream, decoder, established)) => {
                    tracing::debug!(
                        "Session {} established ({}, TLS {:?})",
                        session.id(),
                        established.version,
                        established.tls
                    );
                    resolver.resolve(Ok(established));
                    drop(resolver);
                    run_session(session, stream, decoder, outbound, handler, None).await
                }
                Err(e) => {
                    tracing::debug!("Handshake failed: {}", e);
                    resolver.resolve(Err(e.clone()));
                    session.close(CloseReason::ProtocolViolation(e.to_string()));
                    CloseReason::ProtocolViolation(e.to_string())
                }
            }
        });
        *self.task.lock().await = Some(task);

        Ok(handshake)
    }

    /// Opens the connection and waits for the handshake to finish.
    pub async fn connect(&self) -> Result<Established, ClientError> {
        let mut handshake = self.open().await?;
        // The driver enforces the handshake timeout itself.
        Ok(handshake.resolved().await?)
    }

    fn session(&self) -> Result<&Arc<Session>, ClientError> {
        self.session.get().ok_or(ClientError::NotConnected)
    }

    /// Issues a call; `handler` receives exactly one outcome.
    pub fn send_request(
        &self,
        payload: Bytes,
        handler: impl ResponseHandler,
    ) -> Result<CorrelationId, ClientError> {
        Ok(self.session()?.send_request(payload, handler)?)
    }

    /// Issues a call and waits for its response.
    pub async fn call(&self, payload: Bytes) -> Result<Bytes, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(payload, move |outcome: CallOutcome| {
            let _ = tx.send(outcome);
        })?;
        Self::await_outcome(rx).await
    }

    /// Issues a call with its own deadline and waits for its response.
    pub async fn call_with_timeout(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.session()?
            .send_request_with_timeout(payload, timeout, move |outcome: CallOutcome| {
                let _ = tx.send(outcome);
            })?;
        Self::await_outcome(rx).await
    }

    async fn await_outcome(rx: oneshot::Receiver<CallOutcome>) -> Result<Bytes, ClientError> {
        match rx.await {
            Ok(CallOutcome::Response(payload)) => Ok(payload),
            Ok(CallOutcome::TimedOut) => Err(ClientError::Timeout),
            Ok(CallOutcome::SessionClosed) | Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Sends a one-way event.
    pub fn send_event(&self, payload: Bytes) -> Result<(), ClientError> {
        Ok(self.session()?.send_event(payload)?)
    }

    /// Returns whether the session is established and not closed.
    pub fn is_established(&self) -> bool {
        self.session
            .get()
            .is_some_and(|s| s.is_established() && !s.is_closed())
    }

    /// Returns the negotiated protocol version.
    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.session.get().and_then(|s| s.negotiated_version())
    }

    /// Returns the TLS negotiation result, if the version has one.
    pub fn negotiated_tls(&self) -> Option<TlsResult> {
        self.session.get().and_then(|s| s.negotiated_tls())
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.session
            .get()
            .and_then(|s| s.correlator())
            .map(|c| c.pending_count())
            .unwrap_or(0)
    }

    /// Returns the underlying session, once opened.
    pub fn session_handle(&self) -> Option<Arc<Session>> {
        self.session.get().cloned()
    }

    /// Disconnects gracefully and waits for the session to wind down.
    ///
    /// Every pending call completes with "connection closed".
    pub async fn close(&self) -> Result<Option<CloseReason>, ClientError> {
        let Some(session) = self.session.get() else {
            return Ok(None);
        };
        session.request_close();

        let task = self.task.lock().await.take();
        match task {
            Some(task) => match task.await {
                Ok(reason) => Ok(Some(reason)),
                Err(_) => Ok(session.close_reason()),
            },
            None => Ok(session.close_reason()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(session) = self.session.get() {
            session.request_close();
        }
    }
}
