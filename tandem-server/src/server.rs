//! TCP server implementation.

use crate::error::ServerError;
use crate::handler::{EchoHandler, Metered};
use crate::metrics::Metrics;
use crate::stream::MaybeTlsStream;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::{
    drive_handshake, run_session, ChannelSink, CloseReason, HandshakeError, InboundHandler,
    ProtocolConfig, Role, ServerHandshake, Session,
};
use tandem_protocol::DEFAULT_PORT;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Protocol settings shared by every session.
    pub protocol: Arc<ProtocolConfig>,
    /// TLS acceptor for in-band upgrades (if TLS is enabled).
    pub tls_acceptor: Option<TlsAcceptor>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("protocol", &self.protocol)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 1000,
            protocol: Arc::new(ProtocolConfig::default()),
            tls_acceptor: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Sets the protocol configuration.
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = Arc::new(protocol);
        self
    }

    /// Sets the connection limit.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether TLS is enabled.
    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }

    /// Checks the protocol settings against the available TLS material.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.protocol.validate()?;
        if self.protocol.supports_tls && self.tls_acceptor.is_none() {
            return Err(ServerError::Config(
                "protocol offers TLS but no acceptor is configured".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub handshakes_failed: AtomicU64,
    pub errors_total: AtomicU64,
}

/// State shared by the accept loop and every connection task.
struct Shared<H> {
    protocol: Arc<ProtocolConfig>,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<Metered<H>>,
    sessions: DashMap<Uuid, Arc<Session>>,
    stats: ServerStats,
    metrics: Option<Arc<Metrics>>,
}

/// TCP server for tandem.
pub struct Server<H = EchoHandler> {
    config: ServerConfig,
    shared: Arc<Shared<H>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server<EchoHandler> {
    /// Creates a server that echoes every request.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handler(config, EchoHandler)
    }
}

impl<H: InboundHandler> Server<H> {
    /// Creates a server dispatching requests and events to `handler`.
    pub fn with_handler(config: ServerConfig, handler: H) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            protocol: config.protocol.clone(),
            acceptor: config.tls_acceptor.clone(),
            handler: Arc::new(Metered::new(Arc::new(handler), config.metrics.clone())),
            sessions: DashMap::new(),
            stats: ServerStats::default(),
            metrics: config.metrics.clone(),
        });
        Self {
            config,
            shared,
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.config.validate()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Server listening on {} (versions {}..={}, TLS {})",
            listener.local_addr()?,
            self.shared.protocol.server_min_version,
            self.shared.protocol.server_max_version,
            if self.shared.protocol.requires_tls {
                "required"
            } else if self.shared.protocol.supports_tls {
                "offered"
            } else {
                "off"
            }
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.accept(tcp_stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        let stats = &self.shared.stats;
        if stats.connections_active.load(Ordering::Relaxed) >= self.config.max_connections as u64 {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.shared.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let shared = self.shared.clone();
        let conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            match shared.clone().handle_connection(tcp_stream, addr, conn_shutdown).await {
                Ok(reason) => tracing::info!("Client disconnected: {} ({})", addr, reason),
                Err(e) => {
                    tracing::debug!("Connection {} error: {}", addr, e);
                    shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }

            shared.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = shared.metrics {
                metrics.connections_active.dec();
            }
        });
    }

    /// Initiates server shutdown. Established sessions are suspended and
    /// disconnected.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver that fires when the server shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    /// Returns the established sessions.
    ///
    /// On versions with bidirectional RPC these can be used to call into
    /// the connected clients.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Looks up an established session by id.
    pub fn session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.shared.sessions.get(id).map(|entry| entry.value().clone())
    }
}

impl<H: InboundHandler> Shared<H> {
    async fn handle_connection(
        self: Arc<Self>,
        tcp_stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<CloseReason, ServerError> {
        let _ = tcp_stream.set_nodelay(true);

        let (sink, outbound) = ChannelSink::new();
        let session = Arc::new(Session::new(
            Role::Server,
            self.protocol.clone(),
            Arc::new(sink),
        ));
        tracing::debug!("[{}] Connection opened, session {}", addr, session.id());

        let stream = MaybeTlsStream::new(tcp_stream, self.acceptor.clone());
        let mut machine = ServerHandshake::new(&self.protocol);
        let timeout = self.protocol.handshake_timeout();
        let handshake = tokio::select! {
            result = drive_handshake(&session, stream, &mut machine, timeout) => result,
            _ = shutdown.recv() => {
                session.close(CloseReason::Shutdown);
                return Ok(CloseReason::Shutdown);
            }
        };

        let (stream, decoder, established) = match handshake {
            Ok(result) => result,
            Err(e) => {
                self.record_handshake_failure(addr, &e);
                return Err(e.into());
            }
        };

        self.stats.handshakes_completed.fetch_add(1, Ordering::Relaxed);
        let tls = established
            .tls
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string());
        if let Some(ref metrics) = self.metrics {
            metrics
                .handshakes_total
                .with_label_values(&["established"])
                .inc();
            metrics
                .sessions_by_version
                .with_label_values(&[&established.version.to_string()])
                .inc();
            metrics.tls_results_total.with_label_values(&[&tls]).inc();
        }
        tracing::info!(
            "Client connected: {} (session {}, {}, TLS {})",
            addr,
            session.id(),
            established.version,
            tls
        );

        self.sessions.insert(session.id(), session.clone());
        let reason = run_session(
            session.clone(),
            stream,
            decoder,
            outbound,
            self.handler.clone(),
            Some(shutdown),
        )
        .await;
        self.sessions.remove(&session.id());

        if let Some(ref metrics) = self.metrics {
            metrics.record_session_end(&session);
        }
        Ok(reason)
    }

    fn record_handshake_failure(&self, addr: SocketAddr, error: &HandshakeError) {
        self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
        let outcome = match error {
            HandshakeError::Rejected { .. } => "rejected",
            HandshakeError::TimedOut => "timeout",
            _ => "failed",
        };
        if let Some(ref metrics) = self.metrics {
            metrics.handshakes_total.with_label_values(&[outcome]).inc();
        }
        tracing::warn!("[{}] Handshake {}: {}", addr, outcome, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_basic() {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        assert!(!server.is_running());
        assert!(server.sessions().is_empty());
    }

    #[test]
    fn test_tls_offer_requires_acceptor() {
        let config = ServerConfig::default()
            .with_protocol(ProtocolConfig::default().with_tls(true, false));
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_invalid_protocol_rejected() {
        let mut protocol = ProtocolConfig::default();
        protocol.keep_alive_timeout_ms = protocol.keep_alive_interval_ms;
        let config = ServerConfig::default().with_protocol(protocol);
        assert!(matches!(config.validate(), Err(ServerError::Core(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = Arc::new(Server::new(ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        while !server.is_running() {
            tokio::task::yield_now().await;
        }
        server.shutdown();
        task.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
