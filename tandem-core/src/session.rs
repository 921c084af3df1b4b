//! Per-connection session state.

use crate::adapter::MessageSink;
use crate::config::ProtocolConfig;
use crate::correlator::{Correlator, ResponseHandler};
use crate::error::CoreError;
use crate::liveness::LivenessMonitor;
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tandem_protocol::{Capabilities, CorrelationId, Message, ProtocolVersion, TlsResult};
use tokio::sync::Notify;
use uuid::Uuid;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this endpoint.
    Local,
    /// The peer sent `DISCONNECT`.
    PeerDisconnect,
    /// The peer closed the connection without notice.
    Eof,
    /// Nothing was received within the read-idle timeout.
    DeadPeer,
    /// The process is shutting down.
    Shutdown,
    /// The peer broke the protocol.
    ProtocolViolation(String),
    /// The transport failed.
    Io(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::PeerDisconnect => write!(f, "peer disconnected"),
            CloseReason::Eof => write!(f, "connection closed by peer"),
            CloseReason::DeadPeer => write!(f, "peer missed keep-alive deadline"),
            CloseReason::Shutdown => write!(f, "shutting down"),
            CloseReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            CloseReason::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

/// A protocol session.
///
/// Created when the connection opens. The handshake records the
/// negotiated version and TLS result; afterwards the session is driven by
/// the connection actor and exposes the call API.
pub struct Session {
    id: Uuid,
    role: Role,
    config: Arc<ProtocolConfig>,
    sink: Arc<dyn MessageSink>,
    version: RwLock<Option<ProtocolVersion>>,
    tls: RwLock<Option<TlsResult>>,
    correlator: OnceLock<Arc<Correlator>>,
    liveness: LivenessMonitor,
    established: AtomicBool,
    suspended: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    close_reason: RwLock<Option<CloseReason>>,
    close_requested: Notify,
    created_at: Instant,
}

impl Session {
    pub fn new(role: Role, config: Arc<ProtocolConfig>, sink: Arc<dyn MessageSink>) -> Self {
        let liveness =
            LivenessMonitor::new(config.keep_alive_timeout(), config.keep_alive_interval());
        Self {
            id: Uuid::new_v4(),
            role,
            config,
            sink,
            version: RwLock::new(None),
            tls: RwLock::new(None),
            correlator: OnceLock::new(),
            liveness,
            established: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_reason: RwLock::new(None),
            close_requested: Notify::new(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Records the negotiated version and creates the session's correlator.
    pub fn record_version(&self, version: ProtocolVersion) {
        *self.version.write() = Some(version);
        let _ = self.correlator.set(Arc::new(Correlator::new(
            self.id,
            version,
            self.sink.clone(),
            self.config.rpc_timeout(),
        )));
    }

    pub fn record_tls(&self, result: TlsResult) {
        *self.tls.write() = Some(result);
    }

    /// Marks the handshake complete. Calls are accepted from now on.
    pub fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    /// The peer announced it will recycle the session soon.
    pub fn mark_suspended(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        *self.version.read()
    }

    pub fn negotiated_tls(&self) -> Option<TlsResult> {
        *self.tls.read()
    }

    /// Capabilities of the negotiated version (empty before negotiation).
    pub fn capabilities(&self) -> Capabilities {
        self.negotiated_version()
            .map(|v| v.capabilities())
            .unwrap_or(Capabilities::NONE)
    }

    pub fn correlator(&self) -> Option<&Arc<Correlator>> {
        self.correlator.get()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.read().clone()
    }

    /// Issues a call with the configured RPC timeout.
    pub fn send_request(
        &self,
        payload: Bytes,
        handler: impl ResponseHandler,
    ) -> Result<CorrelationId, CoreError> {
        self.send_request_with_timeout(payload, self.config.rpc_timeout(), handler)
    }

    /// Issues a call with an explicit timeout.
    pub fn send_request_with_timeout(
        &self,
        payload: Bytes,
        timeout: Duration,
        handler: impl ResponseHandler,
    ) -> Result<CorrelationId, CoreError> {
        let correlator = self.callable()?;
        if self.role == Role::Server {
            self.require(Capabilities::BIDIRECTIONAL_RPC, "bidirectional-rpc")?;
        }
        correlator.send_request_with_timeout(payload, timeout, handler)
    }

    /// Sends a one-way event.
    pub fn send_event(&self, payload: Bytes) -> Result<(), CoreError> {
        self.callable()?;
        self.send_message(&Message::Event { payload })
    }

    /// Encodes and queues a message for the negotiated version.
    pub fn send_message(&self, message: &Message) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::SessionClosed);
        }
        self.sink.send_message(message, self.negotiated_version())
    }

    fn callable(&self) -> Result<&Arc<Correlator>, CoreError> {
        if self.is_closed() || self.is_closing() {
            return Err(CoreError::SessionClosed);
        }
        if !self.established.load(Ordering::Acquire) {
            return Err(CoreError::NotEstablished);
        }
        if self.is_suspended() {
            return Err(CoreError::SessionSuspended);
        }
        self.correlator.get().ok_or(CoreError::NotEstablished)
    }

    fn require(&self, capability: Capabilities, name: &'static str) -> Result<(), CoreError> {
        match self.negotiated_version() {
            Some(version) if version.capabilities().contains(capability) => Ok(()),
            Some(version) => Err(CoreError::CapabilityUnsupported {
                capability: name,
                version,
            }),
            None => Err(CoreError::NotEstablished),
        }
    }

    /// Asks the connection actor to disconnect gracefully.
    pub fn request_close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.close_requested.notify_one();
        }
    }

    /// Resolves once [`Self::request_close`] has been called.
    pub async fn close_requested(&self) {
        self.close_requested.notified().await;
    }

    /// Tears the session down. Every pending call is completed with
    /// "session closed". Returns false if the session was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closing.store(true, Ordering::Release);
        *self.close_reason.write() = Some(reason);

        if let Some(correlator) = self.correlator.get() {
            correlator.on_session_closed();
        }
        self.sink.close();
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("version", &self.negotiated_version())
            .field("tls", &self.negotiated_tls())
            .field("established", &self.is_established())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChannelSink, Outgoing};
    use crate::correlator::CallOutcome;
    use parking_lot::Mutex;

    fn session(role: Role) -> (Session, tokio::sync::mpsc::UnboundedReceiver<Outgoing>) {
        let (sink, rx) = ChannelSink::new();
        let session = Session::new(role, Arc::new(ProtocolConfig::default()), Arc::new(sink));
        (session, rx)
    }

    #[tokio::test]
    async fn test_calls_refused_before_establishment() {
        let (session, _rx) = session(Role::Client);
        assert!(!session.is_established());
        assert_eq!(session.negotiated_version(), None);
        assert_eq!(session.capabilities(), Capabilities::NONE);

        let result = session.send_request(Bytes::new(), |_: CallOutcome| {});
        assert!(matches!(result, Err(CoreError::NotEstablished)));

        session.record_version(ProtocolVersion::V3);
        let result = session.send_request(Bytes::new(), |_: CallOutcome| {});
        assert!(matches!(result, Err(CoreError::NotEstablished)));

        session.mark_established();
        assert!(session.is_established());
        session.send_request(Bytes::new(), |_: CallOutcome| {}).unwrap();
    }

    #[tokio::test]
    async fn test_server_calls_need_bidirectional_rpc() {
        let (session, _rx) = session(Role::Server);
        session.record_version(ProtocolVersion::V1);
        session.mark_established();

        let result = session.send_request(Bytes::new(), |_: CallOutcome| {});
        assert!(matches!(
            result,
            Err(CoreError::CapabilityUnsupported { version: ProtocolVersion::V1, .. })
        ));
    }

    #[tokio::test]
    async fn test_suspended_session_refuses_new_calls() {
        let (session, _rx) = session(Role::Client);
        session.record_version(ProtocolVersion::V2);
        session.mark_established();
        session.mark_suspended();

        let result = session.send_request(Bytes::new(), |_: CallOutcome| {});
        assert!(matches!(result, Err(CoreError::SessionSuspended)));
    }

    #[tokio::test]
    async fn test_close_drains_pending_calls_once() {
        let (session, mut rx) = session(Role::Client);
        session.record_version(ProtocolVersion::V4);
        session.mark_established();

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let outcomes = outcomes.clone();
            session
                .send_request(Bytes::new(), move |o: CallOutcome| outcomes.lock().push(o))
                .unwrap();
        }

        assert!(session.close(CloseReason::DeadPeer));
        assert!(!session.close(CloseReason::Local));
        assert_eq!(session.close_reason(), Some(CloseReason::DeadPeer));
        assert!(!session.is_established());
        assert_eq!(*outcomes.lock(), vec![CallOutcome::SessionClosed; 3]);

        // Three requests, then the close sentinel for the writer
        for _ in 0..3 {
            assert!(matches!(rx.recv().await, Some(Outgoing::Frame(_))));
        }
        assert!(matches!(rx.recv().await, Some(Outgoing::Close)));
    }

    #[tokio::test]
    async fn test_request_close_wakes_waiter() {
        let (session, _rx) = session(Role::Server);
        session.request_close();
        assert!(session.is_closing());
        // The permit is stored even though nobody was waiting yet
        tokio::time::timeout(Duration::from_secs(1), session.close_requested())
            .await
            .unwrap();
    }
}
