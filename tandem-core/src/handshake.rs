//! Handshake and version negotiation.
//!
//! Both roles are plain state machines: they consume one inbound message
//! at a time, record their reaction on a [`SessionAdapter`] and report
//! whether the session is established. Per-version behavior comes from
//! the capability table, not from per-version code paths.
//!
//! ```text
//! client: Idle -> AwaitingAccept -> EstablishedPlaintext
//!                               \-> AwaitingTlsResult -> EstablishedPlaintext | EstablishedSsl
//!                               \-> Rejected | Closed
//! server: AwaitingConnect -> Established
//!                         \-> AwaitingTlsRequest -> Established
//!                         \-> Rejected | Closed
//! ```

use crate::adapter::SessionAdapter;
use crate::config::{ProtocolConfig, VersionBounds};
use crate::error::HandshakeError;
use crate::session::Session;
use crate::tls::{TlsPolicy, TlsRole};
use std::time::Duration;
use tandem_protocol::{Capabilities, Message, ProtocolVersion, RejectReason, TlsResult};
use tokio::sync::watch;

/// Parameters of a successfully established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Established {
    pub version: ProtocolVersion,
    /// `None` when the version has no TLS sub-handshake.
    pub tls: Option<TlsResult>,
}

impl Established {
    pub fn is_encrypted(&self) -> bool {
        self.tls == Some(TlsResult::Ssl)
    }
}

/// Result of feeding one message to a handshake machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More messages are needed.
    Continue,
    /// The session is established.
    Established(Established),
}

/// Common driver interface of both roles.
pub trait HandshakeMachine {
    /// Called once when the connection opens.
    fn start(
        &mut self,
        session: &Session,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError>;

    /// Called for every message received before establishment.
    fn on_message(
        &mut self,
        session: &Session,
        message: Message,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError>;

    /// Called when the connection is lost mid-handshake.
    fn on_closed(&mut self) -> HandshakeError;
}

/// Picks the first of `acceptable` (highest first) that was also offered.
pub fn negotiate_version(
    acceptable: &[ProtocolVersion],
    offered: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    acceptable.iter().copied().find(|v| offered.contains(v))
}

fn configure_timers(config: &ProtocolConfig, adapter: &mut dyn SessionAdapter) {
    adapter.configure_idle_timers(config.keep_alive_timeout(), config.keep_alive_interval());
}

/// Client handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    AwaitingAccept,
    AwaitingTlsResult,
    EstablishedPlaintext,
    EstablishedSsl,
    Rejected,
    Closed,
}

impl ClientState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingAccept => "awaiting accept",
            Self::AwaitingTlsResult => "awaiting TLS result",
            Self::EstablishedPlaintext => "established (plaintext)",
            Self::EstablishedSsl => "established (SSL)",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::EstablishedPlaintext | Self::EstablishedSsl | Self::Rejected | Self::Closed
        )
    }
}

/// The client side of the handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    state: ClientState,
    bounds: VersionBounds,
    tls: TlsPolicy,
    config: ProtocolConfig,
}

impl ClientHandshake {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            state: ClientState::Idle,
            bounds: config.client_bounds(),
            tls: TlsPolicy::from_config(config),
            config: config.clone(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    fn fail(
        &mut self,
        state: ClientState,
        adapter: &mut dyn SessionAdapter,
        error: HandshakeError,
    ) -> HandshakeError {
        tracing::warn!("Client handshake failed: {}", error);
        self.state = state;
        adapter.close();
        error
    }

    fn establish(
        &mut self,
        version: ProtocolVersion,
        tls: Option<TlsResult>,
        adapter: &mut dyn SessionAdapter,
    ) -> Step {
        self.state = if tls == Some(TlsResult::Ssl) {
            ClientState::EstablishedSsl
        } else {
            ClientState::EstablishedPlaintext
        };
        configure_timers(&self.config, adapter);
        tracing::info!("Client handshake complete at {} (tls: {:?})", version, tls);
        Step::Established(Established { version, tls })
    }

    fn on_accept(
        &mut self,
        session: &Session,
        version: ProtocolVersion,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        if !self.bounds.contains(version) || !version.is_known() {
            return Err(self.fail(
                ClientState::Closed,
                adapter,
                HandshakeError::VersionOutOfBounds {
                    version,
                    min: self.bounds.min,
                    max: self.bounds.max,
                },
            ));
        }

        session.record_version(version);

        if version.capabilities().contains(Capabilities::TLS_UPGRADE) {
            let requirement = self.tls.requirement();
            tracing::debug!("Requesting TLS upgrade at {} ({})", version, requirement);
            adapter.send(Message::StartTlsRequest { requirement });
            self.state = ClientState::AwaitingTlsResult;
            return Ok(Step::Continue);
        }

        if self.tls.requires {
            adapter.send(Message::Disconnect);
            return Err(self.fail(
                ClientState::Closed,
                adapter,
                HandshakeError::TlsUnavailable { version },
            ));
        }

        Ok(self.establish(version, None, adapter))
    }

    fn on_tls_result(
        &mut self,
        session: &Session,
        result: TlsResult,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        let Some(version) = session.negotiated_version() else {
            return Err(self.fail(
                ClientState::Closed,
                adapter,
                HandshakeError::Protocol("TLS result before version negotiation".to_string()),
            ));
        };
        session.record_tls(result);

        match result {
            TlsResult::Ssl if self.tls.supports => {
                adapter.install_tls(TlsRole::Initiator);
                Ok(self.establish(version, Some(result), adapter))
            }
            TlsResult::Ssl => Err(self.fail(
                ClientState::Closed,
                adapter,
                HandshakeError::Protocol(
                    "server chose SSL although TLS was not offered".to_string(),
                ),
            )),
            TlsResult::Plaintext if self.tls.requires => {
                adapter.send(Message::Disconnect);
                Err(self.fail(ClientState::Closed, adapter, HandshakeError::TlsRefused))
            }
            TlsResult::Plaintext => Ok(self.establish(version, Some(result), adapter)),
            TlsResult::FailedNegotiation => Err(self.fail(
                ClientState::Closed,
                adapter,
                HandshakeError::TlsNegotiationFailed,
            )),
        }
    }
}

impl HandshakeMachine for ClientHandshake {
    fn start(
        &mut self,
        _session: &Session,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        if self.state != ClientState::Idle {
            return Err(HandshakeError::Protocol("handshake already started".to_string()));
        }
        let offered_versions = self.bounds.descending();
        tracing::debug!("Sending CONNECT offering {:?}", offered_versions);
        adapter.send(Message::Connect { offered_versions });
        self.state = ClientState::AwaitingAccept;
        Ok(Step::Continue)
    }

    fn on_message(
        &mut self,
        session: &Session,
        message: Message,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        match (self.state, message) {
            (_, Message::KeepAlive) => Ok(Step::Continue),
            (_, Message::Disconnect) => Err(self.fail(
                ClientState::Closed,
                adapter,
                HandshakeError::ConnectionClosed,
            )),
            (ClientState::AwaitingAccept, Message::Accept { version }) => {
                self.on_accept(session, version, adapter)
            }
            (
                ClientState::AwaitingAccept,
                Message::Reject {
                    reason,
                    acceptable_versions,
                },
            ) => Err(self.fail(
                ClientState::Rejected,
                adapter,
                HandshakeError::Rejected {
                    reason,
                    acceptable_versions,
                },
            )),
            (ClientState::AwaitingTlsResult, Message::StartTlsResponse { result }) => {
                self.on_tls_result(session, result, adapter)
            }
            (state, other) => Err(self.fail(
                ClientState::Closed,
                adapter,
                HandshakeError::UnexpectedMessage {
                    tag: other.tag().name(),
                    state: state.name(),
                },
            )),
        }
    }

    fn on_closed(&mut self) -> HandshakeError {
        if !self.state.is_terminal() {
            self.state = ClientState::Closed;
        }
        HandshakeError::ConnectionClosed
    }
}

/// Server handshake states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    AwaitingConnect,
    AwaitingTlsRequest,
    Established,
    Rejected,
    Closed,
}

impl ServerState {
    pub fn name(self) -> &'static str {
        match self {
            Self::AwaitingConnect => "awaiting connect",
            Self::AwaitingTlsRequest => "awaiting TLS request",
            Self::Established => "established",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        }
    }
}

/// The server side of the handshake.
#[derive(Debug)]
pub struct ServerHandshake {
    state: ServerState,
    acceptable: Vec<ProtocolVersion>,
    tls: TlsPolicy,
    config: ProtocolConfig,
}

impl ServerHandshake {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            state: ServerState::AwaitingConnect,
            acceptable: config.server_bounds().descending(),
            tls: TlsPolicy::from_config(config),
            config: config.clone(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn reject(&mut self, reason: RejectReason, adapter: &mut dyn SessionAdapter) -> HandshakeError {
        adapter.send(Message::Reject {
            reason,
            acceptable_versions: self.acceptable.clone(),
        });
        adapter.close();
        self.state = ServerState::Rejected;
        HandshakeError::Rejected {
            reason,
            acceptable_versions: self.acceptable.clone(),
        }
    }

    fn establish(
        &mut self,
        version: ProtocolVersion,
        tls: Option<TlsResult>,
        adapter: &mut dyn SessionAdapter,
    ) -> Step {
        self.state = ServerState::Established;
        configure_timers(&self.config, adapter);
        Step::Established(Established { version, tls })
    }

    fn on_connect(
        &mut self,
        session: &Session,
        offered: Vec<ProtocolVersion>,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        if !self.config.enabled {
            tracing::info!("Server disabled, rejecting session {}", session.id());
            return Err(self.reject(RejectReason::ServerUnavailable, adapter));
        }

        let version = match negotiate_version(&self.acceptable, &offered) {
            Some(v) => v,
            None => {
                tracing::warn!(
                    "Session {} shares no protocol version with offer {:?}",
                    session.id(),
                    offered
                );
                return Err(self.reject(RejectReason::IncompatibleVersion, adapter));
            }
        };

        if self.tls.requires && !version.capabilities().contains(Capabilities::TLS_UPGRADE) {
            tracing::warn!(
                "Session {} requires TLS but {} cannot upgrade",
                session.id(),
                version
            );
            return Err(self.reject(RejectReason::IncompatibleVersion, adapter));
        }

        session.record_version(version);
        adapter.send(Message::Accept { version });
        tracing::debug!("Session {} accepted at {}", session.id(), version);

        if version.capabilities().contains(Capabilities::TLS_UPGRADE) {
            self.state = ServerState::AwaitingTlsRequest;
            Ok(Step::Continue)
        } else {
            Ok(self.establish(version, None, adapter))
        }
    }

    fn on_tls_request(
        &mut self,
        session: &Session,
        requirement: tandem_protocol::TlsRequirement,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        let Some(version) = session.negotiated_version() else {
            self.state = ServerState::Closed;
            adapter.close();
            return Err(HandshakeError::Protocol(
                "TLS request before version negotiation".to_string(),
            ));
        };

        let result = self.tls.respond(requirement);
        session.record_tls(result);
        tracing::debug!(
            "Session {} TLS negotiation: {} -> {}",
            session.id(),
            requirement,
            result
        );

        let response = Message::StartTlsResponse { result };
        match result {
            TlsResult::Ssl => {
                // The peer cannot decrypt until it has seen this response.
                adapter.install_tls(TlsRole::Acceptor);
                adapter.send_plaintext(response);
                Ok(self.establish(version, Some(result), adapter))
            }
            TlsResult::Plaintext => {
                adapter.send(response);
                Ok(self.establish(version, Some(result), adapter))
            }
            TlsResult::FailedNegotiation => {
                adapter.send(response);
                adapter.close();
                self.state = ServerState::Closed;
                Err(HandshakeError::TlsNegotiationFailed)
            }
        }
    }
}

impl HandshakeMachine for ServerHandshake {
    fn start(
        &mut self,
        _session: &Session,
        _adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        Ok(Step::Continue)
    }

    fn on_message(
        &mut self,
        session: &Session,
        message: Message,
        adapter: &mut dyn SessionAdapter,
    ) -> Result<Step, HandshakeError> {
        match (self.state, message) {
            (_, Message::KeepAlive) => Ok(Step::Continue),
            (_, Message::Disconnect) => {
                self.state = ServerState::Closed;
                adapter.close();
                Err(HandshakeError::ConnectionClosed)
            }
            (ServerState::AwaitingConnect, Message::Connect { offered_versions }) => {
                self.on_connect(session, offered_versions, adapter)
            }
            (ServerState::AwaitingTlsRequest, Message::StartTlsRequest { requirement }) => {
                self.on_tls_request(session, requirement, adapter)
            }
            (state, other) => {
                self.state = ServerState::Closed;
                adapter.close();
                Err(HandshakeError::UnexpectedMessage {
                    tag: other.tag().name(),
                    state: state.name(),
                })
            }
        }
    }

    fn on_closed(&mut self) -> HandshakeError {
        if !matches!(self.state, ServerState::Established | ServerState::Rejected) {
            self.state = ServerState::Closed;
        }
        HandshakeError::ConnectionClosed
    }
}

/// Observable state of a client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Pending,
    Established(Established),
    Failed(HandshakeError),
}

impl HandshakeOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Awaitable outcome of a client handshake. Resolved exactly once.
#[derive(Debug, Clone)]
pub struct Handshake {
    rx: watch::Receiver<HandshakeOutcome>,
}

/// The write side of a [`Handshake`].
///
/// Dropping it while the outcome is still pending resolves the
/// handshake to [`HandshakeError::ConnectionClosed`].
#[derive(Debug)]
pub struct HandshakeResolver {
    tx: watch::Sender<HandshakeOutcome>,
}

impl Handshake {
    pub fn new() -> (Handshake, HandshakeResolver) {
        let (tx, rx) = watch::channel(HandshakeOutcome::Pending);
        (Handshake { rx }, HandshakeResolver { tx })
    }

    /// Returns the current outcome without waiting.
    pub fn outcome(&self) -> HandshakeOutcome {
        self.rx.borrow().clone()
    }

    /// Waits for the outcome for at most `timeout`.
    ///
    /// Elapsing the timeout yields [`HandshakeError::TimedOut`] but leaves
    /// the handshake itself running.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Established, HandshakeError> {
        match tokio::time::timeout(timeout, self.resolved()).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::TimedOut),
        }
    }

    /// Waits for the outcome without a bound.
    pub async fn resolved(&mut self) -> Result<Established, HandshakeError> {
        let outcome = match self.rx.wait_for(|o| !o.is_pending()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => HandshakeOutcome::Failed(HandshakeError::ConnectionClosed),
        };
        match outcome {
            HandshakeOutcome::Established(established) => Ok(established),
            HandshakeOutcome::Failed(error) => Err(error),
            HandshakeOutcome::Pending => Err(HandshakeError::ConnectionClosed),
        }
    }
}

impl HandshakeResolver {
    /// Resolves the handshake. Only the first call has an effect.
    pub fn resolve(&self, result: Result<Established, HandshakeError>) -> bool {
        let outcome = match result {
            Ok(established) => HandshakeOutcome::Established(established),
            Err(error) => HandshakeOutcome::Failed(error),
        };
        self.tx.send_if_modified(|current| {
            if current.is_pending() {
                *current = outcome;
                true
            } else {
                false
            }
        })
    }
}

impl Drop for HandshakeResolver {
    fn drop(&mut self) {
        self.resolve(Err(HandshakeError::ConnectionClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChannelSink, Outbound, Outbox};
    use crate::session::Role;
    use std::sync::Arc;
    use tandem_protocol::TlsRequirement;

    fn v(n: u8) -> ProtocolVersion {
        ProtocolVersion::new(n).unwrap()
    }

    fn session(role: Role, config: &ProtocolConfig) -> Session {
        let (sink, _rx) = ChannelSink::new();
        Session::new(role, Arc::new(config.clone()), Arc::new(sink))
    }

    /// Runs both machines against each other in memory.
    fn run_pair(
        client_config: &ProtocolConfig,
        server_config: &ProtocolConfig,
    ) -> (
        Result<Established, HandshakeError>,
        Result<Established, HandshakeError>,
        Session,
        Session,
    ) {
        let client_session = session(Role::Client, client_config);
        let server_session = session(Role::Server, server_config);
        let mut client = ClientHandshake::new(client_config);
        let mut server = ServerHandshake::new(server_config);

        let mut client_out = Outbox::new();
        let mut server_out = Outbox::new();
        client.start(&client_session, &mut client_out).unwrap();
        server.start(&server_session, &mut server_out).unwrap();

        let mut client_result = None;
        let mut server_result = None;

        for _ in 0..8 {
            for op in client_out.drain() {
                if let Outbound::Send(m) | Outbound::SendPlaintext(m) = op {
                    if server_result.is_none() {
                        match server.on_message(&server_session, m, &mut server_out) {
                            Ok(Step::Established(e)) => server_result = Some(Ok(e)),
                            Ok(Step::Continue) => {}
                            Err(e) => server_result = Some(Err(e)),
                        }
                    }
                }
            }
            for op in server_out.drain() {
                if let Outbound::Send(m) | Outbound::SendPlaintext(m) = op {
                    if client_result.is_none() {
                        match client.on_message(&client_session, m, &mut client_out) {
                            Ok(Step::Established(e)) => client_result = Some(Ok(e)),
                            Ok(Step::Continue) => {}
                            Err(e) => client_result = Some(Err(e)),
                        }
                    }
                }
            }
            if client_result.is_some() && server_result.is_some() {
                break;
            }
        }

        (
            client_result.unwrap_or_else(|| Err(client.on_closed())),
            server_result.unwrap_or_else(|| Err(server.on_closed())),
            client_session,
            server_session,
        )
    }

    #[test]
    fn test_negotiate_version_prefers_server_order() {
        assert_eq!(negotiate_version(&[v(3), v(2)], &[v(1), v(2), v(3)]), Some(v(3)));
        assert_eq!(negotiate_version(&[v(3), v(2)], &[v(1)]), None);
        assert_eq!(negotiate_version(&[v(5), v(2)], &[v(4), v(3), v(2)]), Some(v(2)));
    }

    #[test]
    fn test_client_offers_descending_bounds() {
        let config = ProtocolConfig::default().with_client_versions(v(2), v(4));
        let session = session(Role::Client, &config);
        let mut client = ClientHandshake::new(&config);
        let mut out = Outbox::new();

        client.start(&session, &mut out).unwrap();
        assert_eq!(
            out.messages(),
            vec![&Message::Connect {
                offered_versions: vec![v(4), v(3), v(2)]
            }]
        );
        assert_eq!(client.state(), ClientState::AwaitingAccept);
    }

    #[test]
    fn test_tls_required_on_version_three() {
        let client_config = ProtocolConfig::default()
            .with_client_versions(v(1), v(3))
            .with_tls(true, true);
        let server_config = ProtocolConfig::default()
            .with_server_versions(v(2), v(3))
            .with_tls(true, true);

        let (client, server, client_session, server_session) =
            run_pair(&client_config, &server_config);

        let expected = Established {
            version: v(3),
            tls: Some(TlsResult::Ssl),
        };
        assert_eq!(client.unwrap(), expected);
        assert_eq!(server.unwrap(), expected);
        assert_eq!(client_session.negotiated_tls(), Some(TlsResult::Ssl));
        assert_eq!(server_session.negotiated_tls(), Some(TlsResult::Ssl));
        assert_eq!(server_session.negotiated_version(), Some(v(3)));
        assert!(server_session.correlator().is_some());
    }

    #[test]
    fn test_no_overlap_rejected() {
        let client_config = ProtocolConfig::default().with_client_versions(v(1), v(1));
        let server_config = ProtocolConfig::default().with_server_versions(v(2), v(3));

        let (client, server, client_session, _) = run_pair(&client_config, &server_config);

        let expected = HandshakeError::Rejected {
            reason: RejectReason::IncompatibleVersion,
            acceptable_versions: vec![v(3), v(2)],
        };
        assert_eq!(client.unwrap_err(), expected);
        assert_eq!(server.unwrap_err(), expected);
        assert!(!client_session.is_established());
        assert_eq!(client_session.negotiated_version(), None);
    }

    #[test]
    fn test_disabled_server_rejects_everything() {
        let config = ProtocolConfig::default();
        let server_config = ProtocolConfig::default().with_enabled(false);
        let (client, _, _, _) = run_pair(&config, &server_config);
        assert!(matches!(
            client,
            Err(HandshakeError::Rejected {
                reason: RejectReason::ServerUnavailable,
                ..
            })
        ));
    }

    #[test]
    fn test_server_requiring_tls_rejects_old_versions() {
        let client_config = ProtocolConfig::default().with_client_versions(v(1), v(2));
        let server_config = ProtocolConfig::default().with_tls(true, true);
        let (client, _, _, _) = run_pair(&client_config, &server_config);
        assert!(matches!(
            client,
            Err(HandshakeError::Rejected {
                reason: RejectReason::IncompatibleVersion,
                ..
            })
        ));
    }

    #[test]
    fn test_client_requiring_tls_disconnects_on_old_version() {
        let config = ProtocolConfig::default().with_tls(true, true);
        let session = session(Role::Client, &config);
        let mut client = ClientHandshake::new(&config);
        let mut out = Outbox::new();
        client.start(&session, &mut out).unwrap();
        out.drain();

        let result = client.on_message(&session, Message::Accept { version: v(2) }, &mut out);
        assert_eq!(result, Err(HandshakeError::TlsUnavailable { version: v(2) }));
        assert_eq!(out.ops(), &[Outbound::Send(Message::Disconnect), Outbound::Close]);
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[test]
    fn test_accept_outside_bounds_is_fatal() {
        let config = ProtocolConfig::default().with_client_versions(v(1), v(3));
        let session = session(Role::Client, &config);
        let mut client = ClientHandshake::new(&config);
        let mut out = Outbox::new();
        client.start(&session, &mut out).unwrap();
        out.drain();

        let result = client.on_message(&session, Message::Accept { version: v(5) }, &mut out);
        assert!(matches!(result, Err(HandshakeError::VersionOutOfBounds { .. })));
        assert!(out.closed());
        assert_eq!(session.negotiated_version(), None);
    }

    #[test]
    fn test_plaintext_when_server_lacks_tls() {
        let client_config = ProtocolConfig::default().with_tls(true, false);
        let server_config = ProtocolConfig::default();
        let (client, server, _, _) = run_pair(&client_config, &server_config);
        assert_eq!(
            client.unwrap(),
            Established {
                version: v(5),
                tls: Some(TlsResult::Plaintext)
            }
        );
        assert_eq!(server.unwrap().tls, Some(TlsResult::Plaintext));
    }

    #[test]
    fn test_tls_failure_closes_both_ends() {
        let client_config = ProtocolConfig::default();
        let server_config = ProtocolConfig::default().with_tls(true, true);
        let (client, server, _, _) = run_pair(&client_config, &server_config);
        assert_eq!(client.unwrap_err(), HandshakeError::TlsNegotiationFailed);
        assert_eq!(server.unwrap_err(), HandshakeError::TlsNegotiationFailed);
    }

    #[test]
    fn test_ssl_response_bypasses_tls_layer() {
        let config = ProtocolConfig::default().with_tls(true, false);
        let session = session(Role::Server, &config);
        let mut server = ServerHandshake::new(&config);
        let mut out = Outbox::new();

        server
            .on_message(
                &session,
                Message::Connect {
                    offered_versions: vec![v(4)],
                },
                &mut out,
            )
            .unwrap();
        out.drain();

        let step = server
            .on_message(
                &session,
                Message::StartTlsRequest {
                    requirement: TlsRequirement::Supported,
                },
                &mut out,
            )
            .unwrap();
        assert!(matches!(step, Step::Established(_)));
        assert_eq!(
            &out.ops()[..2],
            &[
                Outbound::InstallTls(TlsRole::Acceptor),
                Outbound::SendPlaintext(Message::StartTlsResponse {
                    result: TlsResult::Ssl
                }),
            ]
        );
    }

    #[test]
    fn test_unexpected_message_closes() {
        let config = ProtocolConfig::default();
        let session = session(Role::Server, &config);
        let mut server = ServerHandshake::new(&config);
        let mut out = Outbox::new();

        let result = server.on_message(&session, Message::Accept { version: v(2) }, &mut out);
        assert!(matches!(
            result,
            Err(HandshakeError::UnexpectedMessage { tag: "ACCEPT", .. })
        ));
        assert!(out.closed());

        // Keep-alives are tolerated before establishment
        let mut server = ServerHandshake::new(&config);
        let mut out = Outbox::new();
        assert_eq!(
            server.on_message(&session, Message::KeepAlive, &mut out),
            Ok(Step::Continue)
        );
    }

    #[tokio::test]
    async fn test_handshake_resolves_once() {
        let (mut handshake, resolver) = Handshake::new();
        assert!(handshake.outcome().is_pending());

        let established = Established {
            version: v(2),
            tls: None,
        };
        assert!(resolver.resolve(Ok(established)));
        assert!(!resolver.resolve(Err(HandshakeError::TimedOut)));
        drop(resolver);

        assert_eq!(
            handshake.wait(Duration::from_secs(1)).await,
            Ok(established)
        );
        assert_eq!(
            handshake.outcome(),
            HandshakeOutcome::Established(established)
        );
    }

    #[tokio::test]
    async fn test_dropped_resolver_fails_handshake() {
        let (mut handshake, resolver) = Handshake::new();
        drop(resolver);
        assert_eq!(
            handshake.wait(Duration::from_secs(1)).await,
            Err(HandshakeError::ConnectionClosed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_while_pending() {
        let (mut handshake, _resolver) = Handshake::new();
        assert_eq!(
            handshake.wait(Duration::from_millis(10)).await,
            Err(HandshakeError::TimedOut)
        );
        assert!(handshake.outcome().is_pending());
    }

    proptest::proptest! {
        #[test]
        fn prop_negotiates_highest_common_version(
            client_min in 1u8..=5,
            client_span in 0u8..5,
            server_min in 1u8..=5,
            server_span in 0u8..5,
        ) {
            let client_max = (client_min + client_span).min(5);
            let server_max = (server_min + server_span).min(5);
            let client_config =
                ProtocolConfig::default().with_client_versions(v(client_min), v(client_max));
            let server_config =
                ProtocolConfig::default().with_server_versions(v(server_min), v(server_max));

            let (client, server, _, _) = run_pair(&client_config, &server_config);

            let low = client_min.max(server_min);
            let high = client_max.min(server_max);
            if low <= high {
                proptest::prop_assert_eq!(client.unwrap().version, v(high));
                proptest::prop_assert_eq!(server.unwrap().version, v(high));
            } else {
                let rejected = matches!(
                    client,
                    Err(HandshakeError::Rejected { reason: RejectReason::IncompatibleVersion, .. })
                );
                proptest::prop_assert!(rejected);
                proptest::prop_assert!(server.is_err());
            }
        }
    }
}
