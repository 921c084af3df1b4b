//! The established-phase connection actor.
//!
//! One actor runs per session. It owns the read half of the stream and
//! spawns a writer task for the write half. Inbound messages are
//! dispatched in arrival order; liveness timers and the expiry scan run
//! in the same `select!` loop so they are never starved by traffic.

use crate::adapter::Outgoing;
use crate::session::{CloseReason, Role, Session};
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{Capabilities, Decoder, Message, ProtocolVersion, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

/// Receives requests and events from the peer.
pub trait InboundHandler: Send + Sync + 'static {
    /// Handles one request. `None` sends no reply.
    fn on_request(
        &self,
        session: Arc<Session>,
        payload: Bytes,
    ) -> impl Future<Output = Option<Bytes>> + Send;

    /// Handles one event.
    fn on_event(&self, session: &Session, payload: Bytes) {
        tracing::debug!("Session {} ignoring {} byte event", session.id(), payload.len());
    }
}

/// Ignores every request and event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl InboundHandler for NoopHandler {
    async fn on_request(&self, _session: Arc<Session>, _payload: Bytes) -> Option<Bytes> {
        None
    }
}

/// Runs the session until it closes and returns why it closed.
///
/// `decoder` carries bytes read during the handshake. `outbound` is the
/// receiver of the session's [`ChannelSink`](crate::adapter::ChannelSink).
pub async fn run_session<S, H>(
    session: Arc<Session>,
    stream: S,
    mut decoder: Decoder,
    outbound: mpsc::UnboundedReceiver<Outgoing>,
    handler: Arc<H>,
    mut shutdown: Option<broadcast::Receiver<()>>,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: InboundHandler,
{
    let Some(version) = session.negotiated_version() else {
        let reason = CloseReason::ProtocolViolation("session has no negotiated version".into());
        session.close(reason.clone());
        return reason;
    };

    let (mut reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(write_loop(session.clone(), writer, outbound));

    let mut buf = vec![0u8; 8192];
    let mut expiry = tokio::time::interval(session.config().expiry_scan_interval());
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        // Drain complete frames before reading more.
        match decoder.decode_message(Some(version)) {
            Ok(Some(message)) => {
                if let Some(reason) = dispatch(&session, &handler, version, message) {
                    break reason;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => break CloseReason::ProtocolViolation(e.to_string()),
        }

        let read_deadline = session.liveness().read_deadline();
        let write_deadline = session.liveness().write_deadline();

        tokio::select! {
            biased;

            _ = session.close_requested() => {
                let _ = session.send_message(&Message::Disconnect);
                break CloseReason::Local;
            }

            _ = shutdown_signal(&mut shutdown) => {
                if Message::Suspend.tag().is_supported_by(version) {
                    let _ = session.send_message(&Message::Suspend);
                }
                let _ = session.send_message(&Message::Disconnect);
                break CloseReason::Shutdown;
            }

            result = reader.read(&mut buf) => match result {
                Ok(0) => break CloseReason::Eof,
                Ok(n) => {
                    session.liveness().record_read();
                    decoder.extend(&buf[..n]);
                }
                Err(e) => break CloseReason::Io(e.to_string()),
            },

            _ = tokio::time::sleep_until(read_deadline) => {
                if session.liveness().on_read_idle(Instant::now()) {
                    tracing::warn!(
                        "Session {} heard nothing for {:?}, closing",
                        session.id(),
                        session.liveness().read_idle()
                    );
                    break CloseReason::DeadPeer;
                }
            }

            _ = tokio::time::sleep_until(write_deadline) => {
                if session.liveness().on_write_idle(Instant::now()) {
                    tracing::debug!("Session {} sending keep-alive", session.id());
                    if session.send_message(&Message::KeepAlive).is_err() {
                        break CloseReason::Io("outbound channel closed".into());
                    }
                }
            }

            _ = expiry.tick() => {
                if let Some(correlator) = session.correlator() {
                    correlator.check_for_expired_requests();
                }
            }
        }
    };

    tracing::info!(
        "Session {} ({}) closed: {}",
        session.id(),
        session.role(),
        reason
    );
    session.close(reason.clone());
    let _ = writer_task.await;
    reason
}

async fn shutdown_signal(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}

fn dispatch<H: InboundHandler>(
    session: &Arc<Session>,
    handler: &Arc<H>,
    version: ProtocolVersion,
    message: Message,
) -> Option<CloseReason> {
    match message {
        Message::Response(response) => {
            if let Some(correlator) = session.correlator() {
                correlator.on_response(response);
            }
            None
        }
        Message::Request(request) => {
            if session.role() == Role::Client
                && !version.capabilities().contains(Capabilities::BIDIRECTIONAL_RPC)
            {
                return Some(CloseReason::ProtocolViolation(format!(
                    "server-initiated request on {}",
                    version
                )));
            }
            spawn_request(session.clone(), handler.clone(), request);
            None
        }
        Message::Event { payload } => {
            handler.on_event(session, payload);
            None
        }
        Message::KeepAlive => None,
        Message::Disconnect => Some(CloseReason::PeerDisconnect),
        Message::Suspend => {
            tracing::info!("Session {} suspended by peer", session.id());
            session.mark_suspended();
            None
        }
        other => Some(CloseReason::ProtocolViolation(format!(
            "unexpected {} on established session",
            other.tag()
        ))),
    }
}

fn spawn_request<H: InboundHandler>(session: Arc<Session>, handler: Arc<H>, request: Request) {
    let received = Instant::now();
    tokio::spawn(async move {
        let Some(payload) = handler.on_request(session.clone(), request.payload).await else {
            return;
        };

        if let Some(budget) = request.time_constraint {
            if received.elapsed() > budget {
                tracing::debug!(
                    "Session {} dropping reply to {}: caller's {:?} budget elapsed",
                    session.id(),
                    request.correlation_id,
                    budget
                );
                return;
            }
        }

        let response = Message::Response(Response {
            correlation_id: request.correlation_id,
            payload,
        });
        if let Err(e) = session.send_message(&response) {
            tracing::debug!("Session {} failed to send response: {}", session.id(), e);
        }
    });
}

async fn write_loop<S>(
    session: Arc<Session>,
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Outgoing>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut batch = BytesMut::with_capacity(8192);

    'outer: while let Some(item) = outbound.recv().await {
        let mut close = false;
        match item {
            Outgoing::Frame(frame) => batch.extend_from_slice(&frame),
            Outgoing::Close => close = true,
        }

        // Coalesce whatever else is already queued into one write.
        while !close {
            match outbound.try_recv() {
                Ok(Outgoing::Frame(frame)) => batch.extend_from_slice(&frame),
                Ok(Outgoing::Close) => close = true,
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let written = async {
                writer.write_all(&batch).await?;
                writer.flush().await
            }
            .await;
            batch.clear();
            if let Err(e) = written {
                tracing::debug!("Session {} write failed: {}", session.id(), e);
                session.close(CloseReason::Io(e.to_string()));
                break 'outer;
            }
            session.liveness().record_write();
        }

        if close {
            break;
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ChannelSink;
    use crate::config::ProtocolConfig;
    use crate::correlator::CallOutcome;
    use tandem_protocol::{CorrelationId, Encoder};
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;

    struct Echo;

    impl InboundHandler for Echo {
        async fn on_request(&self, _session: Arc<Session>, payload: Bytes) -> Option<Bytes> {
            Some(payload)
        }
    }

    struct Peer {
        stream: DuplexStream,
        decoder: Decoder,
        version: ProtocolVersion,
    }

    impl Peer {
        async fn send(&mut self, message: &Message) {
            let frame = Encoder::encode_message(message, Some(self.version)).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(m) = self.decoder.decode_message(Some(self.version)).unwrap() {
                    return Some(m);
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.decoder.extend(&buf[..n]);
            }
        }
    }

    fn established(
        role: Role,
        version: ProtocolVersion,
        config: ProtocolConfig,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Outgoing>) {
        let (sink, rx) = ChannelSink::new();
        let session = Arc::new(Session::new(role, Arc::new(config), Arc::new(sink)));
        session.record_version(version);
        session.mark_established();
        (session, rx)
    }

    fn start<H: InboundHandler>(
        role: Role,
        version: ProtocolVersion,
        config: ProtocolConfig,
        handler: H,
    ) -> (Arc<Session>, Peer, tokio::task::JoinHandle<CloseReason>) {
        let (session, rx) = established(role, version, config);
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(run_session(
            session.clone(),
            local,
            Decoder::new(),
            rx,
            Arc::new(handler),
            None,
        ));
        let peer = Peer {
            stream: remote,
            decoder: Decoder::new(),
            version,
        };
        (session, peer, task)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (session, mut peer, _task) =
            start(Role::Client, ProtocolVersion::V2, ProtocolConfig::default(), NoopHandler);

        let (tx, rx) = oneshot::channel();
        let id = session
            .send_request(Bytes::from_static(b"hello"), move |o: CallOutcome| {
                let _ = tx.send(o);
            })
            .unwrap();

        let request = match peer.recv().await {
            Some(Message::Request(r)) => r,
            other => panic!("expected request, got {:?}", other),
        };
        assert_eq!(request.correlation_id, id);

        peer.send(&Message::Response(Response {
            correlation_id: id,
            payload: Bytes::from_static(b"world"),
        }))
        .await;

        assert_eq!(
            rx.await.unwrap(),
            CallOutcome::Response(Bytes::from_static(b"world"))
        );
    }

    #[tokio::test]
    async fn test_server_answers_requests() {
        let (_session, mut peer, _task) =
            start(Role::Server, ProtocolVersion::V3, ProtocolConfig::default(), Echo);

        peer.send(&Message::Request(Request {
            correlation_id: CorrelationId::Numeric(9),
            time_constraint: None,
            payload: Bytes::from_static(b"echo"),
        }))
        .await;

        match peer.recv().await {
            Some(Message::Response(r)) => {
                assert_eq!(r.correlation_id, CorrelationId::Numeric(9));
                assert_eq!(r.payload, Bytes::from_static(b"echo"));
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_disconnect_drains_pending_calls() {
        let (session, mut peer, task) =
            start(Role::Client, ProtocolVersion::V2, ProtocolConfig::default(), NoopHandler);

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            session
                .send_request(Bytes::new(), move |o: CallOutcome| {
                    let _ = tx.send(o);
                })
                .unwrap();
            receivers.push(rx);
        }

        peer.send(&Message::Disconnect).await;
        assert_eq!(task.await.unwrap(), CloseReason::PeerDisconnect);

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), CallOutcome::SessionClosed);
        }
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_local_close_sends_disconnect() {
        let (session, mut peer, task) =
            start(Role::Client, ProtocolVersion::V1, ProtocolConfig::default(), NoopHandler);

        session.request_close();
        assert_eq!(peer.recv().await, Some(Message::Disconnect));
        assert_eq!(peer.recv().await, None);
        assert_eq!(task.await.unwrap(), CloseReason::Local);
    }

    #[tokio::test]
    async fn test_suspend_blocks_new_calls() {
        let (session, mut peer, _task) =
            start(Role::Client, ProtocolVersion::V2, ProtocolConfig::default(), NoopHandler);

        peer.send(&Message::Suspend).await;
        peer.send(&Message::Event { payload: Bytes::new() }).await;
        // Once the event after SUSPEND is processed the flag must be set
        for _ in 0..100 {
            if session.is_suspended() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(session.is_suspended());
    }

    #[tokio::test]
    async fn test_server_request_on_v1_is_violation() {
        let (_session, mut peer, task) =
            start(Role::Client, ProtocolVersion::V1, ProtocolConfig::default(), NoopHandler);

        peer.send(&Message::Request(Request {
            correlation_id: CorrelationId::Numeric(1),
            time_constraint: None,
            payload: Bytes::new(),
        }))
        .await;

        assert!(matches!(
            task.await.unwrap(),
            CloseReason::ProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn test_handshake_message_after_establishment_is_violation() {
        let (_session, mut peer, task) =
            start(Role::Server, ProtocolVersion::V4, ProtocolConfig::default(), Echo);
        peer.send(&Message::Connect {
            offered_versions: vec![ProtocolVersion::V4],
        })
        .await;
        assert!(matches!(
            task.await.unwrap(),
            CloseReason::ProtocolViolation(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_and_dead_peer() {
        let config = ProtocolConfig::default()
            .with_keep_alive(Duration::from_secs(1), Duration::from_secs(3));
        let (session, mut peer, task) =
            start(Role::Client, ProtocolVersion::V2, config, NoopHandler);

        // The peer stays silent; we keep sending heartbeats until it is declared dead.
        assert_eq!(peer.recv().await, Some(Message::KeepAlive));
        assert_eq!(task.await.unwrap(), CloseReason::DeadPeer);

        let stats = session.liveness().stats();
        assert!(stats.heartbeats_sent >= 2);
        assert_eq!(stats.heartbeats_missed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_scan_times_out_calls() {
        let config = ProtocolConfig::default().with_rpc_timeout(Duration::from_millis(50));
        let (session, _peer, _task) = start(Role::Client, ProtocolVersion::V2, config, NoopHandler);

        let (tx, rx) = oneshot::channel();
        session
            .send_request(Bytes::new(), move |o: CallOutcome| {
                let _ = tx.send(o);
            })
            .unwrap();

        assert_eq!(rx.await.unwrap(), CallOutcome::TimedOut);
    }
}
