//! The seams between the protocol engine and a transport.
//!
//! During the handshake the state machines talk to a [`SessionAdapter`].
//! They never perform I/O themselves: the transport passes an [`Outbox`],
//! the machine records what must happen and the transport replays the
//! recorded operations in order. Once established, sessions push encoded
//! frames through a [`MessageSink`] that the connection's writer drains.

use crate::error::CoreError;
use crate::tls::TlsRole;
use bytes::Bytes;
use std::time::Duration;
use tandem_protocol::{Encoder, Message, ProtocolVersion};
use tokio::sync::mpsc;

/// Operations the handshake needs from the underlying connection.
pub trait SessionAdapter {
    /// Queues a message through the normal pipeline.
    fn send(&mut self, message: Message);

    /// Queues a message that must bypass a TLS layer installed but not yet
    /// negotiated.
    fn send_plaintext(&mut self, message: Message);

    /// Closes the connection once everything queued before has been written.
    fn close(&mut self);

    /// Sets the read-idle and write-idle durations for the session.
    fn configure_idle_timers(&mut self, read_idle: Duration, write_idle: Duration);

    /// Inserts the TLS record layer into the pipeline.
    fn install_tls(&mut self, role: TlsRole);
}

/// One recorded adapter operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send(Message),
    SendPlaintext(Message),
    Close,
    ConfigureIdleTimers {
        read_idle: Duration,
        write_idle: Duration,
    },
    InstallTls(TlsRole),
}

/// A [`SessionAdapter`] that records operations for later replay.
#[derive(Debug, Default)]
pub struct Outbox {
    ops: Vec<Outbound>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Takes the recorded operations, leaving the outbox empty.
    pub fn drain(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.ops)
    }

    /// Returns the recorded messages, in order, regardless of pipeline.
    pub fn messages(&self) -> Vec<&Message> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Outbound::Send(m) | Outbound::SendPlaintext(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn ops(&self) -> &[Outbound] {
        &self.ops
    }

    pub fn closed(&self) -> bool {
        self.ops.contains(&Outbound::Close)
    }
}

impl SessionAdapter for Outbox {
    fn send(&mut self, message: Message) {
        self.ops.push(Outbound::Send(message));
    }

    fn send_plaintext(&mut self, message: Message) {
        self.ops.push(Outbound::SendPlaintext(message));
    }

    fn close(&mut self) {
        self.ops.push(Outbound::Close);
    }

    fn configure_idle_timers(&mut self, read_idle: Duration, write_idle: Duration) {
        self.ops.push(Outbound::ConfigureIdleTimers {
            read_idle,
            write_idle,
        });
    }

    fn install_tls(&mut self, role: TlsRole) {
        self.ops.push(Outbound::InstallTls(role));
    }
}

/// Items consumed by a connection writer.
#[derive(Debug)]
pub enum Outgoing {
    /// A complete encoded frame.
    Frame(Bytes),
    /// Flush what is queued, then shut the write half down.
    Close,
}

/// Non-blocking outbound path of an established session.
pub trait MessageSink: Send + Sync {
    /// Queues one encoded frame.
    fn send(&self, frame: Bytes) -> Result<(), CoreError>;

    /// Asks the writer to flush and shut down after the frames already queued.
    fn close(&self);

    /// Encodes `message` for `version` and queues it.
    fn send_message(
        &self,
        message: &Message,
        version: Option<ProtocolVersion>,
    ) -> Result<(), CoreError> {
        let frame = Encoder::encode_message(message, version)?;
        self.send(frame.freeze())
    }
}

/// A [`MessageSink`] over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ChannelSink {
    /// Creates a sink and the receiver its writer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn send(&self, frame: Bytes) -> Result<(), CoreError> {
        self.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| CoreError::SinkClosed)
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_protocol::Decoder;

    #[test]
    fn test_outbox_records_in_order() {
        let mut outbox = Outbox::new();
        outbox.install_tls(TlsRole::Acceptor);
        outbox.send_plaintext(Message::Disconnect);
        outbox.close();

        assert_eq!(
            outbox.ops(),
            &[
                Outbound::InstallTls(TlsRole::Acceptor),
                Outbound::SendPlaintext(Message::Disconnect),
                Outbound::Close,
            ]
        );
        assert!(outbox.closed());
        assert_eq!(outbox.messages(), vec![&Message::Disconnect]);

        let drained = outbox.drain();
        assert_eq!(drained.len(), 3);
        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_encodes_frames() {
        let (sink, mut rx) = ChannelSink::new();
        sink.send_message(&Message::KeepAlive, Some(ProtocolVersion::V2))
            .unwrap();
        sink.close();

        let frame = match rx.recv().await {
            Some(Outgoing::Frame(frame)) => frame,
            other => panic!("expected frame, got {:?}", other),
        };
        let mut decoder = Decoder::new();
        decoder.extend(&frame);
        assert_eq!(
            decoder.decode_message(Some(ProtocolVersion::V2)).unwrap(),
            Some(Message::KeepAlive)
        );
        assert!(matches!(rx.recv().await, Some(Outgoing::Close)));
    }

    #[test]
    fn test_channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(matches!(
            sink.send(Bytes::from_static(b"x")),
            Err(CoreError::SinkClosed)
        ));
    }

    #[test]
    fn test_unsupported_message_is_not_queued() {
        let (sink, mut rx) = ChannelSink::new();
        let result = sink.send_message(&Message::Suspend, Some(ProtocolVersion::V1));
        assert!(matches!(result, Err(CoreError::Protocol(_))));
        assert!(rx.try_recv().is_err());
    }
}
