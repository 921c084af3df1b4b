//! Runs a handshake machine over an async byte stream.

use crate::adapter::{Outbound, Outbox};
use crate::error::HandshakeError;
use crate::handshake::{Established, HandshakeMachine, Step};
use crate::session::Session;
use crate::tls::TlsRole;
use std::future::Future;
use std::io;
use std::time::Duration;
use tandem_protocol::{Decoder, Encoder, Message, MessageTag, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A stream that can wrap itself in a TLS record layer in place.
pub trait TlsUpgrade: AsyncRead + AsyncWrite + Unpin + Send + Sized {
    /// Performs the TLS handshake in `role` and returns the encrypted stream.
    fn upgrade(self, role: TlsRole) -> impl Future<Output = io::Result<Self>> + Send;
}

/// Drives `machine` to completion over `stream`.
///
/// Returns the (possibly upgraded) stream together with the decoder, which
/// may already hold bytes of the first established-phase frames. The
/// session is marked established before returning.
pub async fn drive_handshake<S, M>(
    session: &Session,
    stream: S,
    machine: &mut M,
    timeout: Duration,
) -> Result<(S, Decoder, Established), HandshakeError>
where
    S: TlsUpgrade,
    M: HandshakeMachine,
{
    match tokio::time::timeout(timeout, run(session, stream, machine)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::TimedOut),
    }
}

async fn run<S, M>(
    session: &Session,
    mut stream: S,
    machine: &mut M,
) -> Result<(S, Decoder, Established), HandshakeError>
where
    S: TlsUpgrade,
    M: HandshakeMachine,
{
    let mut decoder = Decoder::new();
    let mut outbox = Outbox::new();
    let mut buf = vec![0u8; 4096];

    let mut result = machine.start(session, &mut outbox);

    loop {
        stream = replay(session, stream, &mut outbox, &decoder).await?;

        match result {
            Ok(Step::Established(established)) => {
                session.mark_established();
                return Ok((stream, decoder, established));
            }
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
            Ok(Step::Continue) => {}
        }

        let message = loop {
            match decoder.decode_message(session.negotiated_version()) {
                Ok(Some(message)) => break message,
                Ok(None) => {}
                // A keep-alive may precede the version it would be decoded with.
                Err(ProtocolError::VersionRequired(tag))
                    if tag == MessageTag::KeepAlive.name() =>
                {
                    break Message::KeepAlive;
                }
                Err(e) => {
                    let _ = stream.shutdown().await;
                    return Err(HandshakeError::Protocol(e.to_string()));
                }
            }

            let n = stream
                .read(&mut buf)
                .await
                .map_err(|_| machine.on_closed())?;
            if n == 0 {
                return Err(machine.on_closed());
            }
            session.liveness().record_read();
            decoder.extend(&buf[..n]);
        };

        tracing::debug!("Session {} received {} during handshake", session.id(), message.tag());
        result = machine.on_message(session, message, &mut outbox);
    }
}

/// Performs the recorded adapter operations in order.
///
/// `install_tls` takes effect lazily: plaintext sends recorded after it
/// still go out in the clear, and the TLS handshake starts once they are
/// flushed or a regular send needs the new layer.
async fn replay<S: TlsUpgrade>(
    session: &Session,
    mut stream: S,
    outbox: &mut Outbox,
    decoder: &Decoder,
) -> Result<S, HandshakeError> {
    let mut pending_tls: Option<TlsRole> = None;
    let mut close = false;

    for op in outbox.drain() {
        match op {
            Outbound::Send(message) => {
                if let Some(role) = pending_tls.take() {
                    stream = upgrade(session, stream, role, decoder).await?;
                }
                write(session, &mut stream, &message).await?;
            }
            Outbound::SendPlaintext(message) => write(session, &mut stream, &message).await?,
            Outbound::Close => close = true,
            Outbound::ConfigureIdleTimers {
                read_idle,
                write_idle,
            } => session.liveness().configure(read_idle, write_idle),
            Outbound::InstallTls(role) => pending_tls = Some(role),
        }
    }

    if close {
        return Ok(stream);
    }
    if let Some(role) = pending_tls {
        stream = upgrade(session, stream, role, decoder).await?;
    }
    Ok(stream)
}

async fn write<S: TlsUpgrade>(
    session: &Session,
    stream: &mut S,
    message: &Message,
) -> Result<(), HandshakeError> {
    let frame = Encoder::encode_message(message, session.negotiated_version())
        .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
    stream
        .write_all(&frame)
        .await
        .map_err(|_| HandshakeError::ConnectionClosed)?;
    stream
        .flush()
        .await
        .map_err(|_| HandshakeError::ConnectionClosed)?;
    session.liveness().record_write();
    Ok(())
}

async fn upgrade<S: TlsUpgrade>(
    session: &Session,
    stream: S,
    role: TlsRole,
    decoder: &Decoder,
) -> Result<S, HandshakeError> {
    // Anything already buffered was sent in the clear after the switch.
    if decoder.buffered() > 0 {
        return Err(HandshakeError::Protocol(
            "plaintext bytes received before TLS handshake".to_string(),
        ));
    }
    tracing::debug!("Session {} upgrading connection to TLS as {:?}", session.id(), role);
    stream
        .upgrade(role)
        .await
        .map_err(|e| HandshakeError::TlsHandshake(e.to_string()))
}
