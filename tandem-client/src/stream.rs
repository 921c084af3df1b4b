//! Client connection stream, plain TCP until the TLS upgrade completes.

use pin_project_lite::pin_project;
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tandem_core::{TlsRole, TlsUpgrade};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;

/// Connector and SNI name used when the session upgrades to TLS.
#[derive(Clone)]
pub struct Upgrader {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

pin_project! {
    /// A client stream that can be either plain TCP or TLS.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain {
            #[pin]
            stream: TcpStream,
            upgrader: Option<Upgrader>,
        },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl ClientStream {
    pub fn new(stream: TcpStream, upgrader: Option<Upgrader>) -> Self {
        ClientStream::Plain { stream, upgrader }
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

impl TlsUpgrade for ClientStream {
    async fn upgrade(self, role: TlsRole) -> io::Result<Self> {
        if role != TlsRole::Initiator {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "client connections only initiate TLS",
            ));
        }
        match self {
            ClientStream::Plain {
                stream,
                upgrader: Some(upgrader),
            } => {
                let stream = upgrader
                    .connector
                    .connect(upgrader.server_name, stream)
                    .await?;
                Ok(ClientStream::Tls { stream })
            }
            ClientStream::Plain { upgrader: None, .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS is not configured",
            )),
            ClientStream::Tls { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "connection is already encrypted",
            )),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream, .. } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream, .. } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream, .. } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream, .. } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
