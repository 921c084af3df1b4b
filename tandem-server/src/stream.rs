//! Connection stream that starts in plaintext and can switch to TLS.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tandem_core::{TlsRole, TlsUpgrade};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::TlsAcceptor;

pin_project! {
    /// A server connection, plain TCP until the TLS upgrade is negotiated.
    #[project = MaybeStreamProj]
    pub enum MaybeTlsStream {
        Plain {
            #[pin]
            stream: TcpStream,
            acceptor: Option<TlsAcceptor>,
        },
        Tls { #[pin] stream: ServerTlsStream<TcpStream> },
    }
}

impl MaybeTlsStream {
    /// Wraps a freshly accepted connection.
    pub fn new(stream: TcpStream, acceptor: Option<TlsAcceptor>) -> Self {
        MaybeTlsStream::Plain { stream, acceptor }
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls { .. })
    }
}

impl TlsUpgrade for MaybeTlsStream {
    async fn upgrade(self, role: TlsRole) -> io::Result<Self> {
        if role != TlsRole::Acceptor {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "server connections only accept TLS",
            ));
        }
        match self {
            MaybeTlsStream::Plain {
                stream,
                acceptor: Some(acceptor),
            } => {
                let stream = acceptor.accept(stream).await?;
                Ok(MaybeTlsStream::Tls { stream })
            }
            MaybeTlsStream::Plain { acceptor: None, .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS is not configured",
            )),
            MaybeTlsStream::Tls { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "connection is already encrypted",
            )),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream, .. } => stream.poll_read(cx, buf),
            MaybeStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            MaybeStreamProj::Plain { stream, .. } => stream.poll_write(cx, buf),
            MaybeStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream, .. } => stream.poll_flush(cx),
            MaybeStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            MaybeStreamProj::Plain { stream, .. } => stream.poll_shutdown(cx),
            MaybeStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
