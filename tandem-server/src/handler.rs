//! Request handlers for server sessions.

use crate::metrics::Metrics;
use bytes::Bytes;
use std::sync::Arc;
use tandem_core::{InboundHandler, Session};

/// Replies to every request with its own payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl InboundHandler for EchoHandler {
    async fn on_request(&self, session: Arc<Session>, payload: Bytes) -> Option<Bytes> {
        tracing::debug!("Session {} echoing {} bytes", session.id(), payload.len());
        Some(payload)
    }
}

/// Counts requests before handing them to the wrapped handler.
pub(crate) struct Metered<H> {
    inner: Arc<H>,
    metrics: Option<Arc<Metrics>>,
}

impl<H> Metered<H> {
    pub(crate) fn new(inner: Arc<H>, metrics: Option<Arc<Metrics>>) -> Self {
        Self { inner, metrics }
    }
}

impl<H: InboundHandler> InboundHandler for Metered<H> {
    async fn on_request(&self, session: Arc<Session>, payload: Bytes) -> Option<Bytes> {
        if let Some(ref metrics) = self.metrics {
            metrics.requests_total.inc();
        }
        self.inner.on_request(session, payload).await
    }

    fn on_event(&self, session: &Session, payload: Bytes) {
        self.inner.on_event(session, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ChannelSink, ProtocolConfig, Role};

    fn session() -> Arc<Session> {
        let (sink, _rx) = ChannelSink::new();
        Arc::new(Session::new(
            Role::Server,
            Arc::new(ProtocolConfig::default()),
            Arc::new(sink),
        ))
    }

    #[tokio::test]
    async fn test_echo() {
        let reply = EchoHandler
            .on_request(session(), Bytes::from_static(b"ping"))
            .await;
        assert_eq!(reply, Some(Bytes::from_static(b"ping")));
    }

    #[tokio::test]
    async fn test_metered_counts_requests() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = Metered::new(Arc::new(EchoHandler), Some(metrics.clone()));

        handler.on_request(session(), Bytes::new()).await;
        handler.on_request(session(), Bytes::new()).await;

        assert_eq!(metrics.requests_total.get(), 2.0);
    }
}
