//! Prometheus metrics for the tandem server.
//!
//! This module provides:
//! - Metrics registry with counters and gauges for sessions, handshakes and calls
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::core::Collector;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tandem_core::Session;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for the tandem server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted.
    pub connections_total: Counter,
    /// Currently active connections.
    pub connections_active: Gauge,
    /// Handshakes by outcome (`established`, `rejected`, `failed`, `timeout`).
    pub handshakes_total: CounterVec,
    /// Established sessions by negotiated version.
    pub sessions_by_version: CounterVec,
    /// Established sessions by TLS result.
    pub tls_results_total: CounterVec,
    /// Keep-alives sent.
    pub heartbeats_sent_total: Counter,
    /// Sessions closed because the peer went silent.
    pub heartbeats_missed_total: Counter,
    /// Requests received from clients.
    pub requests_total: Counter,
    /// Server-initiated calls that timed out.
    pub calls_timed_out_total: Counter,
    /// Responses that arrived after their call had completed.
    pub late_responses_total: Counter,
}

impl Metrics {
    /// Creates the metrics and registers them with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        Ok(Self {
            connections_total: counter(
                &registry,
                "tandem_connections_total",
                "TCP connections accepted",
            )?,
            connections_active: register(
                &registry,
                Gauge::with_opts(Opts::new(
                    "tandem_connections_active",
                    "Connections currently open",
                ))?,
            )?,
            handshakes_total: labelled(
                &registry,
                "tandem_handshakes_total",
                "Handshakes by outcome",
                "outcome",
            )?,
            sessions_by_version: labelled(
                &registry,
                "tandem_sessions_by_version_total",
                "Established sessions by negotiated protocol version",
                "version",
            )?,
            tls_results_total: labelled(
                &registry,
                "tandem_tls_results_total",
                "Established sessions by TLS negotiation result",
                "result",
            )?,
            heartbeats_sent_total: counter(
                &registry,
                "tandem_heartbeats_sent_total",
                "Keep-alive messages sent",
            )?,
            heartbeats_missed_total: counter(
                &registry,
                "tandem_heartbeats_missed_total",
                "Sessions closed after the read-idle timeout",
            )?,
            requests_total: counter(
                &registry,
                "tandem_requests_total",
                "Requests received from peers",
            )?,
            calls_timed_out_total: counter(
                &registry,
                "tandem_calls_timed_out_total",
                "Outgoing calls that expired without a response",
            )?,
            late_responses_total: counter(
                &registry,
                "tandem_late_responses_total",
                "Responses discarded because no call was pending",
            )?,
            registry,
        })
    }

    /// Folds the counters of a finished session into the totals.
    pub fn record_session_end(&self, session: &Session) {
        let liveness = session.liveness().stats();
        self.heartbeats_sent_total
            .inc_by(liveness.heartbeats_sent as f64);
        self.heartbeats_missed_total
            .inc_by(liveness.heartbeats_missed as f64);

        if let Some(correlator) = session.correlator() {
            let calls = correlator.stats();
            self.calls_timed_out_total.inc_by(calls.timed_out as f64);
            self.late_responses_total.inc_by(calls.discarded as f64);
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn register<M>(registry: &Registry, metric: M) -> Result<M, prometheus::Error>
where
    M: Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    register(registry, Counter::with_opts(Opts::new(name, help))?)
}

fn labelled(
    registry: &Registry,
    name: &str,
    help: &str,
    label: &str,
) -> Result<CounterVec, prometheus::Error> {
    register(registry, CounterVec::new(Opts::new(name, help), &[label])?)
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match req.uri().path() {
        "/metrics" => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(metrics.encode()))),
        "/health" | "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ChannelSink, ProtocolConfig, Role};
    use tandem_protocol::ProtocolVersion;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.connections_active.inc();
        metrics
            .handshakes_total
            .with_label_values(&["established"])
            .inc();
        metrics.sessions_by_version.with_label_values(&["v5"]).inc();

        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("tandem_connections_total 1"));
        assert!(encoded.contains("tandem_connections_active 1"));
        assert!(encoded.contains("tandem_handshakes_total{outcome=\"established\"} 1"));
        assert!(encoded.contains("tandem_sessions_by_version_total{version=\"v5\"} 1"));
    }

    #[test]
    fn test_record_session_end() {
        let metrics = Metrics::new().unwrap();
        let (sink, _rx) = ChannelSink::new();
        let session = Session::new(
            Role::Server,
            Arc::new(ProtocolConfig::default()),
            Arc::new(sink),
        );
        session.record_version(ProtocolVersion::V2);

        let far_future = tokio::time::Instant::now() + std::time::Duration::from_secs(3600);
        assert!(session.liveness().on_write_idle(far_future));
        assert!(session.liveness().on_read_idle(far_future));

        metrics.record_session_end(&session);
        let encoded = String::from_utf8(metrics.encode()).unwrap();
        assert!(encoded.contains("tandem_heartbeats_sent_total 1"));
        assert!(encoded.contains("tandem_heartbeats_missed_total 1"));
        assert!(encoded.contains("tandem_calls_timed_out_total 0"));
    }
}
