//! Request/response correlation.
//!
//! Every outgoing call is tracked as a pending request until exactly one
//! of three things happens: its response arrives, its deadline passes, or
//! the session closes. The three paths race on the same [`DashMap`]; the
//! path whose `remove` returns the entry owns the completion, so a handler
//! can never fire twice.

use crate::adapter::MessageSink;
use crate::error::CoreError;
use crate::liveness::deadline_after;
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{Capabilities, CorrelationId, Message, ProtocolVersion, Request, Response};
use tokio::time::Instant;
use uuid::Uuid;

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The peer answered.
    Response(Bytes),
    /// The deadline passed first.
    TimedOut,
    /// The session closed first.
    SessionClosed,
}

/// Receives the outcome of one call.
///
/// `complete` consumes the handler, so it runs at most once.
pub trait ResponseHandler: Send + 'static {
    fn complete(self: Box<Self>, outcome: CallOutcome);
}

impl<F> ResponseHandler for F
where
    F: FnOnce(CallOutcome) + Send + 'static,
{
    fn complete(self: Box<Self>, outcome: CallOutcome) {
        (*self)(outcome)
    }
}

struct PendingRequest {
    deadline: Instant,
    handler: parking_lot::Mutex<Box<dyn ResponseHandler>>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub issued: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub closed: u64,
    pub discarded: u64,
    pub pending: usize,
}

/// Per-session table of in-flight calls.
pub struct Correlator {
    session_id: Uuid,
    version: ProtocolVersion,
    sink: Arc<dyn MessageSink>,
    rpc_timeout: Duration,
    pending: DashMap<CorrelationId, PendingRequest>,
    next_sequence: AtomicI64,
    closed: AtomicBool,
    issued: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    drained: AtomicU64,
    discarded: AtomicU64,
}

impl Correlator {
    pub fn new(
        session_id: Uuid,
        version: ProtocolVersion,
        sink: Arc<dyn MessageSink>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            version,
            sink,
            rpc_timeout,
            pending: DashMap::new(),
            next_sequence: AtomicI64::new(1),
            closed: AtomicBool::new(false),
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    fn next_id(&self) -> CorrelationId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        if self.version.capabilities().contains(Capabilities::COMPOUND_UUID) {
            CorrelationId::Compound {
                origin: self.session_id,
                sequence,
            }
        } else {
            CorrelationId::Numeric(sequence)
        }
    }

    /// Sends a call with the default deadline. See [`Self::send_request_with_timeout`].
    pub fn send_request(
        &self,
        payload: Bytes,
        handler: impl ResponseHandler,
    ) -> Result<CorrelationId, CoreError> {
        self.send_request_with_timeout(payload, self.rpc_timeout, handler)
    }

    /// Registers a pending call and transmits its request. Never blocks.
    ///
    /// On `Ok` the handler will be completed exactly once. On `Err` it has
    /// been dropped without being called.
    pub fn send_request_with_timeout(
        &self,
        payload: Bytes,
        timeout: Duration,
        handler: impl ResponseHandler,
    ) -> Result<CorrelationId, CoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoreError::SessionClosed);
        }

        let id = self.next_id();
        let time_constraint = self
            .version
            .capabilities()
            .contains(Capabilities::TIME_CONSTRAINTS)
            .then_some(timeout);
        let message = Message::Request(Request {
            correlation_id: id,
            time_constraint,
            payload,
        });

        // Encode before registering so an oversized payload leaves no trace.
        let frame = tandem_protocol::Encoder::encode_message(&message, Some(self.version))?;

        // Registered before transmission so the response can never beat it.
        self.pending.insert(
            id,
            PendingRequest {
                deadline: deadline_after(Instant::now(), timeout),
                handler: parking_lot::Mutex::new(Box::new(handler)),
            },
        );

        // A drain that ran between the check above and the insert missed this entry.
        if self.closed.load(Ordering::SeqCst) && self.pending.remove(&id).is_some() {
            return Err(CoreError::SessionClosed);
        }

        if let Err(e) = self.sink.send(frame.freeze()) {
            if self.pending.remove(&id).is_some() {
                return Err(e);
            }
        }

        // Only calls that reached the table are counted.
        self.issued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Session {} sent request {}", self.session_id, id);
        Ok(id)
    }

    /// Completes the matching call. Unknown or late responses are dropped.
    pub fn on_response(&self, response: Response) -> bool {
        match self.pending.remove(&response.correlation_id) {
            Some((_, pending)) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                pending
                    .handler
                    .into_inner()
                    .complete(CallOutcome::Response(response.payload));
                true
            }
            None => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Session {} discarding response for unknown or expired request {}",
                    self.session_id,
                    response.correlation_id
                );
                false
            }
        }
    }

    /// Times out every call whose deadline has passed.
    pub fn check_for_expired_requests(&self) -> usize {
        self.expire_at(Instant::now())
    }

    /// Times out every call with `deadline <= now`.
    pub fn expire_at(&self, now: Instant) -> usize {
        let overdue: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for id in overdue {
            if let Some((_, pending)) = self.pending.remove_if(&id, |_, p| p.deadline <= now) {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                pending.handler.into_inner().complete(CallOutcome::TimedOut);
                expired += 1;
            }
        }

        if expired > 0 {
            tracing::debug!("Session {} expired {} pending requests", self.session_id, expired);
        }
        expired
    }

    /// Completes every remaining call with [`CallOutcome::SessionClosed`]
    /// and refuses new ones.
    pub fn on_session_closed(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                self.drained.fetch_add(1, Ordering::Relaxed);
                pending.handler.into_inner().complete(CallOutcome::SessionClosed);
                drained += 1;
            }
        }

        if drained > 0 {
            tracing::debug!(
                "Session {} drained {} pending requests on close",
                self.session_id,
                drained
            );
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            issued: self.issued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            closed: self.drained.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("session_id", &self.session_id)
            .field("version", &self.version)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
