//! Request/response correlation
//!
//! Every correlated request gets a fresh correlation id, carried as
//! `messageId`, and a pending entry holding the sending half of a oneshot
//! channel. The entry is settled exactly once: by the matching response, by
//! the connection dropping, by cancellation, or by the caller's timeout.
//! Settling always removes the entry.
//!
//! **Correlation id format:** `<kind>-<unix millis>-<sequence>-<random>`.
//! The sequence number is per correlator and never reset, so ids are never
//! reused within a process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use costlink_common::protocol::{OutboundFrame, RequestKind, ResponseFrame};
use costlink_common::time::{duration_to_millis, unix_millis};
use costlink_common::{Error, Result};
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::ConnectionManager;

/// Outcome delivered to the awaiting caller
pub type RequestOutcome = Result<ResponseFrame>;

/// One outstanding request
#[derive(Debug)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub created_at: Instant,
    responder: oneshot::Sender<RequestOutcome>,
}

impl PendingRequest {
    /// Deliver the outcome; a caller that already gave up is ignored
    pub(crate) fn resolve(self, outcome: RequestOutcome) {
        let _ = self.responder.send(outcome);
    }
}

/// Table of outstanding requests keyed by correlation id
///
/// Shared between the correlator, which registers entries, and the frame
/// router, which settles them from the connection task.
#[derive(Debug, Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new entry and return the receiving half of its channel
    ///
    /// Fails with [`Error::Internal`] if the id is already pending.
    pub fn register(
        &self,
        message_id: &str,
        kind: RequestKind,
    ) -> Result<oneshot::Receiver<RequestOutcome>> {
        let mut table = self.lock();
        if table.contains_key(message_id) {
            return Err(Error::Internal(format!(
                "correlation id {} is already pending",
                message_id
            )));
        }

        let (responder, receiver) = oneshot::channel();
        table.insert(
            message_id.to_string(),
            PendingRequest {
                kind,
                created_at: Instant::now(),
                responder,
            },
        );
        Ok(receiver)
    }

    /// Remove and return the entry for `message_id`
    pub fn take(&self, message_id: &str) -> Option<PendingRequest> {
        self.lock().remove(message_id)
    }

    /// Remove and return the entry for `message_id` only if `accept` approves its kind
    pub fn take_if(
        &self,
        message_id: &str,
        accept: impl FnOnce(RequestKind) -> bool,
    ) -> Option<PendingRequest> {
        let mut table = self.lock();
        match table.get(message_id) {
            Some(entry) if accept(entry.kind) => table.remove(message_id),
            _ => None,
        }
    }

    /// Settle one entry; returns `false` if nothing was pending under that id
    pub fn settle(&self, message_id: &str, outcome: RequestOutcome) -> bool {
        match self.take(message_id) {
            Some(entry) => {
                entry.resolve(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without delivering anything
    pub fn remove(&self, message_id: &str) -> bool {
        self.lock().remove(message_id).is_some()
    }

    /// Reject every outstanding entry with [`Error::ConnectionClosed`]
    ///
    /// Returns the number of entries rejected.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (message_id, entry) in drained {
            debug!(message_id = %message_id, kind = %entry.kind, "Rejecting pending request");
            entry.resolve(Err(Error::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes the pending entry if the awaiting future is dropped early
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.message_id);
    }
}

/// Sends correlated requests over the shared connection
#[derive(Clone)]
pub struct RequestCorrelator {
    connection: ConnectionManager,
    pending: PendingRequests,
    sequence: Arc<AtomicU64>,
}

impl RequestCorrelator {
    pub fn new(connection: ConnectionManager, pending: PendingRequests) -> Self {
        Self {
            connection,
            pending,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Generate the next correlation id for `kind`
    pub fn next_id(&self, kind: RequestKind) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::thread_rng().gen();
        format!("{}-{}-{}-{:08x}", kind.as_str(), unix_millis(), sequence, suffix)
    }

    /// Send a request with the configured default timeout
    pub async fn request(&self, kind: RequestKind, payload: Map<String, Value>) -> RequestOutcome {
        let timeout = self.connection.config().request_timeout;
        self.send_request(kind, payload, timeout).await
    }

    /// Send a request and wait for its response
    ///
    /// **Outcomes:**
    /// - `Ok(frame)`: response with `status: "success"`
    /// - [`Error::Application`]: response with `status: "error"`
    /// - [`Error::RequestTimeout`]: nothing arrived within `timeout`
    /// - [`Error::ConnectionClosed`]: the connection dropped first
    /// - [`Error::NotConnected`]: the frame could not be sent
    /// - [`Error::Cancelled`]: [`cancel`](Self::cancel) was called
    ///
    /// Dropping the returned future removes the pending entry.
    pub async fn send_request(
        &self,
        kind: RequestKind,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> RequestOutcome {
        let message_id = self.next_id(kind);
        self.send_request_with_id(message_id, kind, payload, timeout)
            .await
    }

    /// Like [`send_request`](Self::send_request) with a caller-chosen id
    ///
    /// Lets the caller keep the id for [`cancel`](Self::cancel). The id
    /// should come from [`next_id`](Self::next_id); an id that is already
    /// pending is rejected with [`Error::Internal`].
    pub async fn send_request_with_id(
        &self,
        message_id: String,
        kind: RequestKind,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> RequestOutcome {
        let mut receiver = self.pending.register(&message_id, kind)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            message_id: &message_id,
        };

        let frame = OutboundFrame::Request {
            kind,
            message_id: message_id.clone(),
            payload,
        };
        if let Err(e) = self.connection.send(&frame) {
            debug!(kind = %kind, message_id = %message_id, error = %e, "Request not sent");
            return Err(e);
        }
        debug!(kind = %kind, message_id = %message_id, "Request sent");

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Internal(format!(
                "pending entry {} dropped without an outcome",
                message_id
            ))),
            Err(_) => {
                if self.pending.remove(&message_id) {
                    warn!(
                        kind = %kind,
                        message_id = %message_id,
                        timeout_ms = duration_to_millis(timeout),
                        "Request timed out"
                    );
                    Err(Error::RequestTimeout {
                        kind: kind.as_str().to_string(),
                        message_id: message_id.clone(),
                        timeout_ms: duration_to_millis(timeout),
                    })
                } else {
                    // Settled in the same instant the timer fired
                    receiver.try_recv().unwrap_or_else(|_| {
                        Err(Error::Internal(format!(
                            "pending entry {} settled without an outcome",
                            message_id
                        )))
                    })
                }
            }
        }
    }

    /// Reject an outstanding request with [`Error::Cancelled`]
    ///
    /// A response arriving later for the same id is not delivered to the
    /// caller. Returns `false` if the request had already settled.
    pub fn cancel(&self, message_id: &str) -> bool {
        let cancelled = self.pending.settle(message_id, Err(Error::Cancelled));
        if cancelled {
            debug!(message_id = %message_id, "Request cancelled");
        }
        cancelled
    }

    /// Number of requests awaiting an outcome
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}
