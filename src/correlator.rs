//! Request correlation — matches asynchronous responses to in-flight
//! requests by identifier.
//!
//! Every request registers a [`Pending`] entry and gets back a
//! [`RequestHandle`] that resolves exactly once: via a matching response, its
//! timeout, explicit cancellation, or session crash. Responses for unknown
//! identifiers (late arrivals after timeout, server resends) are logged
//! no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

use crate::error::ClientError;
use crate::protocol::{Notification, Request, cancel_params};
use crate::session::WriterCommand;

type ResponseSender = oneshot::Sender<Result<serde_json::Value, ClientError>>;

#[derive(Debug)]
struct Pending {
    method: &'static str,
    sent_at: Instant,
    tx: ResponseSender,
}

/// Tracks in-flight requests for one server session.
///
/// Shared between the bridge (submission) and the session reader task
/// (completion); all map access goes through one mutex.
#[derive(Debug)]
pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Register a request, transmit it, and return a handle that resolves
    /// when the matching response arrives (or the timeout expires).
    pub async fn send(
        self: &Arc<Self>,
        writer_tx: &mpsc::Sender<WriterCommand>,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<RequestHandle, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            Pending {
                method,
                sent_at: Instant::now(),
                tx,
            },
        );

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request)
            .map_err(|e| ClientError::Protocol(format!("unserializable request: {e}")))?;
        if writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            // Failed to enqueue — don't leak the pending entry.
            self.pending.lock().await.remove(&id);
            return Err(ClientError::ChannelClosed);
        }

        Ok(RequestHandle {
            id,
            method,
            timeout,
            rx,
            correlator: Arc::clone(self),
            writer_tx: writer_tx.clone(),
        })
    }

    /// Resolve the pending request for `id` with the full response body.
    ///
    /// A response with no matching entry is a no-op: the request may have
    /// timed out already or the server may have resent.
    pub async fn complete(&self, id: u64, body: serde_json::Value) {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(pending) => {
                let _ = pending.tx.send(Ok(body));
            }
            None => {
                tracing::debug!(id, "response for unknown or completed request ignored");
            }
        }
    }

    /// Remove a pending entry without resolving it (timeout path; the handle
    /// reports the error itself).
    pub async fn forget(&self, id: u64) {
        if let Some(pending) = self.pending.lock().await.remove(&id) {
            tracing::debug!(
                id,
                method = pending.method,
                elapsed_ms = pending.sent_at.elapsed().as_millis() as u64,
                "request abandoned after timeout"
            );
        }
    }

    /// Cancel a single pending request locally. Returns whether it was still
    /// in flight.
    pub async fn cancel(&self, id: u64) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(pending) => {
                let _ = pending.tx.send(Err(ClientError::Cancelled {
                    method: pending.method,
                }));
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding request (bridge stop). Returns the cancelled
    /// identifiers so the caller can notify the server.
    pub async fn cancel_all(&self) -> Vec<u64> {
        let drained: Vec<(u64, Pending)> = self.pending.lock().await.drain().collect();
        let mut ids = Vec::with_capacity(drained.len());
        for (id, pending) in drained {
            let _ = pending.tx.send(Err(ClientError::Cancelled {
                method: pending.method,
            }));
            ids.push(id);
        }
        ids
    }

    /// Fail every outstanding request with `ServerCrashed` (session death).
    pub async fn fail_all(&self, reason: &str) {
        let drained: Vec<(u64, Pending)> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            tracing::warn!(
                count = drained.len(),
                reason,
                "failing outstanding requests after server crash"
            );
        }
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(ClientError::crashed(reason)));
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Handle for one in-flight request.
///
/// Consumed by [`RequestHandle::wait`] or [`RequestHandle::cancel`]; either
/// way the request resolves exactly once.
#[derive(Debug)]
pub(crate) struct RequestHandle {
    id: u64,
    method: &'static str,
    timeout: Duration,
    rx: oneshot::Receiver<Result<serde_json::Value, ClientError>>,
    correlator: Arc<Correlator>,
    writer_tx: mpsc::Sender<WriterCommand>,
}

impl RequestHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the response, up to the request's timeout.
    pub async fn wait(mut self) -> Result<serde_json::Value, ClientError> {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolving: the pending table was torn
            // down along with its session.
            Ok(Err(_)) => Err(ClientError::crashed("response channel dropped")),
            Err(_) => {
                self.correlator.forget(self.id).await;
                Err(ClientError::Timeout {
                    method: self.method,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Cancel the request: notify the server with `$/cancelRequest` and
    /// resolve locally with `Cancelled` without waiting for acknowledgement.
    pub async fn cancel(self) {
        if self.correlator.cancel(self.id).await {
            let notification =
                Notification::new("$/cancelRequest", Some(cancel_params(self.id)));
            if let Ok(frame) = serde_json::to_value(&notification) {
                let _ = self.writer_tx.send(WriterCommand::Send(frame)).await;
            }
        }
    }
}
