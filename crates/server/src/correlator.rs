//! Request/response correlation over one register-node stream.
//!
//! The bidi stream is a framed transport; [`StreamCorrelator`] makes it
//! behave like an RPC channel. Each outbound request gets a fresh UUID
//! correlation id and a one-shot completion slot in the pending table.
//! The per-stream reader task feeds inbound frames to
//! [`complete`](StreamCorrelator::complete); frames without a matching
//! pending call (late responses after a timeout, unknown ids) are
//! dropped there. Responses need not arrive in request order.
//!
//! The pending-table lock is never held across an await: `call` inserts
//! the slot, releases the lock, writes the frame, then waits on the
//! one-shot receiver under a deadline.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use edgeiam_common::{IamError, Result};
use edgeiam_proto::{node_message, server_message, ServerMessage};

/// Correlates outbound requests with inbound responses on one stream.
pub struct StreamCorrelator {
    outbound: mpsc::Sender<ServerMessage>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<node_message::Payload>>>,
    closed: AtomicBool,
}

impl StreamCorrelator {
    /// Creates a correlator writing request frames to `outbound`.
    pub fn new(outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self { outbound, pending: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// Sends `request` and waits for its response up to `timeout`.
    ///
    /// On timeout the pending call is removed and the eventually-arriving
    /// late response is silently dropped. A closed stream fails with
    /// `Unavailable`, which is the only retried kind.
    pub async fn call(
        &self,
        request: server_message::Request,
        timeout: Duration,
    ) -> Result<node_message::Payload> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IamError::unavailable("stream is closed"));
        }

        let correlation_id = Uuid::new_v4();
        let rx = self.insert_pending(correlation_id)?;

        let frame = ServerMessage {
            correlation_id: correlation_id.to_string(),
            request: Some(request),
        };

        if self.outbound.send(frame).await.is_err() {
            self.remove_pending(&correlation_id);
            return Err(IamError::unavailable("failed to send message"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            // The sender was dropped: the stream closed underneath us.
            Ok(Err(_)) => Err(IamError::unavailable("stream is closed")),
            Err(_) => {
                self.remove_pending(&correlation_id);
                Err(IamError::timed_out("response timeout"))
            }
        }
    }

    /// Completes the pending call matching `correlation_id`.
    ///
    /// Returns `false` when no call matches (late or unsolicited frame);
    /// the payload is dropped in that case.
    pub fn complete(&self, correlation_id: &str, payload: node_message::Payload) -> bool {
        let id = match Uuid::parse_str(correlation_id) {
            Ok(id) => id,
            Err(_) => return false,
        };

        let slot = self.pending.lock().remove(&id);
        match slot {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Fails every outstanding call with `Unavailable` and rejects new
    /// ones. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders wakes every waiter with a recv error.
        self.pending.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of in-flight calls.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn insert_pending(&self, id: Uuid) -> Result<oneshot::Receiver<node_message::Payload>> {
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().entry(id) {
            Entry::Occupied(_) => {
                // UUID collisions are negligible but the protocol must not
                // rely on that; a reused id is rejected outright.
                Err(IamError::already_exists(format!("correlation id {id} already in flight")))
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    fn remove_pending(&self, id: &Uuid) {
        self.pending.lock().remove(id);
    }
}
