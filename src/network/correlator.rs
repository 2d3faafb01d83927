//! Ack correlation
//!
//! Pairs outbound EVENT packets that expect a reply with the ACK packets
//! coming back. Ids are allocated per session from a monotonically
//! increasing counter, so an id is never reused while it is pending.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{SessionError, SessionResult};

struct PendingAck {
    slot: oneshot::Sender<SessionResult<Vec<Value>>>,
    deadline: Instant,
}

/// Table of in-flight acknowledged requests
#[derive(Default)]
pub struct AckCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAck>>,
}

/// The caller's side of a pending ack
pub struct PendingReply {
    id: u64,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<SessionResult<Vec<Value>>>,
    correlator: Arc<AckCorrelator>,
}

impl AckCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and record a pending entry for it
    pub fn register(self: &Arc<Self>, timeout: Duration) -> PendingReply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let (slot, rx) = oneshot::channel();
        self.pending.lock().insert(id, PendingAck { slot, deadline });

        PendingReply {
            id,
            deadline,
            timeout,
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Complete the entry for `id`. Returns false for unknown or stale ids.
    pub fn resolve(&self, id: u64, args: Vec<Value>) -> bool {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(entry) if Instant::now() <= entry.deadline => {
                // The waiter may have given up already; that is fine
                let _ = entry.slot.send(Ok(args));
                true
            }
            Some(_) => {
                // Past its deadline; the waiter reports the timeout
                tracing::debug!(ack_id = id, "Discarding ACK that arrived after its deadline");
                false
            }
            None => {
                tracing::debug!(ack_id = id, "Discarding ACK with no pending request");
                false
            }
        }
    }

    /// Drop an entry without completing it
    pub fn remove(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Reject every pending entry with [`SessionError::Cancelled`]
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.slot.send(Err(SessionError::Cancelled));
        }
        count
    }

    /// Number of requests still awaiting an ACK
    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the ACK, the deadline or cancellation, whichever comes first
    pub async fn wait(mut self) -> SessionResult<Vec<Value>> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without an answer: the table was torn down
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => Err(SessionError::AckTimeout {
                ack_id: self.id,
                after: self.timeout,
            }),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // No-op when the ACK or a cancellation already took the entry
        self.correlator.remove(self.id);
    }
}
