//! Event dispatch
//!
//! Routes inbound EVENT packets to the handlers registered for their name.
//! Handlers run in registration order on the session's driver task, so they
//! must not block.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::protocol::Packet;

/// Error returned by an event handler
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a handler; `Some` supplies the ACK payload when one is requested
pub type HandlerResult = Result<Option<Value>, HandlerError>;

/// A registered event handler
pub type EventHandler = Arc<dyn Fn(&[Value]) -> HandlerResult + Send + Sync>;

/// Wrap a closure as an [`EventHandler`]
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&[Value]) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event name to ordered handler list
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event`
    pub fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove the first registration of `handler` for `event`
    pub fn off(&self, event: &str, handler: &EventHandler) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            handlers.remove(event);
        }
        true
    }

    /// Number of handlers registered for `event`
    #[cfg(test)]
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }

    /// Total registrations across all events
    #[cfg(test)]
    pub fn registration_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    /// Invoke the handlers for `event` and build the ACK to send, if the
    /// peer asked for one.
    pub fn dispatch(&self, event: &str, args: &[Value], ack_id: Option<u64>) -> Option<Packet> {
        // Clone the list so handlers may register or remove handlers
        let handlers = self.handlers.read().get(event).cloned().unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!(event, "No handler registered");
        }

        let mut reply = None;
        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(args))) {
                Ok(Ok(value)) => {
                    if reply.is_none() {
                        reply = value;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(event, handler = index, "Event handler failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!(event, handler = index, "Event handler panicked");
                }
            }
        }

        ack_id.map(|id| Packet::ack(id, reply.into_iter().collect()))
    }
}
