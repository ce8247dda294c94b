//! Internal message bus for routing hub messages.
//!
//! This module keeps track of:
//! - pending client invocations (`invoke` → `Completion`),
//! - open server-to-client streams (`StreamInvocation` → `StreamItem`s),
//! - server event handlers (`on` → `Invocation`).
//!
//! Every method is synchronous and never holds a lock while calling out, so
//! handlers may register or remove other handlers.

use futures_channel::{mpsc, oneshot};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::EventHandler;
use crate::error::HubError;

type Outcome = Result<Value, HubError>;

/// A pending invocation awaiting messages from the server.
pub enum PendingInvocation {
    /// Awaiting a single `Completion` message.
    Single(oneshot::Sender<Outcome>),
    /// Receiving `StreamItem` messages until `Completion`.
    Stream(mpsc::UnboundedSender<Outcome>),
}

/// Routing tables shared by the reader task and the public API.
#[derive(Clone, Default)]
pub struct MessageBus {
    handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    pending: Arc<Mutex<HashMap<String, PendingInvocation>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for a server event. Handlers for the same target all run.
    pub fn register_handler(&self, target: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .entry(target.to_lowercase())
            .or_default()
            .push(handler);
    }

    /// Removes every handler for a server event.
    pub fn remove_handlers(&self, target: &str) {
        self.handlers.lock().remove(&target.to_lowercase());
    }

    /// Calls the handlers registered for `target`.
    ///
    /// Targets match case-insensitively, like hub method names.
    pub fn dispatch_invocation(&self, target: &str, arguments: Vec<Value>) {
        let handlers = self
            .handlers
            .lock()
            .get(&target.to_lowercase())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(method = target, "No handler registered for server event");
        }
        for handler in handlers {
            handler(arguments.clone());
        }
    }

    /// Registers a pending invocation and returns a receiver for the result.
    pub fn register_pending(&self, id: &str) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(id.to_string(), PendingInvocation::Single(tx));
        rx
    }

    /// Registers a streaming invocation and returns a receiver for its items.
    ///
    /// The receiver yields items until the server sends a `Completion`; an
    /// error completion arrives as a final `Err` item.
    pub fn register_stream(&self, id: &str) -> mpsc::UnboundedReceiver<Outcome> {
        let (tx, rx) = mpsc::unbounded();
        self.pending
            .lock()
            .insert(id.to_string(), PendingInvocation::Stream(tx));
        rx
    }

    /// Completes a pending invocation with a result or error.
    pub fn complete_invocation(&self, id: &str, result: Outcome) {
        let Some(pending) = self.pending.lock().remove(id) else {
            debug!(invocation_id = id, "Completion for unknown invocation");
            return;
        };
        match pending {
            PendingInvocation::Single(tx) => {
                let _ = tx.send(result);
            }
            PendingInvocation::Stream(tx) => {
                if result.is_err() {
                    let _ = tx.unbounded_send(result);
                }
                // Dropping the sender ends the stream
            }
        }
    }

    /// Forwards a stream item to an open streaming invocation.
    pub fn send_stream_item(&self, id: &str, item: Value) {
        if let Some(PendingInvocation::Stream(tx)) = self.pending.lock().get(id) {
            let _ = tx.unbounded_send(Ok(item));
        }
    }

    /// Forgets a pending invocation without completing it.
    pub fn remove_pending(&self, id: &str) -> bool {
        self.pending.lock().remove(id).is_some()
    }

    /// Fails every pending invocation, e.g. when the connection closes.
    pub fn fail_all(&self, error: &HubError) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, invocation) in pending {
            match invocation {
                PendingInvocation::Single(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                PendingInvocation::Stream(tx) => {
                    let _ = tx.unbounded_send(Err(error.clone()));
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
