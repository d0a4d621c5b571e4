//! Typed event listeners for MLLP connections.
//!
//! Connections surface inbound messages, transport/protocol errors, and
//! close notifications as events rather than return values. Multiple
//! listeners may subscribe to one event kind; emission happens in
//! registration order on the connection's read task.

use crate::error::AgentError;
use crate::hl7::Hl7Message;
use std::sync::{Arc, Mutex};

/// Severity of an error event. Warning-level events (orphan acks,
/// close-with-pending notices) leave the connection usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// An error surfaced on a connection.
#[derive(Debug)]
pub struct ErrorEvent {
    pub severity: Severity,
    pub error: AgentError,
}

impl ErrorEvent {
    pub fn error(error: AgentError) -> Self {
        Self {
            severity: Severity::Error,
            error,
        }
    }

    pub fn warning(error: AgentError) -> Self {
        Self {
            severity: Severity::Warning,
            error,
        }
    }
}

/// An ordered set of listeners for one event kind.
pub struct Listeners<T> {
    inner: Mutex<Vec<Arc<dyn Fn(&T) + Send + Sync>>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Listeners fire in registration order.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.inner
            .lock()
            .expect("listener registry poisoned")
            .push(Arc::new(listener));
    }

    /// Emit an event to every listener, in registration order.
    ///
    /// Listener handles are cloned out before invocation so a listener may
    /// subscribe further listeners without deadlocking.
    pub fn emit(&self, event: &T) {
        let listeners: Vec<_> = self
            .inner
            .lock()
            .expect("listener registry poisoned")
            .clone();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("listener registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The three event registries every connection carries.
#[derive(Default)]
pub struct ConnectionEvents {
    pub message: Listeners<Hl7Message>,
    pub error: Listeners<ErrorEvent>,
    pub close: Listeners<()>,
}
