//! Kind-keyed fan-out of uncorrelated inbound frames
//!
//! Handlers are registered per wire `type` and run in registration order on
//! the connection task. A handler that returns an error or panics is logged
//! and skipped; the remaining handlers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use costlink_common::protocol::InboundFrame;
use tracing::{trace, warn};

type Handler = Arc<dyn Fn(&InboundFrame) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
}

/// Registry of per-kind frame handlers
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

/// Handle returned by [`EventDispatcher::subscribe`]
///
/// Dropping the handle leaves the handler registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
pub struct Subscription {
    id: u64,
    kind: String,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Frame kind this subscription listens to
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Remove the handler; returns `false` if the dispatcher is gone
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = registry.handlers.get_mut(&self.kind) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(id, _)| *id != self.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            registry.handlers.remove(&self.kind);
        }
        removed
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for frames whose `type` equals `kind`
    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&InboundFrame) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind = kind.into();
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind.clone())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            id,
            kind,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Invoke every handler registered for the frame's kind
    ///
    /// Handlers are cloned out of the registry first, so a handler may
    /// subscribe or unsubscribe without deadlocking. Returns the number of
    /// handlers that completed successfully.
    pub fn dispatch(&self, frame: &InboundFrame) -> usize {
        let kind = frame.kind();
        let handlers: Vec<Handler> = match self.lock().handlers.get(kind) {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => {
                trace!(kind = %kind, "No handlers for frame kind");
                return 0;
            }
        };

        let mut succeeded = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    warn!(kind = %kind, error = %e, "Frame handler failed");
                }
                Err(panic_payload) => {
                    let panic_msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    warn!(kind = %kind, panic = %panic_msg, "Frame handler panicked");
                }
            }
        }
        succeeded
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: &str) -> usize {
        self.lock().handlers.get(kind).map_or(0, Vec::len)
    }
}
