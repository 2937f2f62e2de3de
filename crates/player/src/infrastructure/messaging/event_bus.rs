//! Event Bus for distributing realtime events to independent consumers.
//!
//! The EventBus provides a push-based subscription model keyed by
//! [`EventKind`]. Subscribers register callbacks that are invoked synchronously
//! on the publishing task, in subscription order.
//!
//! Dispatch rules:
//! - `publish` fans out to a snapshot of the subscribers taken at call time, so
//!   a handler added during a dispatch does not see that same event
//! - a handler removed during a dispatch does not fire for the rest of it
//! - a panicking handler is caught and logged; the remaining handlers still run

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::ports::outbound::player_events::{EventKind, PlayerEvent};

type Handler = Arc<dyn Fn(&PlayerEvent) + Send + Sync + 'static>;

/// Identifies one registered handler. `Copy` so callers can stash it freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    kind: EventKind,
    id: u64,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchReport {
    /// Handlers that returned normally
    pub delivered: usize,
    /// Handlers that panicked
    pub failed: usize,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

impl Registry {
    fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.handlers
            .get(&handle.kind)
            .is_some_and(|list| list.iter().any(|(id, _)| *id == handle.id))
    }

    fn remove(&mut self, handle: SubscriptionHandle) -> bool {
        let Some(list) = self.handlers.get_mut(&handle.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != handle.id);
        list.len() != before
    }
}

/// Event bus for realtime events.
///
/// Cheap to clone; all clones share one registry. The bus holds strong
/// references to handlers until they are unsubscribed or the bus is cleared.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Create a new EventBus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    // Handlers never run while the registry lock is held, so a poisoned lock
    // can only come from a panic inside this module's own bookkeeping.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to one kind of event.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&PlayerEvent) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionHandle { kind, id }
    }

    /// Subscribe and get a guard that unsubscribes when dropped.
    pub fn subscribe_guarded(
        &self,
        kind: EventKind,
        handler: impl Fn(&PlayerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let handle = self.subscribe(kind, handler);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            handle,
        }
    }

    /// Remove one handler.
    ///
    /// Returns whether it was still registered; calling it again is a no-op.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.registry().remove(handle)
    }

    /// Dispatch an event to every current subscriber of its kind.
    pub fn publish(&self, event: PlayerEvent) -> DispatchReport {
        let kind = event.kind();
        let snapshot: Vec<(u64, Handler)> = self
            .registry()
            .handlers
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            // Skip handlers unsubscribed by an earlier handler in this dispatch
            if !self.registry().contains(SubscriptionHandle { kind, id }) {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.failed += 1;
                    tracing::error!(
                        event = %kind,
                        subscription = id,
                        panic = %panic_message(panic.as_ref()),
                        "Event handler panicked; continuing dispatch"
                    );
                }
            }
        }
        report
    }

    /// Get the number of subscribers for one kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Clear all subscribers.
    pub fn clear(&self) {
        self.registry().handlers.clear();
    }
}

/// Drop guard returned by [`EventBus::subscribe_guarded`].
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.handle);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
