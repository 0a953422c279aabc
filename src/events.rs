//! Type-keyed publish/subscribe event bus.
//!
//! Producers publish plain values; every handler registered for that
//! concrete type is invoked in registration order. The bus exists so the
//! auth lifecycle can reach status displays without either side knowing
//! about the other.
//!
//! # Dispatch
//!
//! `publish` takes the lock only long enough to clone the handler list for
//! the event's type, then releases it before invoking anything. Handlers may
//! therefore subscribe, unsubscribe or publish from inside a callback without
//! deadlocking, and such changes only affect later publications.
//!
//! A handler that panics or returns `Err` is logged and skipped; the remaining
//! handlers still run and the publisher never sees the failure.
//!
//! # Usage
//!
//! ```
//! use bloombell::events::EventBus;
//!
//! #[derive(Debug)]
//! struct Ping(u32);
//!
//! let bus = EventBus::new();
//! let id = bus.subscribe(|ping: &Ping| log::info!("got {}", ping.0));
//! bus.publish(Ping(1));
//! assert!(bus.unsubscribe::<Ping>(id));
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ErasedHandler = Arc<dyn Fn(&dyn Any) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: ErasedHandler,
}

/// Thread-safe, type-keyed event dispatcher.
pub struct EventBus {
    subscribers: Mutex<HashMap<TypeId, Vec<Subscriber>>>,
    next_id: AtomicU64,
    disposed: AtomicBool,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total: usize = self.lock().values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("event_types", &self.lock().len())
            .field("total_subscribers", &total)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Register an infallible handler for events of type `T`.
    pub fn subscribe<T, F>(&self, handler: F) -> SubscriptionId
    where
        T: Any,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_fallible(move |event: &T| {
            handler(event);
            Ok(())
        })
    }

    /// Register a handler that reports failure through its return value.
    ///
    /// An `Err` is logged with the event type name and otherwise ignored.
    pub fn subscribe_fallible<T, F>(&self, handler: F) -> SubscriptionId
    where
        T: Any,
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if self.is_disposed() {
            log::debug!(
                "[EventBus] Ignoring subscribe for {} after dispose",
                std::any::type_name::<T>()
            );
            return id;
        }

        let handler: ErasedHandler = Arc::new(move |event: &dyn Any| match event.downcast_ref::<T>() {
            Some(event) => handler(event),
            None => Ok(()),
        });

        self.lock()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Subscriber { id, handler });

        log::trace!(
            "[EventBus] Subscribed {:?} to {}",
            id,
            std::any::type_name::<T>()
        );
        id
    }

    /// Remove a handler previously registered for `T`.
    ///
    /// Returns `false` if no such subscription exists.
    pub fn unsubscribe<T: Any>(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let Some(handlers) = subscribers.get_mut(&TypeId::of::<T>()) else {
            return false;
        };
        let Some(index) = handlers.iter().position(|s| s.id == id) else {
            return false;
        };
        handlers.remove(index);
        if handlers.is_empty() {
            subscribers.remove(&TypeId::of::<T>());
        }
        true
    }

    /// Deliver `event` to every handler registered for `T`.
    ///
    /// No-op when nobody listens or the bus has been disposed.
    pub fn publish<T: Any>(&self, event: T) {
        if self.is_disposed() {
            return;
        }

        let snapshot: Vec<Subscriber> = match self.lock().get(&TypeId::of::<T>()) {
            Some(handlers) if !handlers.is_empty() => handlers.clone(),
            _ => return,
        };

        let type_name = std::any::type_name::<T>();
        let event: &dyn Any = &event;
        for subscriber in snapshot {
            if self.is_disposed() {
                break;
            }
            let handler = &subscriber.handler;
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("[EventBus] Handler {:?} failed for {}: {e:#}", subscriber.id, type_name);
                }
                Err(panic) => {
                    log::error!(
                        "[EventBus] Handler {:?} panicked for {}: {}",
                        subscriber.id,
                        type_name,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
    }

    /// Number of handlers registered for `T`.
    #[must_use]
    pub fn subscriber_count<T: Any>(&self) -> usize {
        self.lock().get(&TypeId::of::<T>()).map_or(0, Vec::len)
    }

    /// Drop every subscription and stop dispatching for good.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.lock().clear();
    }

    /// Whether [`Self::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TypeId, Vec<Subscriber>>> {
        // Handlers never run under this lock, so a poisoned guard only means a
        // panic during a plain Vec operation; the map is still consistent.
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
