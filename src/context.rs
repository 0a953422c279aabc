//! Narrow capability interfaces handed to each component.
//!
//! Components never reach for ambient globals. The host builds one
//! [`Services`] value at startup and passes the individual capabilities
//! (identity, clock, focus, event bus) into the constructors that need them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::events::EventBus;

/// Resolves the local user's identity.
pub trait IdentityProvider: Send + Sync {
    /// The local identity id, or `None` while the user is not in a valid
    /// session (not logged in). A raw id of zero means "absent".
    fn identity(&self) -> Option<u64>;
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Reports whether the local presentation surface currently has focus.
pub trait FocusProbe: Send + Sync {
    /// `true` while the user is looking at the app.
    fn is_focused(&self) -> bool;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Focus probe for headless hosts: never focused.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unfocused;

impl FocusProbe for Unfocused {
    fn is_focused(&self) -> bool {
        false
    }
}

/// Identity that can be set and cleared at runtime.
///
/// Zero is the "logged out" sentinel, so `set(0)` is equivalent to `clear()`.
#[derive(Debug, Default)]
pub struct SharedIdentity {
    id: AtomicU64,
}

impl SharedIdentity {
    /// Create an identity holder with an initial raw id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id: AtomicU64::new(id),
        }
    }

    /// Replace the identity.
    pub fn set(&self, id: u64) {
        self.id.store(id, Ordering::SeqCst);
    }

    /// Mark the user as logged out.
    pub fn clear(&self) {
        self.set(0);
    }
}

impl IdentityProvider for SharedIdentity {
    fn identity(&self) -> Option<u64> {
        match self.id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }
}

/// Focus flag that the host flips from its window callbacks.
#[derive(Debug, Default)]
pub struct SharedFocus {
    focused: AtomicBool,
}

impl SharedFocus {
    /// Record the current focus state.
    pub fn set(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }
}

impl FocusProbe for SharedFocus {
    fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }
}

/// Clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }
}

impl ManualClock {
    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Capabilities built once by the host and shared by handle.
#[derive(Clone)]
pub struct Services {
    /// Local identity.
    pub identity: Arc<dyn IdentityProvider>,
    /// Time source for rate limiting.
    pub clock: Arc<dyn Clock>,
    /// Focus state of the presentation surface.
    pub focus: Arc<dyn FocusProbe>,
    /// Domain event bus.
    pub bus: Arc<EventBus>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("identity", &self.identity.identity())
            .field("focused", &self.focus.is_focused())
            .finish_non_exhaustive()
    }
}

impl Services {
    /// Services for a headless host: system clock, never focused.
    #[must_use]
    pub fn headless(identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            identity,
            clock: Arc::new(SystemClock),
            focus: Arc::new(Unfocused),
            bus: Arc::new(EventBus::new()),
        }
    }
}
