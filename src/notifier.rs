//! Edge-triggered "party is full" notifier.
//!
//! [`ThresholdNotifier`] watches the roster size and fires one outbound
//! notification each time the size newly reaches the configured threshold.
//!
//! # Policy
//!
//! Evaluated in order on every [`ThresholdNotifier::update`]:
//!
//! 1. First observation records a baseline and never sends.
//! 2. A flip of the cross-context flag re-baselines the same way.
//! 3. Unchanged size is a no-op.
//! 4. A size below the threshold re-arms the latch.
//! 5. Reaching the threshold with the latch clear sets the latch and sends,
//!    unless notifications are paused or the app is focused and focused
//!    notifications are disabled.
//!
//! The remembered size is updated at the end of every call. State changes
//! happen before the send is spawned, so a slow or failed send can never
//! cause a second one.

use std::fmt;
use std::sync::Arc;

use crate::constants::{MAX_PARTY_SIZE, MIN_PARTY_SIZE};
use crate::context::FocusProbe;
use crate::notifications::{NotificationSink, PartyFullNotification};

/// Party size that counts as "full". Always within `1..=8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Threshold(u8);

impl Threshold {
    /// Returns `None` outside `1..=8`.
    #[must_use]
    pub fn new(size: u8) -> Option<Self> {
        (MIN_PARTY_SIZE..=MAX_PARTY_SIZE)
            .contains(&size)
            .then_some(Self(size))
    }

    /// Clamp any integer into range.
    #[must_use]
    pub fn clamped(size: i64) -> Self {
        Self(size.clamp(i64::from(MIN_PARTY_SIZE), i64::from(MAX_PARTY_SIZE)) as u8)
    }

    /// Raw value.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    fn matches(self, size: usize) -> bool {
        size == usize::from(self.0)
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(MAX_PARTY_SIZE)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings read on every update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierSettings {
    /// Size that triggers a notification.
    pub threshold: Threshold,
    /// Suppress all outbound notifications.
    pub pause: bool,
    /// Send even while the app has focus.
    pub notify_when_focused: bool,
}

/// Debounce state. Mutated only by its notifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifierState {
    /// Size seen on the previous update; `None` before the first one.
    pub last_size: Option<usize>,
    /// Set once the current crossing has been handled.
    pub notified: bool,
    /// Cross-context flag seen on the previous update.
    pub last_cross: bool,
}

/// Why a crossing did not produce a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// Notifications are paused.
    Paused,
    /// The app is focused and focused notifications are off.
    Focused,
}

/// Which policy branch an update took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyDecision {
    /// First observation recorded.
    Baseline,
    /// Context flag flipped; baseline recorded again.
    ContextReset,
    /// Size did not change.
    Unchanged,
    /// Size dropped below the threshold; latch cleared.
    Rearmed,
    /// Size changed without reaching or leaving the threshold zone.
    Changed,
    /// Crossing handled and a notification was issued.
    Dispatched,
    /// Crossing handled but the send was suppressed.
    Suppressed(SuppressReason),
    /// Threshold reached again while the latch was still set.
    AlreadyNotified,
}

/// Sends one notification per threshold crossing.
pub struct ThresholdNotifier {
    settings: NotifierSettings,
    state: NotifierState,
    focus: Arc<dyn FocusProbe>,
    sink: Arc<dyn NotificationSink>,
}

impl fmt::Debug for ThresholdNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdNotifier")
            .field("settings", &self.settings)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ThresholdNotifier {
    /// Create a notifier in the uninitialized state.
    #[must_use]
    pub fn new(
        settings: NotifierSettings,
        focus: Arc<dyn FocusProbe>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            settings,
            state: NotifierState::default(),
            focus,
            sink,
        }
    }

    /// Replace the settings. State is kept.
    pub fn set_settings(&mut self, settings: NotifierSettings) {
        self.settings = settings;
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> NotifierSettings {
        self.settings
    }

    /// Current debounce state.
    #[must_use]
    pub fn state(&self) -> &NotifierState {
        &self.state
    }

    /// Feed one observation and, on a qualifying crossing, spawn the send.
    ///
    /// Must be called from within a tokio runtime for the send to happen;
    /// without one the crossing is still latched and the send is dropped
    /// with a warning.
    pub fn update(&mut self, size: usize, identity: u64, cross_context: bool) -> NotifyDecision {
        let decision = self.evaluate(size, cross_context);
        if decision == NotifyDecision::Dispatched {
            self.dispatch(PartyFullNotification::new(
                identity,
                size,
                self.settings.threshold.get(),
            ));
        }
        decision
    }

    /// Apply the policy to one observation without sending anything.
    pub fn evaluate(&mut self, size: usize, cross_context: bool) -> NotifyDecision {
        let threshold = self.settings.threshold;

        let Some(last_size) = self.state.last_size else {
            self.rebaseline(size, cross_context);
            return NotifyDecision::Baseline;
        };

        if cross_context != self.state.last_cross {
            log::debug!(
                "[Notifier] Roster context changed (cross={}), re-baselining at {}",
                cross_context,
                size
            );
            self.rebaseline(size, cross_context);
            return NotifyDecision::ContextReset;
        }

        if size == last_size {
            return NotifyDecision::Unchanged;
        }

        let decision = if size < usize::from(threshold.get()) {
            self.state.notified = false;
            NotifyDecision::Rearmed
        } else if !threshold.matches(size) {
            NotifyDecision::Changed
        } else if self.state.notified {
            NotifyDecision::AlreadyNotified
        } else {
            self.state.notified = true;
            match self.suppression() {
                Some(reason) => {
                    log::info!("[Notifier] Party full ({}) but notification {:?}", size, reason);
                    NotifyDecision::Suppressed(reason)
                }
                None => NotifyDecision::Dispatched,
            }
        };

        self.state.last_size = Some(size);
        decision
    }

    fn rebaseline(&mut self, size: usize, cross_context: bool) {
        self.state = NotifierState {
            last_size: Some(size),
            notified: self.settings.threshold.matches(size),
            last_cross: cross_context,
        };
    }

    fn suppression(&self) -> Option<SuppressReason> {
        if self.settings.pause {
            Some(SuppressReason::Paused)
        } else if !self.settings.notify_when_focused && self.focus.is_focused() {
            Some(SuppressReason::Focused)
        } else {
            None
        }
    }

    fn dispatch(&self, notification: PartyFullNotification) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("[Notifier] No async runtime; dropping party-full notification");
            return;
        };
        let sink = Arc::clone(&self.sink);
        handle.spawn(async move {
            if let Err(e) = sink.send(&notification).await {
                log::warn!("[Notifier] Failed to send party-full notification: {e}");
            }
        });
    }
}
