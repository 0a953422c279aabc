//! Host-driven frame loop.
//!
//! [`Monitor`] stands in for the game's per-frame callback: every frame it
//! lets the [`RosterTracker`] decide whether a poll is due and feeds the
//! live roster size to the [`ThresholdNotifier`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::IdentityProvider;
use crate::notifier::{NotifyDecision, ThresholdNotifier};
use crate::roster::{MembershipChange, RosterTracker};

/// What one frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    /// Whether the tracker polled the roster.
    pub polled: bool,
    /// Notifier decision, or `None` while logged out.
    pub decision: Option<NotifyDecision>,
}

/// Drives a tracker and a notifier from one frame loop.
pub struct Monitor {
    tracker: RosterTracker,
    notifier: ThresholdNotifier,
    identity: Arc<dyn IdentityProvider>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("tracker", &self.tracker)
            .field("notifier", &self.notifier)
            .field("identity", &self.identity.identity())
            .finish()
    }
}

impl Monitor {
    /// Wire `tracker` and `notifier` together; joins and leaves are logged.
    pub fn new(
        mut tracker: RosterTracker,
        notifier: ThresholdNotifier,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        tracker.on_membership_changed(|change| match change {
            MembershipChange::Joined(member) => log::info!("[Roster] Joined: {}", member),
            MembershipChange::Left(member) => log::info!("[Roster] Left: {}", member),
        });
        Self {
            tracker,
            notifier,
            identity,
        }
    }

    /// Tracker, for registering extra listeners.
    pub fn tracker_mut(&mut self) -> &mut RosterTracker {
        &mut self.tracker
    }

    /// Notifier, for swapping settings at runtime.
    pub fn notifier_mut(&mut self) -> &mut ThresholdNotifier {
        &mut self.notifier
    }

    /// Run one frame.
    pub fn on_frame(&mut self) -> FrameReport {
        let polled = self.tracker.on_frame();

        let decision = self.identity.identity().map(|identity| {
            let decision = self.notifier.update(
                self.tracker.get_size(),
                identity,
                self.tracker.is_cross_context(),
            );
            if !matches!(decision, NotifyDecision::Unchanged) {
                log::debug!("[Notifier] {:?}", decision);
            }
            decision
        });

        FrameReport { polled, decision }
    }

    /// Run frames every `frame_interval` until `shutdown` fires or the
    /// tracker disposes itself.
    pub async fn run(mut self, frame_interval: Duration, shutdown: CancellationToken) {
        let mut frames = tokio::time::interval(frame_interval);
        frames.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("[Monitor] Watching roster every {:?}", frame_interval);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    log::info!("[Monitor] Shutdown requested");
                    break;
                }
                _ = frames.tick() => {
                    self.on_frame();
                    if self.tracker.is_disposed() {
                        log::error!("[Monitor] Roster tracker stopped; exiting");
                        break;
                    }
                }
            }
        }

        self.tracker.dispose();
    }
}
