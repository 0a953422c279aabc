//! Roster change tracking.
//!
//! [`RosterTracker`] keeps two snapshot slots and flips a parity bit on every
//! poll: the slot that becomes "current" is cleared and refilled from the
//! source, the other one is left untouched as "previous", and the diff
//! between them is delivered to listeners.
//!
//! # Failure model
//!
//! Listener failures are isolated per change. A panic escaping the poll
//! itself (for example from the roster source) is fatal to the tracker: it
//! logs, disposes itself and ignores all later ticks, because a half-applied
//! slot flip cannot be diffed against safely.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::source::{ingest, raw_size, RosterSource};
use super::{diff, MembershipChange, RosterSnapshot};
use crate::constants::{ROSTER_CAPACITY, ROSTER_POLL_INTERVAL};
use crate::context::{Clock, IdentityProvider};
use crate::events::panic_message;

/// Handle returned by [`RosterTracker::on_membership_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&MembershipChange) + Send + Sync>;

/// Timing state for roster polls.
#[derive(Debug, Default)]
struct PollGate {
    last_poll: Option<Instant>,
}

impl PollGate {
    /// The first check always passes.
    fn should_poll(&self, now: Instant, interval: Duration) -> bool {
        self.last_poll
            .map_or(true, |last| now.saturating_duration_since(last) >= interval)
    }

    fn mark_polled(&mut self, now: Instant) {
        self.last_poll = Some(now);
    }
}

/// Live view of the party roster.
pub struct RosterTracker {
    source: Arc<dyn RosterSource>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    slots: [RosterSnapshot; 2],
    /// Which slot is "current": `false` = slot 0, `true` = slot 1.
    parity: bool,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    gate: PollGate,
    interval: Duration,
    disposed: bool,
}

impl std::fmt::Debug for RosterTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RosterTracker")
            .field("current_len", &self.current().len())
            .field("previous_len", &self.previous().len())
            .field("parity", &self.parity)
            .field("listeners", &self.listeners.len())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl RosterTracker {
    /// Create a tracker polling `source` at most once per [`ROSTER_POLL_INTERVAL`].
    #[must_use]
    pub fn new(
        source: Arc<dyn RosterSource>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            identity,
            clock,
            slots: [
                RosterSnapshot::with_capacity(ROSTER_CAPACITY),
                RosterSnapshot::with_capacity(ROSTER_CAPACITY),
            ],
            parity: false,
            listeners: Vec::new(),
            next_listener: 0,
            gate: PollGate::default(),
            interval: ROSTER_POLL_INTERVAL,
            disposed: false,
        }
    }

    /// Override the minimum time between polls.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Register a listener for joins and leaves.
    pub fn on_membership_changed<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&MembershipChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Point-in-time member count as reported by the source.
    pub fn get_size(&self) -> usize {
        raw_size(self.source.as_ref(), self.source.is_cross_context())
    }

    /// Fresh copy of the live membership; empty while logged out.
    pub fn get_members(&self) -> RosterSnapshot {
        if self.identity.identity().is_none() {
            return RosterSnapshot::new();
        }
        let mut members = RosterSnapshot::with_capacity(self.current().len());
        ingest(
            self.source.as_ref(),
            self.source.is_cross_context(),
            &mut members,
        );
        members
    }

    /// Whether the roster currently comes from the cross-world aggregate.
    pub fn is_cross_context(&self) -> bool {
        self.source.is_cross_context()
    }

    /// Members seen on the most recent poll.
    #[must_use]
    pub fn last_snapshot(&self) -> &RosterSnapshot {
        self.current()
    }

    /// Host per-frame hook. Polls when the interval has elapsed.
    ///
    /// Returns `true` if a poll ran.
    pub fn on_frame(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        let now = self.clock.now();
        if !self.gate.should_poll(now, self.interval) {
            return false;
        }
        self.gate.mark_polled(now);
        self.tick();
        true
    }

    /// Poll once, regardless of the interval.
    pub fn tick(&mut self) {
        if self.disposed {
            return;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.poll())) {
            log::error!(
                "[Roster] Tick failed, disposing tracker: {}",
                panic_message(panic.as_ref())
            );
            self.dispose();
        }
    }

    /// Stop polling for good and release both snapshots.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.slots[0].clear();
        self.slots[1].clear();
    }

    /// Whether the tracker has stopped.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn poll(&mut self) {
        if self.identity.identity().is_none() {
            return;
        }

        self.parity = !self.parity;
        let cross_context = self.source.is_cross_context();

        let [first, second] = &mut self.slots;
        let (current, previous) = if self.parity {
            (second, &*first)
        } else {
            (first, &*second)
        };

        current.clear();
        ingest(self.source.as_ref(), cross_context, current);

        let changes = diff(previous, current);
        for change in &changes {
            self.emit(change);
        }
    }

    fn emit(&self, change: &MembershipChange) {
        for (id, listener) in &self.listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(change))) {
                log::error!(
                    "[Roster] Listener {:?} failed for {}: {}",
                    id,
                    change.member(),
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    fn current(&self) -> &RosterSnapshot {
        &self.slots[usize::from(self.parity)]
    }

    fn previous(&self) -> &RosterSnapshot {
        &self.slots[usize::from(!self.parity)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ManualClock, SharedIdentity};
    use crate::roster::source::{CrossGroup, CrossMemberRecord, LocalMemberRecord};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSource {
        local: Mutex<Vec<u64>>,
        cross: Mutex<Option<Vec<Vec<u64>>>>,
        explode: AtomicBool,
    }

    impl ScriptedSource {
        fn set_local(&self, ids: &[u64]) {
            *self.local.lock().unwrap() = ids.to_vec();
        }

        fn set_cross(&self, groups: Option<Vec<Vec<u64>>>) {
            *self.cross.lock().unwrap() = groups;
        }
    }

    impl RosterSource for ScriptedSource {
        fn is_cross_context(&self) -> bool {
            assert!(!self.explode.load(Ordering::SeqCst), "source exploded");
            self.cross.lock().unwrap().is_some()
        }

        fn local_members(&self) -> Vec<LocalMemberRecord> {
            self.local
                .lock()
                .unwrap()
                .iter()
                .map(|&id| LocalMemberRecord {
                    content_id: id,
                    name: format!("Local {id}"),
                    world_id: 1,
                    class_job_id: 1,
                    level: 1,
                })
                .collect()
        }

        fn cross_groups(&self) -> Option<Vec<CrossGroup>> {
            self.cross.lock().unwrap().as_ref().map(|groups| {
                groups
                    .iter()
                    .map(|ids| CrossGroup {
                        members: ids
                            .iter()
                            .map(|&id| CrossMemberRecord {
                                content_id: id,
                                name: format!("Cross {id}"),
                                home_world: 2,
                                class_job_id: 2,
                                level: 2,
                            })
                            .collect(),
                    })
                    .collect()
            })
        }
    }

    struct Harness {
        source: Arc<ScriptedSource>,
        identity: Arc<SharedIdentity>,
        clock: Arc<ManualClock>,
        tracker: RosterTracker,
        seen: Arc<Mutex<Vec<MembershipChange>>>,
    }

    fn harness() -> Harness {
        let source = Arc::new(ScriptedSource::default());
        let identity = Arc::new(SharedIdentity::new(4242));
        let clock = Arc::new(ManualClock::default());
        let mut tracker = RosterTracker::new(
            Arc::clone(&source) as Arc<dyn RosterSource>,
            Arc::clone(&identity) as Arc<dyn IdentityProvider>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tracker.on_membership_changed(move |change| sink.lock().unwrap().push(change.clone()));
        Harness {
            source,
            identity,
            clock,
            tracker,
            seen,
        }
    }

    fn drain(seen: &Mutex<Vec<MembershipChange>>, joined: bool) -> HashSet<u64> {
        let mut seen = seen.lock().unwrap();
        let ids = seen
            .iter()
            .filter(|c| c.joined() == joined)
            .map(|c| c.member().id.get())
            .collect();
        if !joined {
            seen.clear();
        }
        ids
    }

    #[test]
    fn test_first_tick_reports_every_member_as_joined() {
        let mut h = harness();
        h.source.set_local(&[1, 2, 3]);

        h.tracker.tick();

        assert_eq!(drain(&h.seen, true), HashSet::from([1, 2, 3]));
        assert!(drain(&h.seen, false).is_empty());
    }

    #[test]
    fn test_tick_reports_joins_and_leaves() {
        let mut h = harness();
        h.source.set_local(&[1, 2, 3]);
        h.tracker.tick();
        h.seen.lock().unwrap().clear();

        h.source.set_local(&[2, 3, 4]);
        h.tracker.tick();

        assert_eq!(drain(&h.seen, true), HashSet::from([4]));
        assert_eq!(drain(&h.seen, false), HashSet::from([1]));
    }

    #[test]
    fn test_unchanged_roster_emits_nothing() {
        let mut h = harness();
        h.source.set_local(&[1, 2]);
        h.tracker.tick();
        h.seen.lock().unwrap().clear();

        h.tracker.tick();
        h.tracker.tick();

        assert!(h.seen.lock().unwrap().is_empty());
        assert_eq!(h.tracker.last_snapshot().len(), 2);
    }

    #[test]
    fn test_zero_ids_never_enter_snapshots() {
        let mut h = harness();
        h.source.set_local(&[0, 5, 0]);
        h.tracker.tick();

        assert_eq!(drain(&h.seen, true), HashSet::from([5]));
        assert_eq!(h.tracker.get_size(), 3);
        assert_eq!(h.tracker.get_members().len(), 1);
    }

    #[test]
    fn test_logged_out_skips_tick_and_get_members_is_empty() {
        let mut h = harness();
        h.source.set_local(&[1, 2]);
        h.identity.clear();

        h.tracker.tick();

        assert!(h.seen.lock().unwrap().is_empty());
        assert!(h.tracker.get_members().is_empty());
        assert_eq!(h.tracker.get_size(), 2);
    }

    #[test]
    fn test_cross_context_uses_aggregate_view() {
        let mut h = harness();
        h.source.set_local(&[1, 2]);
        h.tracker.tick();
        h.seen.lock().unwrap().clear();

        h.source.set_cross(Some(vec![vec![2, 10], vec![11]]));
        h.tracker.tick();

        assert!(h.tracker.is_cross_context());
        assert_eq!(h.tracker.get_size(), 3);
        assert_eq!(drain(&h.seen, true), HashSet::from([10, 11]));
        assert_eq!(drain(&h.seen, false), HashSet::from([1]));
    }

    #[test]
    fn test_on_frame_is_rate_limited() {
        let mut h = harness();
        h.source.set_local(&[1]);

        assert!(h.tracker.on_frame());
        assert!(!h.tracker.on_frame());

        h.clock.advance(Duration::from_millis(999));
        assert!(!h.tracker.on_frame());

        h.clock.advance(Duration::from_millis(1));
        assert!(h.tracker.on_frame());
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let mut h = harness();
        h.tracker.on_membership_changed(|_| panic!("listener bug"));
        let late = Arc::new(Mutex::new(0_usize));
        let counter = Arc::clone(&late);
        h.tracker.on_membership_changed(move |_| *counter.lock().unwrap() += 1);

        h.source.set_local(&[1, 2]);
        h.tracker.tick();
        h.source.set_local(&[3]);
        h.tracker.tick();

        assert!(!h.tracker.is_disposed());
        // 2 joins, then 1 join + 2 leaves
        assert_eq!(*late.lock().unwrap(), 5);
        assert_eq!(h.seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_remove_listener() {
        let mut h = harness();
        let hits = Arc::new(Mutex::new(0_usize));
        let counter = Arc::clone(&hits);
        let id = h.tracker.on_membership_changed(move |_| *counter.lock().unwrap() += 1);

        assert!(h.tracker.remove_listener(id));
        assert!(!h.tracker.remove_listener(id));

        h.source.set_local(&[1]);
        h.tracker.tick();
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_source_panic_disposes_tracker() {
        let mut h = harness();
        h.source.set_local(&[1]);
        h.tracker.tick();
        h.seen.lock().unwrap().clear();

        h.source.explode.store(true, Ordering::SeqCst);
        h.tracker.tick();
        assert!(h.tracker.is_disposed());
        assert!(h.tracker.last_snapshot().is_empty());

        h.source.explode.store(false, Ordering::SeqCst);
        h.source.set_local(&[1, 2]);
        h.tracker.tick();
        h.clock.advance(Duration::from_secs(5));
        assert!(!h.tracker.on_frame());
        assert!(h.seen.lock().unwrap().is_empty());
    }
}
