//! Party roster model and change tracking.
//!
//! - [`source`] - Where members come from (the local party list or the
//!   cross-world aggregate) and the record shapes of each.
//! - [`tracker`] - Polls a source, keeps two alternating snapshots and
//!   reports joins and leaves.

pub mod source;
pub mod tracker;

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;

pub use source::{CrossGroup, CrossMemberRecord, FileRosterSource, LocalMemberRecord, RosterSource};
pub use tracker::{ListenerId, RosterTracker};

/// Stable member identity. Zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(NonZeroU64);

impl MemberId {
    /// Returns `None` for the zero sentinel.
    #[must_use]
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw id value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One party member as seen on a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    /// Stable identity.
    pub id: MemberId,
    /// Display name.
    pub name: String,
    /// Home world id.
    pub world_id: u32,
    /// Class/job id.
    pub class_job_id: u32,
    /// Character level.
    pub level: u32,
}

impl fmt::Display for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id={}, name=\"{}\", world={}, job={}, level={}}}",
            self.id, self.name, self.world_id, self.class_job_id, self.level
        )
    }
}

/// Members keyed by id.
pub type RosterSnapshot = HashMap<MemberId, MemberInfo>;

/// A single membership transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// Member present now but not on the previous poll.
    Joined(MemberInfo),
    /// Member present on the previous poll but gone now.
    Left(MemberInfo),
}

impl MembershipChange {
    /// `true` for [`MembershipChange::Joined`].
    #[must_use]
    pub fn joined(&self) -> bool {
        matches!(self, Self::Joined(_))
    }

    /// The member this change is about.
    #[must_use]
    pub fn member(&self) -> &MemberInfo {
        match self {
            Self::Joined(member) | Self::Left(member) => member,
        }
    }
}

/// Compute the transitions from `previous` to `current`.
///
/// Joins come first, then leaves. Runs in O(n) with map lookups.
#[must_use]
pub fn diff(previous: &RosterSnapshot, current: &RosterSnapshot) -> Vec<MembershipChange> {
    let joined = current
        .iter()
        .filter(|(id, _)| !previous.contains_key(id))
        .map(|(_, member)| MembershipChange::Joined(member.clone()));
    let left = previous
        .iter()
        .filter(|(id, _)| !current.contains_key(id))
        .map(|(_, member)| MembershipChange::Left(member.clone()));
    joined.chain(left).collect()
}
