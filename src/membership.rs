// Service membership as seen by one member.
//
// Membership detection is external; this module only records the ordered
// member list it is told about. Every change produces a new immutable
// snapshot with a higher version so that work queued under one view can be
// compared against a later one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Service member identifier. Zero means "no member".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u16);

impl MemberId {
    pub const NONE: MemberId = MemberId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable view of the service membership, oldest member first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    version: u64,
    this: MemberId,
    members: Vec<MemberId>,
}

impl MemberSnapshot {
    pub fn new(version: u64, this: MemberId, members: Vec<MemberId>) -> Self {
        Self {
            version,
            this,
            members,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn this_member(&self) -> MemberId {
        self.this
    }

    /// The senior member; the configuration coordinator.
    pub fn oldest(&self) -> Option<MemberId> {
        self.members.first().copied()
    }

    pub fn contains(&self, id: MemberId) -> bool {
        !id.is_none() && self.members.contains(&id)
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn others(&self) -> impl Iterator<Item = MemberId> + '_ {
        let this = self.this;
        self.members.iter().copied().filter(move |m| *m != this)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The local member's evolving view of the service.
#[derive(Debug)]
pub struct Membership {
    current: RwLock<Arc<MemberSnapshot>>,
}

impl Membership {
    pub fn new(this: MemberId, members: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            current: RwLock::new(Arc::new(MemberSnapshot::new(
                1,
                this,
                members.into_iter().collect(),
            ))),
        }
    }

    pub fn this_member(&self) -> MemberId {
        self.current.read().this
    }

    pub fn snapshot(&self) -> Arc<MemberSnapshot> {
        self.current.read().clone()
    }

    /// Add a member as the youngest. Returns the new snapshot.
    pub fn join(&self, id: MemberId) -> Arc<MemberSnapshot> {
        self.update(|members| {
            if !members.contains(&id) {
                members.push(id);
            }
        })
    }

    /// Remove a member. Returns the new snapshot.
    pub fn leave(&self, id: MemberId) -> Arc<MemberSnapshot> {
        self.update(|members| members.retain(|m| *m != id))
    }

    fn update(&self, change: impl FnOnce(&mut Vec<MemberId>)) -> Arc<MemberSnapshot> {
        let mut current = self.current.write();
        let mut members = current.members.clone();
        change(&mut members);
        let next = Arc::new(MemberSnapshot::new(current.version + 1, current.this, members));
        *current = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_is_first_joined() {
        let membership = Membership::new(MemberId(2), [MemberId(3), MemberId(1), MemberId(2)]);
        assert_eq!(membership.snapshot().oldest(), Some(MemberId(3)));

        let after = membership.leave(MemberId(3));
        assert_eq!(after.oldest(), Some(MemberId(1)));
        assert_eq!(after.version(), 2);
    }

    #[test]
    fn test_contains_never_matches_none() {
        let snapshot = MemberSnapshot::new(1, MemberId(1), vec![MemberId(1)]);
        assert!(snapshot.contains(MemberId(1)));
        assert!(!snapshot.contains(MemberId::NONE));
        assert!(!snapshot.contains(MemberId(7)));
    }

    #[test]
    fn test_join_is_idempotent_and_versioned() {
        let membership = Membership::new(MemberId(1), [MemberId(1)]);
        let first = membership.join(MemberId(2));
        let second = membership.join(MemberId(2));
        assert_eq!(first.members(), second.members());
        assert!(second.version() > first.version());
        assert_eq!(second.others().collect::<Vec<_>>(), vec![MemberId(2)]);
    }
}
