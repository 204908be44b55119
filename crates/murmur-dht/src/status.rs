//! Per-origin DHT membership bookkeeping.
//!
//! Each origin's most recent membership announcement is remembered as
//! `(expected next SeqNo, wants_join)`. The sequence meaning mirrors the
//! rumor vector status: an announcement applies iff its SeqNo is at least
//! the expected one, making replays of an old announcement no-ops.

use std::collections::BTreeMap;

use murmur_core::OriginId;

/// Latest membership knowledge about one origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipState {
    /// First announcement sequence not yet applied.
    pub expected_next: u32,
    /// Whether the origin's last applied announcement was a join.
    pub wants_join: bool,
}

impl Default for MembershipState {
    fn default() -> Self {
        Self {
            expected_next: 1,
            wants_join: false,
        }
    }
}

/// The membership map over every origin heard from.
#[derive(Debug, Default)]
pub struct DhtStatusMap {
    entries: BTreeMap<OriginId, MembershipState>,
}

impl DhtStatusMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an origin with default state, if new.
    pub fn register(&mut self, origin: &OriginId) {
        self.entries.entry(origin.clone()).or_default();
    }

    /// Applies an announcement.
    ///
    /// Returns true when the announcement was fresh (SeqNo at least the
    /// expected one) and the state was updated; stale announcements are
    /// ignored.
    pub fn apply(&mut self, origin: &OriginId, seq: u32, wants_join: bool) -> bool {
        let state = self.entries.entry(origin.clone()).or_default();
        if seq < state.expected_next {
            return false;
        }
        state.expected_next = seq + 1;
        state.wants_join = wants_join;
        true
    }

    /// Looks up an origin's state.
    pub fn get(&self, origin: &OriginId) -> Option<MembershipState> {
        self.entries.get(origin).copied()
    }

    /// Origins whose last applied announcement was a join.
    pub fn joiners(&self) -> impl Iterator<Item = &OriginId> {
        self.entries
            .iter()
            .filter(|(_, state)| state.wants_join)
            .map(|(origin, _)| origin)
    }

    /// Every origin with at least one applied announcement, with the
    /// sequence it was applied at. Used to unicast a catch-up snapshot.
    pub fn snapshot(&self) -> Vec<(OriginId, u32, bool)> {
        self.entries
            .iter()
            .filter(|(_, state)| state.expected_next > 1)
            .map(|(origin, state)| (origin.clone(), state.expected_next - 1, state.wants_join))
            .collect()
    }
}
