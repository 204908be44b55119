//! The finger table and ring ownership rule.
//!
//! A table for a node at hash `h` on a ring of `N` spots has `log2(N)`
//! entries; entry `i` covers the interval `[(h + 2^i) mod N, (h + 2^(i+1))
//! mod N)` and points at the known member closest (by forward distance)
//! to the interval start. `one_behind` tracks the immediate ring
//! predecessor, which bounds the node's ownership interval from below.

use murmur_core::OriginId;
use tracing::debug;

use crate::ring::{forward_distance, ring_hash};

/// One finger-table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerEntry {
    /// First ring position this entry covers.
    pub interval_start: u32,
    /// One past the last position this entry covers (mod the ring).
    pub interval_end: u32,
    /// Member responsible for the interval start.
    pub origin: OriginId,
}

/// Outcome of feeding a member into the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerUpdate {
    /// At least one entry (or the predecessor) now names the new member.
    pub changed: bool,
    /// Entry 0 - the immediate successor - was displaced. The redundancy
    /// archive must be cleared: its contents belong to the new successor's
    /// predecessor relationship, not ours.
    pub successor_displaced: bool,
}

/// Finger table of one ring member.
#[derive(Debug, Clone)]
pub struct FingerTable {
    n_spots: u32,
    own_id: OriginId,
    own_hash: u32,
    items: Vec<FingerEntry>,
    one_behind: OriginId,
}

impl FingerTable {
    /// Builds the table of a freshly joined node: every entry and the
    /// predecessor point back at the node itself (singleton ring).
    pub fn new(n_spots: u32, own_id: OriginId) -> Self {
        debug_assert!(n_spots.is_power_of_two());
        let own_hash = ring_hash(&own_id, n_spots);
        let items = (0..n_spots.trailing_zeros())
            .map(|i| FingerEntry {
                interval_start: (own_hash + (1 << i)) % n_spots,
                interval_end: (own_hash + (1 << (i + 1))) % n_spots,
                origin: own_id.clone(),
            })
            .collect();
        Self {
            n_spots,
            one_behind: own_id.clone(),
            own_id,
            own_hash,
            items,
        }
    }

    /// The node's own ring hash.
    pub fn own_hash(&self) -> u32 {
        self.own_hash
    }

    /// The ring predecessor.
    pub fn one_behind(&self) -> &OriginId {
        &self.one_behind
    }

    /// The immediate successor (entry 0's occupant).
    pub fn successor(&self) -> &OriginId {
        &self.items[0].origin
    }

    /// The table entries, nearest interval first.
    pub fn entries(&self) -> &[FingerEntry] {
        &self.items
    }

    /// True when every entry and the predecessor point at the node itself.
    pub fn is_singleton(&self) -> bool {
        self.one_behind == self.own_id && self.items.iter().all(|e| e.origin == self.own_id)
    }

    /// Feeds a member into the table.
    ///
    /// Each entry keeps whichever of its occupant and the new member lies
    /// at the smaller forward distance from the interval start; the
    /// predecessor keeps whichever lies at the smaller (nonzero) forward
    /// distance to this node.
    pub fn add_node(&mut self, origin: &OriginId) -> FingerUpdate {
        let mut update = FingerUpdate::default();
        if *origin == self.own_id {
            return update;
        }
        let new_hash = ring_hash(origin, self.n_spots);

        for (i, entry) in self.items.iter_mut().enumerate() {
            let cur_hash = ring_hash(&entry.origin, self.n_spots);
            let cur_dist = forward_distance(entry.interval_start, cur_hash, self.n_spots);
            let new_dist = forward_distance(entry.interval_start, new_hash, self.n_spots);
            let displaced = if entry.origin == self.own_id {
                // Self is a placeholder, not a competitor.
                true
            } else {
                new_dist < cur_dist
            };
            if displaced && entry.origin != *origin {
                debug!(finger = i, origin = %origin, "finger entry updated");
                entry.origin = origin.clone();
                update.changed = true;
                if i == 0 {
                    update.successor_displaced = true;
                }
            }
        }

        if self.update_one_behind(origin, new_hash) {
            update.changed = true;
        }
        update
    }

    fn update_one_behind(&mut self, origin: &OriginId, new_hash: u32) -> bool {
        let new_dist = forward_distance(new_hash, self.own_hash, self.n_spots);
        if new_dist == 0 {
            return false;
        }
        let replace = if self.one_behind == self.own_id {
            true
        } else {
            let cur_hash = ring_hash(&self.one_behind, self.n_spots);
            new_dist < forward_distance(cur_hash, self.own_hash, self.n_spots)
        };
        if replace && self.one_behind != *origin {
            debug!(origin = %origin, "predecessor updated");
            self.one_behind = origin.clone();
            return true;
        }
        false
    }

    /// Replaces every finger occurrence of a leaving member.
    pub fn replace_member(&mut self, leaving: &OriginId, replacement: &OriginId) {
        for entry in &mut self.items {
            if entry.origin == *leaving {
                entry.origin = replacement.clone();
            }
        }
        if self.one_behind == *leaving {
            // Only the leaver's successor hears a better answer (the
            // handed-off predecessor); fall back to the replacement.
            self.one_behind = replacement.clone();
        }
    }

    /// Overrides the predecessor, for the leave handoff.
    pub fn set_one_behind(&mut self, origin: OriginId) {
        self.one_behind = origin;
    }

    /// True when ring position `k` falls in this node's ownership
    /// interval `(one_behind, self]`.
    pub fn owns(&self, k: u32) -> bool {
        let cur = self.own_hash;
        let prev = ring_hash(&self.one_behind, self.n_spots);
        if cur == prev {
            return true;
        }
        if cur > prev {
            prev < k && k <= cur
        } else {
            k > prev || k <= cur
        }
    }

    /// The member to forward a request for ring position `k` to: the
    /// occupant of the unique finger interval containing `k`.
    ///
    /// Returns `None` only for `k` equal to this node's own hash, which
    /// no interval covers (such requests are owned locally).
    pub fn route_for(&self, k: u32) -> Option<&OriginId> {
        for (i, entry) in self.items.iter().enumerate() {
            let width = 1u32 << i;
            if forward_distance(entry.interval_start, k, self.n_spots) < width {
                return Some(&entry.origin);
            }
        }
        None
    }
}
