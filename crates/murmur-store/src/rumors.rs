//! Per-origin append-only rumor logs with vector status.
//!
//! For every origin the store holds a contiguous prefix `1..N` of that
//! origin's rumors; the vector status entry is `N + 1`, the first unseen
//! sequence. Contiguity is structural - a log is a `Vec` indexed by
//! `seq - 1` and only the next-expected sequence can be appended.

use std::collections::BTreeMap;

use murmur_core::OriginId;
use murmur_proto::{Rumor, StatusVector};
use tracing::debug;

/// The gossip archive: every rumor this node has accepted, per origin.
#[derive(Debug, Default)]
pub struct RumorStore {
    logs: BTreeMap<OriginId, Vec<Rumor>>,
}

impl RumorStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an origin with an empty log, if not already known.
    ///
    /// New origins are auto-registered on first reference, including
    /// origins first seen in an inbound status.
    pub fn register(&mut self, origin: &OriginId) {
        if !self.logs.contains_key(origin) {
            debug!(origin = %origin, "registering new origin");
            self.logs.insert(origin.clone(), Vec::new());
        }
    }

    /// Returns true when the origin has a log (possibly empty).
    pub fn knows(&self, origin: &OriginId) -> bool {
        self.logs.contains_key(origin)
    }

    /// Returns the next sequence expected from the origin (1 if unknown).
    pub fn next_expected(&self, origin: &OriginId) -> u32 {
        self.logs
            .get(origin)
            .map(|log| log.len() as u32 + 1)
            .unwrap_or(1)
    }

    /// Appends a rumor if it carries exactly the next expected sequence.
    ///
    /// Registers the origin as a side effect. Returns true when the rumor
    /// was appended; out-of-order rumors leave the store untouched.
    pub fn accept(&mut self, rumor: &Rumor) -> bool {
        self.register(&rumor.origin);
        let log = self.logs.get_mut(&rumor.origin).expect("just registered");
        if rumor.seq != log.len() as u32 + 1 {
            return false;
        }
        log.push(rumor.clone());
        true
    }

    /// Fetches the archived rumor `(origin, seq)`, if held.
    pub fn get(&self, origin: &OriginId, seq: u32) -> Option<&Rumor> {
        if seq == 0 {
            return None;
        }
        self.logs.get(origin)?.get(seq as usize - 1)
    }

    /// Builds the full vector status: every origin mapped to `N + 1`.
    pub fn status(&self) -> StatusVector {
        self.logs
            .iter()
            .map(|(origin, log)| (origin.clone(), log.len() as u32 + 1))
            .collect()
    }

    /// Iterates over the known origins.
    pub fn origins(&self) -> impl Iterator<Item = &OriginId> {
        self.logs.keys()
    }
}
