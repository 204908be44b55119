//! Expanding-ring search state and budget arithmetic.

use std::collections::BTreeMap;

use murmur_core::{OriginId, Peer, ShaDigest};

/// Where a search hit can be downloaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFile {
    /// Metafile hash of the remote file.
    pub metafile: ShaDigest,
    /// Origin holding the file.
    pub holder: OriginId,
}

/// The search currently awaiting replies, at most one.
#[derive(Debug)]
pub struct ActiveSearch {
    /// The query text as entered.
    pub query: String,
    /// Budget used for the most recent send.
    pub budget: u32,
    /// Unique results so far, first reply per filename wins.
    pub results: BTreeMap<String, FoundFile>,
}

impl ActiveSearch {
    /// Starts a search at the given initial budget.
    pub fn new(query: impl Into<String>, budget: u32) -> Self {
        Self {
            query: query.into(),
            budget,
            results: BTreeMap::new(),
        }
    }

    /// Records a result; returns false for duplicate filenames.
    pub fn record(&mut self, name: &str, found: FoundFile) -> bool {
        if self.results.contains_key(name) {
            return false;
        }
        self.results.insert(name.to_string(), found);
        true
    }
}

/// Splits a budget over peers: `budget mod n` peers get the ceiling share,
/// the rest the floor share, and peers whose share would be zero get
/// nothing at all.
pub fn split_budget(budget: u32, peers: &[Peer]) -> Vec<(Peer, u32)> {
    let n = peers.len() as u32;
    if n == 0 || budget == 0 {
        return Vec::new();
    }
    let ceil_count = budget % n;
    let floor_share = budget / n;

    peers
        .iter()
        .enumerate()
        .filter_map(|(i, peer)| {
            let share = if (i as u32) < ceil_count {
                floor_share + 1
            } else {
                floor_share
            };
            (share > 0).then_some((*peer, share))
        })
        .collect()
}
