//! The set of known peers.

use murmur_core::Peer;
use rand::rngs::StdRng;
use rand::Rng;

/// Every peer this node has ever learned, in learn order.
///
/// Peers are never removed. Random selection is uniform, drawn from the
/// node's single long-lived PRNG.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<Peer>,
}

impl PeerTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a peer; duplicates are ignored.
    pub fn learn(&mut self, peer: Peer) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All known peers, in learn order.
    pub fn all(&self) -> &[Peer] {
        &self.peers
    }

    /// Picks a uniformly random peer, optionally excluding one (so a rumor
    /// is never mongered straight back to its sender). Returns `None` when
    /// no eligible peer exists.
    pub fn pick_random_excluding(&self, exclude: Option<Peer>, rng: &mut StdRng) -> Option<Peer> {
        let eligible: Vec<Peer> = self
            .peers
            .iter()
            .copied()
            .filter(|p| Some(*p) != exclude)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        Some(eligible[rng.gen_range(0..eligible.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_learn_is_idempotent() {
        let mut table = PeerTable::new();
        assert!(table.learn(Peer::localhost(1000)));
        assert!(!table.learn(Peer::localhost(1000)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_pick_excludes() {
        let mut table = PeerTable::new();
        let only = Peer::localhost(1000);
        table.learn(only);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(table.pick_random_excluding(None, &mut rng), Some(only));
        assert_eq!(table.pick_random_excluding(Some(only), &mut rng), None);
    }

    #[test]
    fn test_pick_uniform_over_eligible() {
        let mut table = PeerTable::new();
        for port in 1000..1004 {
            table.learn(Peer::localhost(port));
        }
        let excluded = Peer::localhost(1000);

        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let pick = table
                .pick_random_excluding(Some(excluded), &mut rng)
                .unwrap();
            assert_ne!(pick, excluded);
            seen.insert(pick.port);
        }
        // All three eligible peers show up over 200 draws.
        assert_eq!(seen.len(), 3);
    }
}
