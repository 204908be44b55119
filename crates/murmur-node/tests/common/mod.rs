#![allow(dead_code)] // each test binary uses a different slice of the harness

//! In-memory test network: real nodes, deterministic delivery.
//!
//! Nodes are wired together by draining each outbox and feeding the
//! encoded datagrams straight into the addressee, one round at a time.
//! No sockets, no timers firing on their own - tests invoke deadlines
//! explicitly, so every scenario is reproducible.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

use murmur_core::Peer;
use murmur_node::{Event, Node, NodeConfig};

/// First port of the simulated range.
pub const BASE_PORT: u16 = 41000;

/// A handful of nodes delivering datagrams to each other in rounds.
pub struct TestNet {
    /// The nodes, indexable by position.
    pub nodes: Vec<Node>,
    /// Each node's working directory (downloads and DHT copies).
    pub dirs: Vec<TempDir>,
}

impl TestNet {
    /// Builds a full-mesh network of nodes with the given origin ids.
    pub fn new(origins: &[&str]) -> Self {
        Self::with_config(origins, |_| {})
    }

    /// Builds a network, letting the caller adjust each config.
    pub fn with_config(origins: &[&str], tweak: impl Fn(&mut NodeConfig)) -> Self {
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();

        for (i, origin) in origins.iter().enumerate() {
            let dir = TempDir::new().unwrap();
            let mut config =
                NodeConfig::new((*origin).into(), Peer::localhost(BASE_PORT + i as u16));
            config.download_dir = dir.path().to_path_buf();
            // Tests move multi-block files around; give the DHT real room
            // unless the caller overrides it.
            config.dht_size_limit_kb = 200;
            tweak(&mut config);

            let node = Node::new(config, StdRng::seed_from_u64(100 + i as u64), Instant::now());
            nodes.push(node);
            dirs.push(dir);
        }

        for i in 0..origins.len() {
            for j in 0..origins.len() {
                if i != j {
                    nodes[i].learn_peer(Peer::localhost(BASE_PORT + j as u16));
                }
            }
        }

        Self { nodes, dirs }
    }

    /// The peer address of node `i`.
    pub fn peer(&self, i: usize) -> Peer {
        Peer::localhost(BASE_PORT + i as u16)
    }

    fn index_of(&self, peer: Peer) -> Option<usize> {
        let i = peer.port.checked_sub(BASE_PORT)? as usize;
        (i < self.nodes.len()).then_some(i)
    }

    /// Delivers everything currently queued, one hop. Returns the number
    /// of datagrams moved.
    pub fn deliver_round(&mut self) -> usize {
        let mut queue = Vec::new();
        for i in 0..self.nodes.len() {
            let from = self.peer(i);
            for (to, packet) in self.nodes[i].take_outbox() {
                queue.push((from, to, packet.to_vec()));
            }
        }

        let moved = queue.len();
        for (from, to, bytes) in queue {
            if let Some(target) = self.index_of(to) {
                self.nodes[target].handle_datagram(&bytes, from, Instant::now());
            }
        }
        moved
    }

    /// Delivers rounds until the network goes quiet.
    pub fn pump(&mut self) {
        for _ in 0..500 {
            if self.deliver_round() == 0 {
                return;
            }
        }
        panic!("network did not quiesce within 500 rounds");
    }

    /// Announces every node's route and lets the gossip settle, so
    /// routing tables are populated before a scenario starts.
    pub fn settle_routes(&mut self) {
        for node in &mut self.nodes {
            node.broadcast_own_route();
        }
        self.pump();
        for node in &mut self.nodes {
            node.take_events();
        }
    }

    /// Drains node `i`'s notifications.
    pub fn events(&mut self, i: usize) -> Vec<Event> {
        self.nodes[i].take_events()
    }

    /// Writes a patterned test file into node `i`'s directory.
    pub fn write_file(&self, i: usize, name: &str, len: usize) -> PathBuf {
        let path = self.dirs[i].path().join(name);
        let data: Vec<u8> = (0..len).map(|b| (b % 251) as u8).collect();
        File::create(&path).unwrap().write_all(&data).unwrap();
        path
    }
}
