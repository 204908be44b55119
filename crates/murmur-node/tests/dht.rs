//! DHT overlay scenarios: join, file placement with redundancy, graceful
//! leave, and the storage budget.
//!
//! Origin ids and filenames are mined so their ring hashes land on exact
//! spots, letting the tests build the 3-node ring {4, 12, 25} on N = 32.

mod common;

use std::time::Instant;

use common::TestNet;

use murmur_core::OriginId;
use murmur_dht::ring::{ring_hash, ring_hash_name};
use murmur_node::{Command, Event};
use murmur_store::ArchiveKind;

const N: u32 = 32;

/// Finds an origin id string hashing to the requested ring spot.
fn origin_at(spot: u32) -> String {
    (0..200_000u32)
        .map(|i| format!("peer{i}"))
        .find(|s| ring_hash(&OriginId::new(s.clone()), N) == spot)
        .unwrap_or_else(|| panic!("no origin found for spot {spot}"))
}

/// Finds a filename hashing to the requested ring spot.
fn file_name_at(spot: u32) -> String {
    (0..200_000u32)
        .map(|i| format!("file{i}.bin"))
        .find(|s| ring_hash_name(s, N) == spot)
        .unwrap_or_else(|| panic!("no filename found for spot {spot}"))
}

/// Builds the {4, 12, 25} ring with routing settled and all three nodes
/// joined to the DHT.
fn joined_ring() -> (TestNet, [String; 3]) {
    let a = origin_at(4);
    let b = origin_at(12);
    let c = origin_at(25);
    let mut net = TestNet::new(&[&a, &b, &c]);
    net.settle_routes();

    for i in 0..3 {
        net.nodes[i].handle_command(Command::SetDhtParticipation(true), Instant::now());
        net.pump();
    }
    for i in 0..3 {
        assert!(net.nodes[i].joined_dht(), "node {i} failed to join");
        net.events(i);
    }
    (net, [a, b, c])
}

#[test]
fn join_builds_the_expected_ring() {
    let (net, [a, b, c]) = joined_ring();

    // Node 12 sees 4 behind it and 25 ahead of it, and owns (4, 12].
    let fingers = net.nodes[1].fingers().unwrap();
    assert_eq!(fingers.one_behind(), &OriginId::new(a.clone()));
    assert_eq!(fingers.successor(), &OriginId::new(c.clone()));
    assert!(fingers.owns(10));
    assert!(fingers.owns(12));
    assert!(!fingers.owns(25));

    // Node 4's interval wraps around zero.
    let fingers = net.nodes[0].fingers().unwrap();
    assert_eq!(fingers.one_behind(), &OriginId::new(c));
    assert!(fingers.owns(30));
    assert!(fingers.owns(0));
    assert!(!fingers.owns(10));

    // Nobody's finger table still names itself everywhere.
    let fingers = net.nodes[2].fingers().unwrap();
    assert_eq!(fingers.one_behind(), &OriginId::new(b));
}

#[test]
fn second_joiner_triggers_membership_on_first() {
    let a = origin_at(4);
    let b = origin_at(12);
    let mut net = TestNet::new(&[&a, &b]);
    net.settle_routes();

    // Alone, wanting to join is not being joined.
    net.nodes[0].handle_command(Command::SetDhtParticipation(true), Instant::now());
    net.pump();
    assert!(!net.nodes[0].joined_dht());

    // The second joiner completes the ring for both.
    net.nodes[1].handle_command(Command::SetDhtParticipation(true), Instant::now());
    net.pump();

    assert!(net.nodes[0].joined_dht());
    assert!(net.nodes[1].joined_dht());
    assert!(net.events(0).contains(&Event::JoinedDht));
    assert!(net.events(1).contains(&Event::JoinedDht));
}

#[test]
fn shared_file_lands_on_its_owner_with_redundancy() {
    let (mut net, [_a, _b, _c]) = joined_ring();

    // A file hashing to spot 10 belongs to node 12; node 25 shares it.
    let name = file_name_at(10);
    let path = net.write_file(2, &name, 16_500);
    net.nodes[2].share_file(&path).unwrap();
    net.pump();

    // Primary on node 12, on disk under the dht_ prefix.
    assert!(net.nodes[1].archive().contains(ArchiveKind::DhtPrimary, &name));
    assert!(net.dirs[1].path().join(format!("dht_{name}")).exists());

    // Redundant copy on node 12's predecessor, node 4.
    assert!(net.nodes[0].archive().contains(ArchiveKind::DhtRedundant, &name));
    assert!(net.dirs[0].path().join(format!("red_{name}")).exists());

    // The owner invariant: the file's hash lies in (one_behind, self].
    let fingers = net.nodes[1].fingers().unwrap();
    let k = ring_hash_name(&name, N);
    assert!(fingers.owns(k));

    // The sharer keeps only its local copy.
    assert!(net.nodes[2].archive().contains(ArchiveKind::Local, &name));
    assert!(!net.nodes[2].archive().contains(ArchiveKind::DhtPrimary, &name));
}

#[test]
fn owner_keeps_its_own_share_and_pushes_redundancy() {
    let (mut net, [_a, _b, _c]) = joined_ring();

    // Node 12 shares a file it owns itself: hash 10 is in (4, 12].
    let name = file_name_at(10);
    let path = net.write_file(1, &name, 9_000);
    net.nodes[1].share_file(&path).unwrap();
    net.pump();

    assert!(net.nodes[1].archive().contains(ArchiveKind::DhtPrimary, &name));
    assert!(net.nodes[0].archive().contains(ArchiveKind::DhtRedundant, &name));
}

#[test]
fn graceful_leave_hands_primaries_to_the_successor() {
    let (mut net, [a, b, _c]) = joined_ring();

    // Seed the ring as in the placement scenario.
    let name = file_name_at(10);
    let path = net.write_file(2, &name, 16_500);
    net.nodes[2].share_file(&path).unwrap();
    net.pump();
    assert!(net.nodes[1].archive().contains(ArchiveKind::DhtPrimary, &name));
    for i in 0..3 {
        net.events(i);
    }

    // Node 12 leaves.
    net.nodes[1].handle_command(Command::SetDhtParticipation(false), Instant::now());
    net.pump();

    assert!(!net.nodes[1].joined_dht());
    assert!(net.events(1).contains(&Event::LeftDht));

    // The successor (25) took custody of the file and now owns spot 10.
    assert!(net.nodes[2].archive().contains(ArchiveKind::DhtPrimary, &name));
    let fingers = net.nodes[2].fingers().unwrap();
    assert_eq!(fingers.one_behind(), &OriginId::new(a.clone()));
    assert!(fingers.owns(10));

    // 12 is gone from 25's finger table.
    assert!(fingers
        .entries()
        .iter()
        .all(|entry| entry.origin != OriginId::new(b.clone())));

    // And 25's (now larger) primary set is re-replicated on 4.
    assert!(net.nodes[0].archive().contains(ArchiveKind::DhtRedundant, &name));
}

#[test]
fn storage_budget_evicts_least_recent_file() {
    let a = origin_at(4);
    let b = origin_at(12);
    let mut net = TestNet::with_config(&[&a, &b], |config| {
        // Room for one 3-block file (32 KB) but not two.
        config.dht_size_limit_kb = 40;
    });
    net.settle_routes();
    for i in 0..2 {
        net.nodes[i].handle_command(Command::SetDhtParticipation(true), Instant::now());
        net.pump();
    }

    let first = file_name_at(6);
    let second = file_name_at(8);

    let path = net.write_file(1, &first, 16_500);
    net.nodes[1].share_file(&path).unwrap();
    net.pump();
    assert!(net.nodes[1].archive().contains(ArchiveKind::DhtPrimary, &first));

    let path = net.write_file(1, &second, 16_500);
    net.nodes[1].share_file(&path).unwrap();
    net.pump();

    // The older file was evicted from the archive and from disk.
    assert!(net.nodes[1].archive().contains(ArchiveKind::DhtPrimary, &second));
    assert!(!net.nodes[1].archive().contains(ArchiveKind::DhtPrimary, &first));
    assert!(!net.dirs[1].path().join(format!("dht_{first}")).exists());
    assert!(net.nodes[1].archive().dht_usage_kb() <= 40);
}

#[test]
fn oversized_file_is_rejected_without_eviction() {
    let a = origin_at(4);
    let b = origin_at(12);
    let mut net = TestNet::with_config(&[&a, &b], |config| {
        // Too small for any multi-block file.
        config.dht_size_limit_kb = 20;
    });
    net.settle_routes();
    for i in 0..2 {
        net.nodes[i].handle_command(Command::SetDhtParticipation(true), Instant::now());
        net.pump();
    }

    // Node 4 shares a file owned by node 12; 12 starts the fetch, learns
    // the size from the metafile, and abandons it.
    let name = file_name_at(6);
    let path = net.write_file(0, &name, 16_500);
    net.nodes[0].share_file(&path).unwrap();
    net.pump();

    assert!(!net.nodes[1].downloading());
    assert!(!net.nodes[1].archive().contains(ArchiveKind::DhtPrimary, &name));
    assert_eq!(net.nodes[1].archive().dht_usage_kb(), 0);
}

#[test]
fn dht_search_answers_from_the_owning_node() {
    let (mut net, [_a, _b, _c]) = joined_ring();

    let name = file_name_at(10);
    let path = net.write_file(2, &name, 9_000);
    let metafile = net.nodes[2].share_file(&path).unwrap();
    net.pump();
    for i in 0..3 {
        net.events(i);
    }

    // Node 4 does not own spot 10; its exact-name search routes to node
    // 12, which answers from its primary archive.
    net.nodes[0].start_search(name.clone(), Instant::now());
    net.pump();

    let events = net.events(0);
    assert!(
        events.iter().any(|e| matches!(
            e,
            Event::SearchResult { file_name, metafile: m, .. }
                if *file_name == name && *m == metafile
        )),
        "owner did not answer the DHT search"
    );
}
