//! Gossip scenarios: chat convergence, status reconciliation, and
//! last-hop routing.

mod common;

use std::time::Instant;

use common::TestNet;
use rand::rngs::StdRng;
use rand::SeedableRng;

use murmur_core::Peer;
use murmur_node::{Event, Node, NodeConfig};
use murmur_proto::{Packet, Rumor};

#[test]
fn two_node_chat_converges() {
    let mut net = TestNet::new(&["alice", "bob"]);

    net.nodes[0].send_chat("hi".into(), Instant::now());
    net.pump();

    // Bob displayed the message and his status asks for alice's next.
    let events = net.events(1);
    assert!(events.contains(&Event::ChatMessage {
        origin: "alice".into(),
        text: "hi".into(),
    }));
    assert_eq!(net.nodes[1].rumors().next_expected(&"alice".into()), 2);
}

#[test]
fn chat_floods_a_line_of_peers() {
    // alice -- bob -- carol as a full mesh; gossip plus reconciliation
    // must deliver to everyone.
    let mut net = TestNet::new(&["alice", "bob", "carol"]);

    net.nodes[0].send_chat("to everyone".into(), Instant::now());
    net.pump();

    for i in [1, 2] {
        assert_eq!(
            net.nodes[i].rumors().next_expected(&"alice".into()),
            2,
            "node {i} did not converge"
        );
    }
}

#[test]
fn anti_entropy_recovers_missed_rumors() {
    let mut net = TestNet::new(&["alice", "bob"]);

    // Alice originates two messages but the monger copies are lost (we
    // drop them instead of delivering).
    net.nodes[0].send_chat("one".into(), Instant::now());
    net.nodes[0].send_chat("two".into(), Instant::now());
    net.nodes[0].take_outbox();

    // An anti-entropy status from alice tells bob nothing is missing his
    // way, but bob's reply status pulls the two rumors across.
    let start = Instant::now();
    net.nodes[0].on_deadline(start + std::time::Duration::from_secs(10));
    net.pump();

    assert_eq!(net.nodes[1].rumors().next_expected(&"alice".into()), 3);
    let texts: Vec<String> = net
        .events(1)
        .into_iter()
        .filter_map(|e| match e {
            Event::ChatMessage { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
}

fn lone_node(origin: &str) -> Node {
    let config = NodeConfig::new(origin.into(), Peer::localhost(50000));
    Node::new(config, StdRng::seed_from_u64(9), Instant::now())
}

#[test]
fn accepted_rumor_sets_next_hop() {
    let mut node = lone_node("me");
    let p = Peer::localhost(50001);

    let rumor = Packet::Rumor(Rumor {
        origin: "x".into(),
        seq: 1,
        text: None,
        last_hop: Some(Peer::localhost(50009)),
    });
    node.handle_datagram(&rumor.to_vec(), p, Instant::now());

    assert_eq!(node.routing().next_hop(&"x".into()), Some(p));
    assert_eq!(node.rumors().next_expected(&"x".into()), 2);
    assert!(node.take_events().contains(&Event::NewOrigin("x".into())));
}

#[test]
fn one_behind_direct_rumor_updates_route_without_appending() {
    let mut node = lone_node("me");
    let p = Peer::localhost(50001);
    let q = Peer::localhost(50002);

    // Seq 1 over P: accepted, routing[x] = P.
    let over_p = Packet::Rumor(Rumor {
        origin: "x".into(),
        seq: 1,
        text: None,
        last_hop: Some(Peer::localhost(50009)),
    });
    node.handle_datagram(&over_p.to_vec(), p, Instant::now());
    assert_eq!(node.routing().next_hop(&"x".into()), Some(p));

    // The same sequence again, now one behind and with no last hop: it
    // must have come straight from x, so the route flips to Q even
    // though the rumor is not re-appended.
    let direct = Packet::Rumor(Rumor {
        origin: "x".into(),
        seq: 1,
        text: None,
        last_hop: None,
    });
    node.handle_datagram(&direct.to_vec(), q, Instant::now());

    assert_eq!(node.routing().next_hop(&"x".into()), Some(q));
    assert_eq!(node.rumors().next_expected(&"x".into()), 2);
}

#[test]
fn one_behind_forwarded_rumor_does_not_update_route() {
    let mut node = lone_node("me");
    let p = Peer::localhost(50001);
    let q = Peer::localhost(50002);

    let over_p = Packet::Rumor(Rumor {
        origin: "x".into(),
        seq: 1,
        text: None,
        last_hop: None,
    });
    node.handle_datagram(&over_p.to_vec(), p, Instant::now());

    // One behind but annotated with a last hop: a stale forwarded copy,
    // not a direct route.
    let forwarded = Packet::Rumor(Rumor {
        origin: "x".into(),
        seq: 1,
        text: None,
        last_hop: Some(Peer::localhost(50009)),
    });
    node.handle_datagram(&forwarded.to_vec(), q, Instant::now());

    assert_eq!(node.routing().next_hop(&"x".into()), Some(p));
}

#[test]
fn forwarded_rumor_carries_sender_as_last_hop() {
    let mut net = TestNet::new(&["alice", "bob", "carol"]);

    // Alice's chat reaches bob; bob's onward copy must name alice's
    // address as the prior hop.
    net.nodes[0].send_chat("trace me".into(), Instant::now());

    // Deliver only alice's monger (one round); whichever peer received
    // it queues an onward copy annotated with alice's address.
    net.deliver_round();
    let alice_peer = net.peer(0);
    let mut forwarded = Vec::new();
    for i in [1, 2] {
        for (_, packet) in net.nodes[i].take_outbox() {
            if let Packet::Rumor(r) = packet {
                if r.origin == "alice".into() {
                    forwarded.push(r);
                }
            }
        }
    }
    assert!(!forwarded.is_empty(), "nobody forwarded alice's rumor");
    for rumor in forwarded {
        assert_eq!(rumor.last_hop, Some(alice_peer));
    }
}
