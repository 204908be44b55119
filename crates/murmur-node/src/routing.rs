//! Next-hop routing derived from rumor arrivals.
//!
//! Every accepted rumor (and fresh membership announcement) from origin O
//! that arrived over peer P sets `O -> P`; so does a one-behind rumor with
//! no last-hop annotation, which must have come straight from O itself.

use std::collections::BTreeMap;

use murmur_core::{OriginId, Peer};

/// The origin-to-next-hop map.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: BTreeMap<OriginId, Peer>,
}

impl RoutingTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Points an origin at a new next hop.
    ///
    /// Returns true when the origin was previously unknown, so the caller
    /// can announce the new contact to the user.
    pub fn update(&mut self, origin: &OriginId, next_hop: Peer) -> bool {
        self.routes.insert(origin.clone(), next_hop).is_none()
    }

    /// The peer to forward traffic for `origin` through.
    pub fn next_hop(&self, origin: &OriginId) -> Option<Peer> {
        self.routes.get(origin).copied()
    }

    /// Known destinations, for the UI's contact list.
    pub fn origins(&self) -> impl Iterator<Item = &OriginId> {
        self.routes.keys()
    }
}
