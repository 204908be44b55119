//! Murmur node - the gossip/DHT state machine and its UDP runtime.
//!
//! The heart of the crate is [`Node`]: a single-threaded state machine
//! that consumes datagrams, timer deadlines, and user commands, and emits
//! outbound packets plus user-facing events. It performs no I/O of its
//! own, which keeps every protocol path deterministic under test.
//!
//! [`runtime`] wires a `Node` to a real UDP socket inside one
//! `tokio::select!` loop; the GUI-replacement surface is the
//! [`Command`]/[`Event`] pair.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod event;
pub mod node;
pub mod peers;
pub mod routing;
pub mod runtime;
pub mod search;

pub use event::{Command, Event};
pub use node::{Node, NodeConfig};
pub use peers::PeerTable;
pub use routing::RoutingTable;
pub use runtime::{bind_socket, NodeHandle, NodeRuntime, RuntimeError};

use murmur_core::OriginId;
use thiserror::Error;

/// Errors surfaced to the user for rejected commands.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A download is already active; only one may run at a time.
    #[error("another download is already in progress")]
    DownloadInProgress,

    /// The routing table has no next hop for the target origin.
    #[error("no route to node {0}")]
    UnknownTargetNode(OriginId),

    /// The storage layer failed (sharing an unreadable file, for example).
    #[error(transparent)]
    Store(#[from] murmur_store::StoreError),
}
