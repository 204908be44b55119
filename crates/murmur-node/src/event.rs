//! The command/event seam between the core and its user interface.
//!
//! The UI collaborator holds a handle into the core and reads an event
//! stream back; the core never calls into the UI.

use std::path::PathBuf;

use murmur_core::{OriginId, Peer, ShaDigest};

/// User-originated actions.
#[derive(Debug, Clone)]
pub enum Command {
    /// Gossip a chat message to the network.
    SendChat(String),
    /// Send a private message to one origin.
    SendPrivate {
        /// Destination origin.
        dest: OriginId,
        /// Message text.
        text: String,
    },
    /// Add a peer by `host:port` string (hostnames resolve asynchronously).
    AddPeer(String),
    /// Add an already-resolved peer.
    LearnPeer(Peer),
    /// Chunk and share a file from disk.
    ShareFile(PathBuf),
    /// Download a file by metafile hash from a target origin.
    Download {
        /// Origin to request blocks from.
        target: OriginId,
        /// Metafile hash of the wanted file.
        metafile: ShaDigest,
        /// Filename to store the result under (prefixed `download_`).
        file_name: String,
    },
    /// Start an expanding-ring search.
    Search(String),
    /// Enable or disable DHT participation.
    SetDhtParticipation(bool),
    /// Stop the runtime.
    Shutdown,
}

/// Notifications surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A gossiped chat message arrived.
    ChatMessage {
        /// Who said it.
        origin: OriginId,
        /// What they said.
        text: String,
    },
    /// A private message arrived for this node.
    PrivateMessage {
        /// Who sent it.
        origin: OriginId,
        /// What they sent.
        text: String,
    },
    /// A previously unseen origin appeared in the routing table.
    NewOrigin(OriginId),
    /// A search reply contributed a fresh filename.
    SearchResult {
        /// Matching filename.
        file_name: String,
        /// Metafile hash to download it by.
        metafile: ShaDigest,
        /// Origin holding the file.
        holder: OriginId,
    },
    /// The active search stopped (result target or budget cap reached).
    SearchFinished {
        /// Unique results collected.
        results: usize,
    },
    /// A user download finished and the file is on disk.
    DownloadComplete {
        /// Where the file landed.
        path: PathBuf,
    },
    /// A user command was rejected.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
    /// This node is now a DHT member.
    JoinedDht,
    /// This node has left the DHT.
    LeftDht,
}
