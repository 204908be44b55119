//! Murmur core - shared types, constants, and the wire codec.
//!
//! Everything in this crate is transport-agnostic and free of protocol
//! state. The other workspace crates build the gossip, storage, and DHT
//! machinery on top of:
//!
//! - [`encoding`]: the self-describing key-value datagram codec
//! - [`identifiers`]: origin ids and 20-byte content digests
//! - [`peer`]: the `(address, port)` peer value type

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod encoding;
pub mod identifiers;
pub mod peer;

pub use encoding::{DecodeError, FieldId, WireMap, WireValue};
pub use identifiers::{sha1_digest, OriginId, ShaDigest};
pub use peer::Peer;

/// Fixed chunk size for file blocks, in bytes.
pub const CHUNK_SIZE: usize = 8000;

/// Length of a SHA-1 digest, in bytes.
pub const DIGEST_LEN: usize = 20;

/// Initial hop limit for point-to-point messages.
pub const DEFAULT_HOP_LIMIT: u32 = 10;

/// Initial budget for a flood search.
pub const DEFAULT_BUDGET: u32 = 2;

/// Budget ceiling for the expanding-ring search.
pub const MAX_BUDGET: u32 = 128;

/// Unique result count at which an expanding search stops growing.
pub const SEARCH_RESULT_TARGET: usize = 10;

/// Default number of spots on the DHT ring (power of two).
pub const DEFAULT_RING_SPOTS: u32 = 32;

/// Default DHT storage budget in kilobytes.
pub const DEFAULT_DHT_SIZE_LIMIT_KB: u64 = 20;

/// Seconds a mongering send waits for a status before timing out.
pub const MONGER_TIMEOUT_SECS: u64 = 2;

/// Seconds between unconditional anti-entropy status exchanges.
pub const ANTI_ENTROPY_SECS: u64 = 10;

/// Seconds between periodic route-rumor broadcasts.
pub const ROUTE_RUMOR_SECS: u64 = 60;

/// Seconds before an unanswered block request is retransmitted.
pub const RETRANSMIT_SECS: u64 = 2;

/// Seconds between search budget expansions.
pub const SEARCH_EXPAND_SECS: u64 = 1;
