//! Murmur DHT - the Chord-style ring overlay.
//!
//! Nodes hash onto a small ring (32 spots by default) and own the interval
//! between their predecessor and themselves. The pieces here are pure data
//! structures; the protocol driving them lives in `murmur-node`:
//!
//! - [`ring`]: the ring hash and forward-distance metric
//! - [`finger`]: the finger table, ownership rule, and join/leave edits
//! - [`status`]: the monotonic per-origin membership map

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod finger;
pub mod ring;
pub mod status;

pub use finger::{FingerEntry, FingerTable, FingerUpdate};
pub use ring::{forward_distance, ring_hash};
pub use status::{DhtStatusMap, MembershipState};
