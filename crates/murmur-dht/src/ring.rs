//! Ring hashing and distance.

use murmur_core::{sha1_digest, OriginId};

/// Hashes an origin id onto the ring.
///
/// The hash is the first 32 bits of SHA-1 over the id's UTF-8 bytes, read
/// big-endian, reduced mod `n_spots`.
pub fn ring_hash(id: &OriginId, n_spots: u32) -> u32 {
    let digest = sha1_digest(id.as_str().as_bytes());
    let first = u32::from_be_bytes(digest.as_bytes()[..4].try_into().expect("four bytes"));
    first % n_spots
}

/// Hashes a filename onto the ring, for placement decisions.
pub fn ring_hash_name(name: &str, n_spots: u32) -> u32 {
    ring_hash(&OriginId::new(name), n_spots)
}

/// Forward (clockwise) distance from `from` to `to` on a ring of
/// `n_spots` positions: `(to - from) mod n`.
pub fn forward_distance(from: u32, to: u32, n_spots: u32) -> u32 {
    (to + n_spots - from) % n_spots
}
