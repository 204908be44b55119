//! Identifier types: origin ids and 20-byte content digests.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::DIGEST_LEN;

/// Computes the SHA-1 digest of the input.
pub fn sha1_digest(data: &[u8]) -> ShaDigest {
    let mut hasher = Sha1::new();
    hasher.update(data);
    ShaDigest(hasher.finalize().into())
}

/// Opaque identifier of a node.
///
/// Uniqueness is assumed globally; nodes avoid collisions by construction
/// (a pseudo-random suffix is appended at startup).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OriginId(pub String);

impl OriginId {
    /// Wraps an id string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrows the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OriginId({})", self.0)
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OriginId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OriginId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A 20-byte SHA-1 digest.
///
/// Addresses both data blocks and metafiles in the chunk protocol.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ShaDigest(pub [u8; DIGEST_LEN]);

impl ShaDigest {
    /// Creates a digest from raw bytes.
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Returns the digest as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Parses a digest from 20 raw bytes, if the length matches.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parses a digest from its 40-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Returns the digest as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ShaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaDigest({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ShaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; DIGEST_LEN]> for ShaDigest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ShaDigest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
