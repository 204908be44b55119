//! Self-describing datagram codec.
//!
//! Every datagram on the wire is a map from compact field identifiers to
//! typed values. Values carry their own type tag so a decoder can skip
//! fields it does not recognize; unknown fields are ignored rather than
//! rejected. The message *kind* is never encoded explicitly - receivers
//! classify datagrams by which fields are present.
//!
//! # Encoding rules
//!
//! - **Integers**: little-endian
//! - **Datagram**: u32 entry count, then `field tag (u8) + value` entries
//! - **Value**: u8 type tag followed by the payload
//! - **Strings**: u32 byte length followed by UTF-8 bytes
//! - **Byte strings**: u32 length followed by raw bytes
//! - **Lists**: u32 count followed by nested values
//! - **Maps**: u32 count followed by `string key + value` pairs
//!
//! Fields are encoded in ascending tag order, so encode∘decode is the
//! identity for any map built from known fields.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors produced while decoding a datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes left in the buffer.
    #[error("insufficient bytes: expected {expected}, got {available}")]
    InsufficientBytes {
        /// Bytes the decoder needed.
        expected: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// A value carried a type tag this codec does not define.
    #[error("unknown value type tag: {0}")]
    UnknownValueTag(u8),

    /// The same field appeared twice in one datagram.
    #[error("duplicate field tag: {0}")]
    DuplicateField(u8),
}

/// Wire identifiers for every field a murmur datagram may carry.
///
/// The numeric tags are the wire representation; the names follow the
/// protocol's traditional field vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FieldId {
    /// Originating node id.
    Origin = 0,
    /// Per-origin sequence number, starting at 1.
    SeqNo = 1,
    /// Chat payload; presence distinguishes a chat rumor from a route rumor.
    ChatText = 2,
    /// Vector status: origin -> next-expected sequence.
    Want = 3,
    /// Point-to-point destination origin.
    Dest = 4,
    /// Remaining hops; decremented on forward.
    HopLimit = 5,
    /// Prior-hop IPv4 address, rewritten on each forward.
    LastIp = 6,
    /// Prior-hop UDP port, rewritten on each forward.
    LastPort = 7,
    /// SHA-1 of a requested block or metafile.
    BlockRequest = 8,
    /// Echo of the requested hash.
    BlockReply = 9,
    /// Block contents or metafile bytes.
    Data = 10,
    /// Search query.
    Search = 11,
    /// Search fanout budget.
    Budget = 12,
    /// Echo of the query a reply answers.
    SearchReply = 13,
    /// Filenames matching a query.
    MatchNames = 14,
    /// Metafile hashes corresponding to `MatchNames`.
    MatchIds = 15,
    /// DHT membership announcement payload.
    JoinDht = 16,
    /// Transferred file's logical name.
    FileName = 17,
    /// Ring hash of the transferred file's name.
    FileHash = 18,
    /// Metafile hash of the transferred file.
    BlockListHash = 19,
    /// Successor standing in for a leaving node.
    Replacement = 20,
    /// Ring predecessor handed off by a leaving node.
    OneBehind = 21,
    /// Destination origin for a redundant copy.
    Redundant = 22,
    /// Marker preventing re-broadcast amplification.
    Broadcast = 23,
}

impl FieldId {
    /// Returns the wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Maps a wire tag back to a field, or `None` for tags this version
    /// does not know (the entry is then skipped).
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => FieldId::Origin,
            1 => FieldId::SeqNo,
            2 => FieldId::ChatText,
            3 => FieldId::Want,
            4 => FieldId::Dest,
            5 => FieldId::HopLimit,
            6 => FieldId::LastIp,
            7 => FieldId::LastPort,
            8 => FieldId::BlockRequest,
            9 => FieldId::BlockReply,
            10 => FieldId::Data,
            11 => FieldId::Search,
            12 => FieldId::Budget,
            13 => FieldId::SearchReply,
            14 => FieldId::MatchNames,
            15 => FieldId::MatchIds,
            16 => FieldId::JoinDht,
            17 => FieldId::FileName,
            18 => FieldId::FileHash,
            19 => FieldId::BlockListHash,
            20 => FieldId::Replacement,
            21 => FieldId::OneBehind,
            22 => FieldId::Redundant,
            23 => FieldId::Broadcast,
            _ => return None,
        })
    }
}

// Value type tags.
const TAG_STR: u8 = 0;
const TAG_UINT: u8 = 1;
const TAG_BYTES: u8 = 2;
const TAG_LIST: u8 = 3;
const TAG_MAP: u8 = 4;

/// A typed value in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    /// UTF-8 string.
    Str(String),
    /// Unsigned integer (u16/u32 fields widen to this on the wire).
    Uint(u64),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<WireValue>),
    /// String-keyed map of values.
    Map(BTreeMap<String, WireValue>),
}

impl WireValue {
    /// Borrows the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, if this is an unsigned integer.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            WireValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrows the byte payload, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrows the list payload, if this is a list.
    pub fn as_list(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrows the map payload, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, WireValue>> {
        match self {
            WireValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            WireValue::Str(s) => {
                buf.put_u8(TAG_STR);
                put_str(buf, s);
            }
            WireValue::Uint(v) => {
                buf.put_u8(TAG_UINT);
                buf.put_u64_le(*v);
            }
            WireValue::Bytes(b) => {
                buf.put_u8(TAG_BYTES);
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
            WireValue::List(items) => {
                buf.put_u8(TAG_LIST);
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
            WireValue::Map(entries) => {
                buf.put_u8(TAG_MAP);
                buf.put_u32_le(entries.len() as u32);
                for (key, value) in entries {
                    put_str(buf, key);
                    value.encode(buf);
                }
            }
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let tag = take_u8(buf)?;
        match tag {
            TAG_STR => Ok(WireValue::Str(take_str(buf)?)),
            TAG_UINT => Ok(WireValue::Uint(take_u64(buf)?)),
            TAG_BYTES => {
                let len = take_u32(buf)? as usize;
                need(buf, len)?;
                Ok(WireValue::Bytes(buf.copy_to_bytes(len).to_vec()))
            }
            TAG_LIST => {
                let count = take_u32(buf)? as usize;
                // Every value occupies at least one byte, so a count beyond
                // the remaining buffer can never decode.
                need(buf, count)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(WireValue::decode(buf)?);
                }
                Ok(WireValue::List(items))
            }
            TAG_MAP => {
                let count = take_u32(buf)? as usize;
                need(buf, count)?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = take_str(buf)?;
                    let value = WireValue::decode(buf)?;
                    entries.insert(key, value);
                }
                Ok(WireValue::Map(entries))
            }
            other => Err(DecodeError::UnknownValueTag(other)),
        }
    }
}

/// A decoded datagram: known fields mapped to their values.
///
/// Field tags the decoder does not recognize are dropped silently, per the
/// forward-compatibility rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMap {
    entries: BTreeMap<u8, WireValue>,
}

impl WireMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the field is present.
    pub fn contains(&self, field: FieldId) -> bool {
        self.entries.contains_key(&field.tag())
    }

    /// Inserts a value, replacing any previous value for the field.
    pub fn insert(&mut self, field: FieldId, value: WireValue) -> &mut Self {
        self.entries.insert(field.tag(), value);
        self
    }

    /// Inserts a string field.
    pub fn put_str(&mut self, field: FieldId, value: impl Into<String>) -> &mut Self {
        self.insert(field, WireValue::Str(value.into()))
    }

    /// Inserts an unsigned integer field.
    pub fn put_uint(&mut self, field: FieldId, value: u64) -> &mut Self {
        self.insert(field, WireValue::Uint(value))
    }

    /// Inserts a boolean field (encoded as 0/1).
    pub fn put_bool(&mut self, field: FieldId, value: bool) -> &mut Self {
        self.insert(field, WireValue::Uint(value as u64))
    }

    /// Inserts a byte-string field.
    pub fn put_bytes(&mut self, field: FieldId, value: impl Into<Vec<u8>>) -> &mut Self {
        self.insert(field, WireValue::Bytes(value.into()))
    }

    /// Removes a field, returning its value if present.
    pub fn remove(&mut self, field: FieldId) -> Option<WireValue> {
        self.entries.remove(&field.tag())
    }

    /// Borrows a field's value.
    pub fn get(&self, field: FieldId) -> Option<&WireValue> {
        self.entries.get(&field.tag())
    }

    /// Borrows a string field.
    pub fn str_of(&self, field: FieldId) -> Option<&str> {
        self.get(field).and_then(WireValue::as_str)
    }

    /// Returns an unsigned field widened to u64.
    pub fn uint_of(&self, field: FieldId) -> Option<u64> {
        self.get(field).and_then(WireValue::as_uint)
    }

    /// Returns an unsigned field narrowed to u32, if it fits.
    pub fn u32_of(&self, field: FieldId) -> Option<u32> {
        self.uint_of(field).and_then(|v| u32::try_from(v).ok())
    }

    /// Returns an unsigned field narrowed to u16, if it fits.
    pub fn u16_of(&self, field: FieldId) -> Option<u16> {
        self.uint_of(field).and_then(|v| u16::try_from(v).ok())
    }

    /// Returns a boolean field (any nonzero integer reads as true).
    pub fn bool_of(&self, field: FieldId) -> Option<bool> {
        self.uint_of(field).map(|v| v != 0)
    }

    /// Borrows a byte-string field.
    pub fn bytes_of(&self, field: FieldId) -> Option<&[u8]> {
        self.get(field).and_then(WireValue::as_bytes)
    }

    /// Borrows a list field.
    pub fn list_of(&self, field: FieldId) -> Option<&[WireValue]> {
        self.get(field).and_then(WireValue::as_list)
    }

    /// Borrows a map field.
    pub fn map_of(&self, field: FieldId) -> Option<&BTreeMap<String, WireValue>> {
        self.get(field).and_then(WireValue::as_map)
    }

    /// Encodes the map to its canonical byte representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.entries.len() as u32);
        for (tag, value) in &self.entries {
            buf.put_u8(*tag);
            value.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Encodes the map to an owned byte vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.encode().to_vec()
    }

    /// Decodes a datagram.
    ///
    /// Unknown field tags are skipped. A field appearing twice fails with
    /// [`DecodeError::DuplicateField`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let count = take_u32(&mut buf)? as usize;
        need(&mut buf, count)?;

        let mut map = WireMap::new();
        for _ in 0..count {
            let tag = take_u8(&mut buf)?;
            let value = WireValue::decode(&mut buf)?;
            if FieldId::from_tag(tag).is_some() {
                if map.entries.insert(tag, value).is_some() {
                    return Err(DecodeError::DuplicateField(tag));
                }
            }
        }
        Ok(map)
    }
}

// ============================================================================
// Buffer helpers
// ============================================================================

fn need(buf: &Bytes, len: usize) -> Result<(), DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::InsufficientBytes {
            expected: len,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_u64(buf: &mut Bytes) -> Result<u64, DecodeError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn take_str(buf: &mut Bytes) -> Result<String, DecodeError> {
    let len = take_u32(buf)? as usize;
    need(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}
