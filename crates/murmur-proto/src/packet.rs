//! The tagged packet sum and its discriminated decoder.

use std::collections::BTreeMap;

use murmur_core::{DecodeError, FieldId, OriginId, Peer, ShaDigest, WireMap, WireValue};
use thiserror::Error;

/// Errors turning raw bytes into a [`Packet`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The bytes did not decode as a datagram map.
    #[error("malformed datagram: {0}")]
    Malformed(#[from] DecodeError),

    /// The datagram decoded but matched no known message shape.
    #[error("datagram matched no known message shape")]
    Unrecognized,
}

/// A chat or route announcement, identified by `(origin, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rumor {
    /// Originating node.
    pub origin: OriginId,
    /// Sequence number in the origin's own space, starting at 1.
    pub seq: u32,
    /// Chat payload; `None` makes this a route rumor.
    pub text: Option<String>,
    /// Prior-hop address, rewritten by each forwarder.
    pub last_hop: Option<Peer>,
}

impl Rumor {
    /// Returns true when this is a route rumor (no chat payload).
    pub fn is_route(&self) -> bool {
        self.text.is_none()
    }
}

/// Vector status: each known origin mapped to the first unseen sequence.
pub type StatusVector = BTreeMap<OriginId, u32>;

/// Payload of a point-to-point message; exactly one per datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectPayload {
    /// Private chat text.
    Chat(String),
    /// Request for the block (or metafile) with this hash.
    BlockRequest(ShaDigest),
    /// Reply carrying the requested bytes.
    BlockReply {
        /// Echo of the requested hash.
        hash: ShaDigest,
        /// Block contents or metafile bytes.
        data: Vec<u8>,
    },
    /// Answer to a search request.
    SearchReply {
        /// Echo of the query being answered.
        query: String,
        /// Matching filenames with their metafile hashes.
        matches: Vec<SearchMatch>,
    },
}

/// One filename/metafile pair in a search reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    /// Matching filename.
    pub name: String,
    /// Metafile hash to download the file by.
    pub metafile: ShaDigest,
}

/// A routed point-to-point message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Direct {
    /// Destination origin.
    pub dest: OriginId,
    /// Originating node.
    pub origin: OriginId,
    /// Remaining hops; decremented on each forward.
    pub hop_limit: u32,
    /// The single payload.
    pub payload: DirectPayload,
}

/// A budgeted search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Node that originated the search.
    pub origin: OriginId,
    /// Space-separated tokens, or an exact filename in DHT mode.
    pub query: String,
    /// Remaining fanout budget.
    pub budget: u32,
}

/// A DHT instruction to take custody of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Node currently holding the file's blocks.
    pub origin: OriginId,
    /// Logical (unprefixed) filename.
    pub file_name: String,
    /// Ring hash of the filename.
    pub file_hash: u32,
    /// Metafile hash to fetch the contents by.
    pub block_list_hash: ShaDigest,
    /// When set, the file is bound for this origin's redundancy archive.
    pub redundant: Option<OriginId>,
}

/// A DHT membership announcement (join or leave).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// Announcing node.
    pub origin: OriginId,
    /// Membership sequence number, monotonic per origin.
    pub seq: u32,
    /// True to join the DHT, false to leave it.
    pub wants_join: bool,
    /// Set on re-broadcast copies to stop further flooding.
    pub broadcast: bool,
    /// On leave: the successor standing in for the leaver.
    pub replacement: Option<OriginId>,
    /// On leave: the leaver's ring predecessor.
    pub one_behind: Option<OriginId>,
}

/// Every message shape a murmur node exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Gossip rumor (chat or route).
    Rumor(Rumor),
    /// Vector status for anti-entropy.
    Status(StatusVector),
    /// Routed point-to-point message.
    Direct(Direct),
    /// Budgeted flood search.
    Search(SearchRequest),
    /// DHT file-placement instruction.
    Transfer(TransferRequest),
    /// DHT join/leave announcement.
    Membership(Membership),
}

impl Packet {
    /// Decodes and classifies a datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let map = WireMap::decode(bytes)?;
        Self::classify(&map).ok_or(PacketError::Unrecognized)
    }

    /// Classifies a decoded map by field presence.
    ///
    /// The triage order is normative - first match wins:
    ///
    /// 1. transfer request (`FileName` + `FileHash` + `BlockListHash` +
    ///    `Origin`, no `Replacement`)
    /// 2. point-to-point (`Dest` + `Origin` + `HopLimit` + one payload)
    /// 3. search request (`Origin` + `Search` + `Budget`)
    /// 4. rumor or membership (`Origin` + `SeqNo`; `JoinDHT` discriminates)
    /// 5. status (`Want`)
    pub fn classify(map: &WireMap) -> Option<Self> {
        if map.contains(FieldId::FileName)
            && map.contains(FieldId::FileHash)
            && map.contains(FieldId::BlockListHash)
            && map.contains(FieldId::Origin)
            && !map.contains(FieldId::Replacement)
        {
            return classify_transfer(map);
        }

        if map.contains(FieldId::Dest)
            && map.contains(FieldId::Origin)
            && map.contains(FieldId::HopLimit)
        {
            if let Some(packet) = classify_direct(map) {
                return Some(packet);
            }
        }

        if map.contains(FieldId::Origin)
            && map.contains(FieldId::Search)
            && map.contains(FieldId::Budget)
        {
            return Some(Packet::Search(SearchRequest {
                origin: OriginId::new(map.str_of(FieldId::Origin)?),
                query: map.str_of(FieldId::Search)?.to_string(),
                budget: map.u32_of(FieldId::Budget)?,
            }));
        }

        if map.contains(FieldId::Origin) && map.contains(FieldId::SeqNo) {
            return classify_rumor_or_membership(map);
        }

        if let Some(want) = map.map_of(FieldId::Want) {
            let mut status = StatusVector::new();
            for (origin, value) in want {
                status.insert(OriginId::new(origin.clone()), u32::try_from(value.as_uint()?).ok()?);
            }
            return Some(Packet::Status(status));
        }

        None
    }

    /// Encodes the packet to its wire map.
    pub fn to_wire(&self) -> WireMap {
        let mut map = WireMap::new();
        match self {
            Packet::Rumor(rumor) => {
                map.put_str(FieldId::Origin, rumor.origin.as_str())
                    .put_uint(FieldId::SeqNo, rumor.seq as u64);
                if let Some(text) = &rumor.text {
                    map.put_str(FieldId::ChatText, text.clone());
                }
                if let Some(hop) = rumor.last_hop {
                    map.put_uint(FieldId::LastIp, hop.ip_u32() as u64)
                        .put_uint(FieldId::LastPort, hop.port as u64);
                }
            }
            Packet::Status(status) => {
                let mut want = BTreeMap::new();
                for (origin, next) in status {
                    want.insert(origin.as_str().to_string(), WireValue::Uint(*next as u64));
                }
                map.insert(FieldId::Want, WireValue::Map(want));
            }
            Packet::Direct(direct) => {
                map.put_str(FieldId::Dest, direct.dest.as_str())
                    .put_str(FieldId::Origin, direct.origin.as_str())
                    .put_uint(FieldId::HopLimit, direct.hop_limit as u64);
                match &direct.payload {
                    DirectPayload::Chat(text) => {
                        map.put_str(FieldId::ChatText, text.clone());
                    }
                    DirectPayload::BlockRequest(hash) => {
                        map.put_bytes(FieldId::BlockRequest, hash.as_slice());
                    }
                    DirectPayload::BlockReply { hash, data } => {
                        map.put_bytes(FieldId::BlockReply, hash.as_slice())
                            .put_bytes(FieldId::Data, data.clone());
                    }
                    DirectPayload::SearchReply { query, matches } => {
                        let names = matches
                            .iter()
                            .map(|m| WireValue::Str(m.name.clone()))
                            .collect();
                        let ids = matches
                            .iter()
                            .map(|m| WireValue::Bytes(m.metafile.as_slice().to_vec()))
                            .collect();
                        map.put_str(FieldId::SearchReply, query.clone())
                            .insert(FieldId::MatchNames, WireValue::List(names))
                            .insert(FieldId::MatchIds, WireValue::List(ids));
                    }
                }
            }
            Packet::Search(search) => {
                map.put_str(FieldId::Origin, search.origin.as_str())
                    .put_str(FieldId::Search, search.query.clone())
                    .put_uint(FieldId::Budget, search.budget as u64);
            }
            Packet::Transfer(transfer) => {
                map.put_str(FieldId::Origin, transfer.origin.as_str())
                    .put_str(FieldId::FileName, transfer.file_name.clone())
                    .put_uint(FieldId::FileHash, transfer.file_hash as u64)
                    .put_bytes(FieldId::BlockListHash, transfer.block_list_hash.as_slice());
                if let Some(redundant) = &transfer.redundant {
                    map.put_str(FieldId::Redundant, redundant.as_str());
                }
            }
            Packet::Membership(membership) => {
                map.put_str(FieldId::Origin, membership.origin.as_str())
                    .put_uint(FieldId::SeqNo, membership.seq as u64)
                    .put_bool(FieldId::JoinDht, membership.wants_join);
                if membership.broadcast {
                    map.put_bool(FieldId::Broadcast, true);
                }
                if let Some(replacement) = &membership.replacement {
                    map.put_str(FieldId::Replacement, replacement.as_str());
                }
                if let Some(one_behind) = &membership.one_behind {
                    map.put_str(FieldId::OneBehind, one_behind.as_str());
                }
            }
        }
        map
    }

    /// Encodes the packet to datagram bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.to_wire().to_vec()
    }
}

fn classify_transfer(map: &WireMap) -> Option<Packet> {
    Some(Packet::Transfer(TransferRequest {
        origin: OriginId::new(map.str_of(FieldId::Origin)?),
        file_name: map.str_of(FieldId::FileName)?.to_string(),
        file_hash: map.u32_of(FieldId::FileHash)?,
        block_list_hash: ShaDigest::from_slice(map.bytes_of(FieldId::BlockListHash)?)?,
        redundant: map.str_of(FieldId::Redundant).map(OriginId::new),
    }))
}

fn classify_direct(map: &WireMap) -> Option<Packet> {
    let payload = if let Some(text) = map.str_of(FieldId::ChatText) {
        DirectPayload::Chat(text.to_string())
    } else if let Some(hash) = map.bytes_of(FieldId::BlockRequest) {
        DirectPayload::BlockRequest(ShaDigest::from_slice(hash)?)
    } else if map.contains(FieldId::BlockReply) && map.contains(FieldId::Data) {
        DirectPayload::BlockReply {
            hash: ShaDigest::from_slice(map.bytes_of(FieldId::BlockReply)?)?,
            data: map.bytes_of(FieldId::Data)?.to_vec(),
        }
    } else if map.contains(FieldId::SearchReply) {
        let names = map.list_of(FieldId::MatchNames)?;
        let ids = map.list_of(FieldId::MatchIds)?;
        let matches = names
            .iter()
            .zip(ids.iter())
            .filter_map(|(name, id)| {
                Some(SearchMatch {
                    name: name.as_str()?.to_string(),
                    metafile: ShaDigest::from_slice(id.as_bytes()?)?,
                })
            })
            .collect();
        DirectPayload::SearchReply {
            query: map.str_of(FieldId::SearchReply)?.to_string(),
            matches,
        }
    } else {
        return None;
    };

    Some(Packet::Direct(Direct {
        dest: OriginId::new(map.str_of(FieldId::Dest)?),
        origin: OriginId::new(map.str_of(FieldId::Origin)?),
        hop_limit: map.u32_of(FieldId::HopLimit)?,
        payload,
    }))
}

fn classify_rumor_or_membership(map: &WireMap) -> Option<Packet> {
    let origin = OriginId::new(map.str_of(FieldId::Origin)?);
    let seq = map.u32_of(FieldId::SeqNo)?;

    if map.contains(FieldId::JoinDht) {
        return Some(Packet::Membership(Membership {
            origin,
            seq,
            wants_join: map.bool_of(FieldId::JoinDht)?,
            broadcast: map.bool_of(FieldId::Broadcast).unwrap_or(false),
            replacement: map.str_of(FieldId::Replacement).map(OriginId::new),
            one_behind: map.str_of(FieldId::OneBehind).map(OriginId::new),
        }));
    }

    let last_hop = match (map.u32_of(FieldId::LastIp), map.u16_of(FieldId::LastPort)) {
        (Some(ip), Some(port)) => Some(Peer::from_wire(ip, port)),
        _ => None,
    };

    Some(Packet::Rumor(Rumor {
        origin,
        seq,
        text: map.str_of(FieldId::ChatText).map(str::to_string),
        last_hop,
    }))
}
