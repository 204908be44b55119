//! Murmur protocol messages.
//!
//! Datagrams on the wire are self-describing key-value maps
//! ([`murmur_core::WireMap`]); their *kind* is implied by which fields are
//! present. This crate models the kinds as a tagged sum ([`Packet`]) with a
//! single discriminated decoder that applies the triage order receivers
//! must follow.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod packet;

pub use packet::{
    Direct, DirectPayload, Membership, Packet, PacketError, Rumor, SearchMatch, SearchRequest,
    StatusVector, TransferRequest,
};
