//! Serf-layer wire messages (spec.md §4.5). These ride inside opaque
//! `User`-tagged Memberlist broadcasts: [`crate::codec::MessageType::User`]
//! followed by a second type byte identifying which of these structs
//! follows, then its msgpack body.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Second-level tag distinguishing Serf payloads carried inside a
/// Memberlist `User` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SerfMessageType {
    Join = 0,
    Leave = 1,
    UserEvent = 2,
    Query = 3,
    QueryResponse = 4,
    Relay = 5,
}

impl SerfMessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        use SerfMessageType::*;
        Some(match b {
            0 => Join,
            1 => Leave,
            2 => UserEvent,
            3 => Query,
            4 => QueryResponse,
            5 => Relay,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageJoin {
    pub ltime: u64,
    pub node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLeave {
    pub ltime: u64,
    pub node: String,
    pub prune: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageUserEvent {
    pub ltime: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub cc: bool,
}

/// Bit 0 = ack requested, bit 1 = no-broadcast (this copy arrived via
/// relay and must not be re-gossiped), bit 2 = internal (`_serf_*`).
pub mod query_flags {
    pub const ACK_REQUESTED: u32 = 1 << 0;
    pub const NO_BROADCAST: u32 = 1 << 1;
    pub const INTERNAL: u32 = 1 << 2;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    pub ltime: u64,
    pub id: u64,
    pub addr: IpAddr,
    pub port: u16,
    pub filters: Vec<QueryFilter>,
    pub flags: u32,
    pub timeout_ms: u64,
    pub name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryFilter {
    Nodes(Vec<String>),
    Tag { key: String, pattern: String },
}

/// Bit 0 = ack (no payload); absent means this carries a `Response`.
pub mod response_flags {
    pub const ACK: u32 = 1 << 0;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQueryResponse {
    pub ltime: u64,
    pub id: u64,
    pub from: String,
    pub flags: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRelay {
    pub from: String,
    pub dest_addr: IpAddr,
    pub dest_port: u16,
    pub payload: Vec<u8>,
}
