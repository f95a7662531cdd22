//! SWIM wire messages. Field names match spec.md §4.4/§6; the actual wire
//! encoding is produced by [`crate::codec::encode_message`] with the
//! matching [`crate::codec::MessageType`] tag.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub seq_no: u32,
    pub node: String,
    /// Set when this ping is relayed on behalf of an indirect prober, so
    /// the ack can be routed back without a second round trip.
    pub source_node: Option<String>,
    pub source_addr: Option<IpAddr>,
    pub source_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectPing {
    pub seq_no: u32,
    pub target: String,
    pub target_addr: IpAddr,
    pub target_port: u16,
    pub node: String,
    /// Whether the relay should also ask for a nack on failure.
    pub nack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResp {
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NackResp {
    pub seq_no: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u64,
    pub node: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub vsn: [u8; 6], // protocol_min/max/cur, delegate_min/max/cur
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPullHeader {
    pub nodes: u32,
    pub user_state_len: u32,
    pub join: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: super::state::NodeLifecycle,
    pub vsn: [u8; 6],
}
