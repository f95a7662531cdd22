//! Serf-level member map (spec.md §3 "MemberInfo"). Distinct from
//! [`crate::memberlist::NodeState`]: this is the view Serf exposes to
//! users (tags, Leaving as a first-class status), reconciled from
//! Memberlist delegate callbacks rather than owned by the SWIM core.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    None,
    Alive,
    Leaving,
    Left,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
    pub status_ltime: u64,
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,
    pub wall_time: Instant,
}

impl MemberInfo {
    pub fn new(name: String, addr: IpAddr, port: u16) -> Self {
        Self {
            name,
            addr,
            port,
            tags: HashMap::new(),
            status: MemberStatus::None,
            status_ltime: 0,
            protocol_min: 0,
            protocol_max: 0,
            protocol_cur: 0,
            delegate_min: 0,
            delegate_max: 0,
            delegate_cur: 0,
            wall_time: Instant::now(),
        }
    }

    /// spec.md §3: "the pair (Incarnation, StatusLTime) is monotonically
    /// non-decreasing". Serf doesn't track Incarnation directly (that's
    /// Memberlist's job) so this compares StatusLTime alone, which is
    /// sufficient for status/tag updates driven by Serf messages.
    pub fn is_newer(&self, ltime: u64) -> bool {
        ltime >= self.status_ltime
    }

    pub fn set_status(&mut self, status: MemberStatus, ltime: u64) {
        self.status = status;
        self.status_ltime = ltime;
        self.wall_time = Instant::now();
    }
}

/// A snapshot-friendly view of a member, detached from the live map so it
/// can be handed to dispatcher events and RPC responses without holding
/// the state lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSnapshot {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub status: MemberStatus,
}

impl From<&MemberInfo> for MemberSnapshot {
    fn from(m: &MemberInfo) -> Self {
        Self {
            name: m.name.clone(),
            addr: m.addr,
            port: m.port,
            tags: m.tags.clone(),
            status: m.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn newer_ltime_is_accepted() {
        let mut m = MemberInfo::new("a".into(), IpAddr::V4(Ipv4Addr::LOCALHOST), 7946);
        m.set_status(MemberStatus::Alive, 5);
        assert!(m.is_newer(5));
        assert!(m.is_newer(6));
        assert!(!m.is_newer(4));
    }
}
