//! Per-peer state as tracked by the SWIM core (distinct from the
//! Serf-level `MemberInfo` in [`crate::serf`], which mirrors this via
//! delegate callbacks).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Instant;

/// SWIM node lifecycle state. `StateLeft` specifically means the node
/// itself announced departure (a `Dead` message where `from == node`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLifecycle {
    StateAlive,
    StateSuspect,
    StateDead,
    StateLeft,
}

/// Ranks states for same-incarnation conflict resolution: Alive beats
/// Suspect beats Dead, i.e. reviving a node requires a strictly higher
/// incarnation, never just a "nicer" state at the same incarnation.
fn state_rank(s: NodeLifecycle) -> u8 {
    match s {
        NodeLifecycle::StateAlive => 2,
        NodeLifecycle::StateSuspect => 1,
        NodeLifecycle::StateDead | NodeLifecycle::StateLeft => 0,
    }
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: NodeLifecycle,
    pub state_change: Instant,
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,
}

impl NodeState {
    pub fn new(name: String, addr: IpAddr, port: u16) -> Self {
        Self {
            name,
            addr,
            port,
            meta: Vec::new(),
            incarnation: 0,
            state: NodeLifecycle::StateAlive,
            state_change: Instant::now(),
            protocol_min: 0,
            protocol_max: 0,
            protocol_cur: 0,
            delegate_min: 0,
            delegate_max: 0,
            delegate_cur: 0,
        }
    }

    /// True if `(incarnation, state)` represents a strictly newer fact
    /// than this node's current view, per the ordering rule in spec.md
    /// §4.4: higher incarnation always wins; same incarnation, higher
    /// state rank wins (Alive > Suspect > Dead/Left).
    pub fn is_newer(&self, incarnation: u64, state: NodeLifecycle) -> bool {
        if incarnation != self.incarnation {
            return incarnation > self.incarnation;
        }
        // A same-incarnation Dead/Left -> Alive transition is never newer:
        // reviving a node requires refutation (a strictly higher
        // incarnation), not just a "nicer" state claimed at the same one.
        // Suspect <-> Alive may still reorder at equal incarnation.
        if matches!(self.state, NodeLifecycle::StateDead | NodeLifecycle::StateLeft) && state == NodeLifecycle::StateAlive {
            return false;
        }
        state_rank(state) > state_rank(self.state)
            || (state_rank(state) == state_rank(self.state) && state != self.state)
    }

    pub fn transition(&mut self, incarnation: u64, state: NodeLifecycle) {
        self.incarnation = incarnation;
        self.state = state;
        self.state_change = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn node() -> NodeState {
        NodeState::new("a".into(), IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)
    }

    #[test]
    fn higher_incarnation_always_wins() {
        let mut n = node();
        n.transition(5, NodeLifecycle::StateAlive);
        assert!(n.is_newer(6, NodeLifecycle::StateDead));
        assert!(!n.is_newer(4, NodeLifecycle::StateAlive));
    }

    #[test]
    fn same_incarnation_prefers_alive_over_suspect_over_dead() {
        let mut n = node();
        n.transition(5, NodeLifecycle::StateSuspect);
        assert!(n.is_newer(5, NodeLifecycle::StateAlive));
        assert!(!n.is_newer(5, NodeLifecycle::StateDead));
    }

    #[test]
    fn reviving_a_dead_node_requires_strictly_higher_incarnation() {
        let mut n = node();
        n.transition(5, NodeLifecycle::StateDead);
        assert!(!n.is_newer(5, NodeLifecycle::StateAlive));
        assert!(n.is_newer(6, NodeLifecycle::StateAlive));
    }
}
