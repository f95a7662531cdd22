use crate::config::Config;
use std::time::Duration;

/// The subset of [`crate::config::Config`] the SWIM core needs, pulled out
/// so `Memberlist` doesn't depend on Serf-level or RPC-level config.
#[derive(Debug, Clone)]
pub struct MemberlistConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub suspicion_mult: u32,
    pub indirect_checks: usize,
    pub retransmit_mult: u32,
    pub awareness_max_multiplier: u32,
    pub gossip_to_dead_time: Duration,
    pub label: Vec<u8>,
}

impl From<&Config> for MemberlistConfig {
    fn from(c: &Config) -> Self {
        Self {
            probe_interval: c.probe_interval,
            probe_timeout: c.probe_timeout,
            gossip_interval: c.gossip_interval,
            gossip_nodes: c.gossip_nodes,
            push_pull_interval: c.push_pull_interval,
            suspicion_mult: c.suspicion_mult,
            indirect_checks: c.indirect_checks,
            retransmit_mult: c.retransmit_mult,
            awareness_max_multiplier: c.awareness_max_multiplier,
            gossip_to_dead_time: c.gossip_to_dead_time,
            label: c.label.clone(),
        }
    }
}
