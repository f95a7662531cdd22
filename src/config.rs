//! Agent configuration. File/TOML loading and CLI argument parsing are
//! explicitly out of scope (spec.md §1); this struct is what that outer
//! layer is expected to populate before calling [`crate::agent::Agent::create`].

use crate::error::{NserfError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Lan,
    Wan,
    Local,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Identity / network
    pub node_name: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    pub profile: Profile,
    pub protocol: u8,
    pub tags: Option<HashMap<String, String>>,
    pub tags_file: Option<String>,

    // Timings
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub suspicion_mult: u32,
    pub reap_interval: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_timeout: Duration,
    pub tombstone_timeout: Duration,
    pub broadcast_timeout: Duration,
    pub leave_propagate_delay: Duration,
    pub gossip_to_dead_time: Duration,

    // Limits
    pub user_event_size_limit: usize,
    pub query_size_limit: usize,
    pub query_response_size_limit: usize,
    pub event_buffer: u64,
    pub query_buffer: u64,
    pub max_intent_buffer: usize,
    pub indirect_checks: usize,
    pub retransmit_mult: u32,
    pub query_timeout_mult: u32,
    pub awareness_max_multiplier: u32,

    // Security
    pub encrypt_key: Option<[u8; 32]>,
    pub keyring_file: Option<String>,
    pub label: Vec<u8>,

    // State
    pub snapshot_path: Option<String>,
    pub snapshot_size_limit: u64,
    pub rejoin_after_leave: bool,
    pub start_join: Vec<SocketAddr>,
    pub retry_join: bool,
    pub retry_interval: Duration,
    pub retry_max_attempts: u32,

    // Behaviour flags
    pub replay_on_join: bool,
    pub leave_on_term: bool,
    pub skip_leave_on_int: bool,
    pub enable_compression: bool,
    pub disable_coordinates: bool,

    // Event coalescing (spec.md §4.6); `None` disables coalescing for
    // that event class and delivers every message individually.
    pub coalesce_member_events: Option<CoalesceWindow>,
    pub coalesce_user_events: Option<CoalesceWindow>,
}

/// Debounce window for [`crate::coalesce`]: flush fires `QuiescentPeriod`
/// after the last event in a burst, capped at `CoalescePeriod` after the
/// first, whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct CoalesceWindow {
    pub coalesce_period: Duration,
    pub quiescent_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7946),
            advertise_addr: None,
            profile: Profile::Lan,
            protocol: 5,
            tags: None,
            tags_file: None,

            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            suspicion_mult: 4,
            reap_interval: Duration::from_secs(15),
            reconnect_interval: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(24 * 3600),
            tombstone_timeout: Duration::from_secs(24 * 3600),
            broadcast_timeout: Duration::from_secs(5),
            leave_propagate_delay: Duration::from_secs(1),
            gossip_to_dead_time: Duration::from_secs(30),

            user_event_size_limit: 512,
            query_size_limit: 1024,
            query_response_size_limit: 1024,
            event_buffer: 128,
            query_buffer: 128,
            max_intent_buffer: 128,
            indirect_checks: 3,
            retransmit_mult: 4,
            query_timeout_mult: 200,
            awareness_max_multiplier: 8,

            encrypt_key: None,
            keyring_file: None,
            label: Vec::new(),

            snapshot_path: None,
            snapshot_size_limit: 128 * 1024 * 1024,
            rejoin_after_leave: false,
            start_join: Vec::new(),
            retry_join: false,
            retry_interval: Duration::from_secs(30),
            retry_max_attempts: 0,

            replay_on_join: false,
            leave_on_term: false,
            skip_leave_on_int: false,
            enable_compression: false,
            disable_coordinates: false,

            coalesce_member_events: None,
            coalesce_user_events: None,
        }
    }
}

impl Config {
    /// Validate mutually-exclusive option pairs from spec.md §6. Called
    /// during `Agent::create`; a configuration error here must fail fast
    /// and never start any background task.
    pub fn validate(&self) -> Result<()> {
        if self.tags.is_some() && self.tags_file.is_some() {
            return Err(NserfError::Config(
                "Tags and TagsFile are mutually exclusive".into(),
            ));
        }
        if self.encrypt_key.is_some() && self.keyring_file.is_some() {
            return Err(NserfError::Config(
                "EncryptKey and KeyringFile are mutually exclusive".into(),
            ));
        }
        if self.node_name.is_empty() {
            return Err(NserfError::Config("node_name must not be empty".into()));
        }
        Ok(())
    }

    /// `Timeout` for a query against a cluster of `cluster_size` nodes,
    /// per spec.md §4.8: `GossipInterval × QueryTimeoutMult × log(N+1)`.
    pub fn default_query_timeout(&self, cluster_size: usize) -> Duration {
        let n = (cluster_size as f64 + 1.0).ln().max(0.0);
        self.gossip_interval.mul_f64(self.query_timeout_mult as f64 * n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_both_tags_and_tags_file() {
        let mut c = Config::default();
        c.tags = Some(HashMap::new());
        c.tags_file = Some("tags.json".into());
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_both_encrypt_key_and_keyring_file() {
        let mut c = Config::default();
        c.encrypt_key = Some([0u8; 32]);
        c.keyring_file = Some("keyring.json".into());
        assert!(c.validate().is_err());
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }
}
