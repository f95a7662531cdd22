//! Tombstone reaper and failed-node reconnector (spec.md §4.11). Two
//! independent tickers spawned once by `crate::agent::Agent::start`: one
//! drops long-dead member entries, the other retries one failed peer at a
//! time so a partitioned node isn't simply forgotten before it recovers.

use crate::serf::Serf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub fn spawn_reaper(serf: Arc<Serf>, interval: Duration, tombstone_timeout: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    serf.reap_expired(tombstone_timeout).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    });
}

pub fn spawn_reconnector(serf: Arc<Serf>, interval: Duration, reconnect_timeout: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(candidate) = serf.reconnect_candidate(reconnect_timeout) {
                        let addr = std::net::SocketAddr::new(candidate.addr, candidate.port);
                        if let Err(e) = serf.join(&[addr]).await {
                            tracing::debug!(node = %candidate.name, error = %e, "reconnect attempt failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatcher::Dispatcher;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_config(port: u16) -> Config {
        let mut cfg = Config::default();
        cfg.node_name = "a".into();
        cfg.bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        cfg
    }

    #[tokio::test]
    async fn reap_expired_is_a_no_op_on_an_empty_member_map() {
        let serf = Serf::create(test_config(18946), Dispatcher::new(16));
        serf.reap_expired(Duration::from_secs(0)).await;
        assert_eq!(serf.stats().members, 0);
    }

    #[tokio::test]
    async fn reconnect_candidate_is_none_with_no_failed_members() {
        let serf = Serf::create(test_config(18947), Dispatcher::new(16));
        assert!(serf.reconnect_candidate(Duration::from_secs(3600)).is_none());
    }
}
