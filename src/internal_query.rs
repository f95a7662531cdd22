//! Internal `_serf_*` queries (spec.md §4.9): probes and coordination
//! messages that never reach user event handlers. [`crate::serf::Serf`]
//! routes anything with that prefix (or the `INTERNAL` query flag) here
//! instead of the general dispatcher.

use crate::keymanager::{KeyManager, KeyRequest, NodeKeyResponse};
use crate::serf::InternalQueryHandler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// `_serf_conflict` reply: a node that suspects two peers are claiming the
/// same name asks "are you really at this address?"; every responder
/// answers with what it actually believes about itself. Resolving the
/// conflict (comparing replies and shutting the minority side down) is
/// left to the querying operator/tool; this is only the wire-level probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResponse {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
}

pub struct SerfInternalQueries {
    local_name: String,
    local_addr: IpAddr,
    local_port: u16,
    key_manager: Option<Arc<KeyManager>>,
}

impl SerfInternalQueries {
    pub fn new(local_name: String, local_addr: IpAddr, local_port: u16, key_manager: Option<Arc<KeyManager>>) -> Arc<Self> {
        Arc::new(Self { local_name, local_addr, local_port, key_manager })
    }
}

#[async_trait]
impl InternalQueryHandler for SerfInternalQueries {
    async fn handle(&self, name: &str, payload: &[u8]) -> Option<Vec<u8>> {
        match name {
            // The ack (sent unconditionally for ACK_REQUESTED queries)
            // already proves liveness; no response payload is needed.
            "_serf_ping" => None,
            "_serf_conflict" => {
                let resp = ConflictResponse { name: self.local_name.clone(), addr: self.local_addr, port: self.local_port };
                rmp_serde::to_vec_named(&resp).ok()
            }
            "_serf_install-key" | "_serf_use-key" | "_serf_remove-key" | "_serf_list-keys" => {
                let key_manager = self.key_manager.as_ref()?;
                let req: KeyRequest = rmp_serde::from_slice(payload).unwrap_or_default();
                let mut resp = key_manager.handle(name, &req);
                resp.from = self.local_name.clone();
                rmp_serde::to_vec_named(&resp).ok()
            }
            _ => {
                tracing::debug!(name, "unhandled internal query");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Keyring;
    use parking_lot::RwLock;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn conflict_query_answers_with_local_identity() {
        let handler = SerfInternalQueries::new("node-a".into(), IpAddr::V4(Ipv4Addr::LOCALHOST), 7946, None);
        let encoded = handler.handle("_serf_conflict", &[]).await.unwrap();
        let resp: ConflictResponse = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(resp.name, "node-a");
    }

    #[tokio::test]
    async fn ping_never_produces_a_response_payload() {
        let handler = SerfInternalQueries::new("node-a".into(), IpAddr::V4(Ipv4Addr::LOCALHOST), 7946, None);
        assert!(handler.handle("_serf_ping", &[]).await.is_none());
    }

    #[tokio::test]
    async fn key_query_without_a_key_manager_is_ignored() {
        let handler = SerfInternalQueries::new("node-a".into(), IpAddr::V4(Ipv4Addr::LOCALHOST), 7946, None);
        assert!(handler.handle("_serf_list-keys", &[]).await.is_none());
    }

    #[tokio::test]
    async fn key_query_with_a_key_manager_lists_keys() {
        let km = KeyManager::new(Arc::new(RwLock::new(Keyring::empty())));
        let handler = SerfInternalQueries::new("node-a".into(), IpAddr::V4(Ipv4Addr::LOCALHOST), 7946, Some(km));
        let encoded = handler.handle("_serf_list-keys", &[]).await.unwrap();
        let resp: NodeKeyResponse = rmp_serde::from_slice(&encoded).unwrap();
        assert!(resp.result);
    }
}
