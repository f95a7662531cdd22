//! Cluster-wide key rotation (spec.md §4.10). Each operation rides an
//! internal query (`_serf_install-key`/`use-key`/`remove-key`/`list-keys`)
//! so the operator gets a per-node success/failure response rather than
//! only knowing whether their own local keyring accepted the change.

use crate::codec::Keyring;
use crate::error::Result;
use crate::query::{QueryItem, QueryParam};
use crate::serf::Serf;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeKeyResponse {
    pub from: String,
    pub result: bool,
    pub message: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct KeyRequest {
    pub key: Option<String>,
}

/// Registered as the handler for `_serf_install-key` and friends on every
/// node; mutates the keyring backing [`crate::transport::WireSecurity`].
pub struct KeyManager {
    keyring: Arc<RwLock<Keyring>>,
}

impl KeyManager {
    pub fn new(keyring: Arc<RwLock<Keyring>>) -> Arc<Self> {
        Arc::new(Self { keyring })
    }

    pub fn list(&self) -> Vec<String> {
        self.keyring.read().keys().iter().map(|k| BASE64.encode(k)).collect()
    }

    pub(crate) fn decode(key: &str) -> std::result::Result<[u8; 32], String> {
        let bytes = BASE64.decode(key).map_err(|e| e.to_string())?;
        bytes.try_into().map_err(|_| "key must decode to exactly 32 bytes".to_string())
    }

    /// Dispatch one of the four key-manager query names against a decoded
    /// `KeyRequest` payload; called from the internal-query hook so the
    /// whole thing stays reachable without exposing `Keyring` further.
    pub fn handle(&self, name: &str, req: &KeyRequest) -> NodeKeyResponse {
        let outcome = match name {
            "_serf_install-key" => self.with_key(req, |kr, key| {
                kr.install(key);
                Ok(())
            }),
            "_serf_use-key" => self.with_key(req, |kr, key| kr.use_key(&key).map_err(|e| e.to_string())),
            "_serf_remove-key" => self.with_key(req, |kr, key| kr.remove(&key).map_err(|e| e.to_string())),
            "_serf_list-keys" => Ok(()),
            other => Err(format!("unknown key manager query {other}")),
        };
        match outcome {
            Ok(()) => NodeKeyResponse { from: String::new(), result: true, message: String::new(), keys: self.list() },
            Err(message) => NodeKeyResponse { from: String::new(), result: false, message, keys: self.list() },
        }
    }

    fn with_key(
        &self,
        req: &KeyRequest,
        apply: impl FnOnce(&mut Keyring, [u8; 32]) -> std::result::Result<(), String>,
    ) -> std::result::Result<(), String> {
        let key_b64 = req.key.as_deref().ok_or_else(|| "missing key".to_string())?;
        let key = Self::decode(key_b64)?;
        apply(&mut self.keyring.write(), key)
    }
}

/// Load a keyring file (spec.md §6 `KeyringFile`): a JSON array of
/// base64-encoded 32-byte keys, first entry primary. Mutually exclusive
/// with `Config::encrypt_key` at validation time, not here.
pub async fn load_keyring_file(path: &str) -> Result<Keyring> {
    let contents = tokio::fs::read_to_string(path).await?;
    let encoded: Vec<String> = serde_json::from_str(&contents)?;
    let mut ring = Keyring::empty();
    for (i, entry) in encoded.iter().enumerate() {
        let key = KeyManager::decode(entry).map_err(crate::error::NserfError::KeyManager)?;
        if i == 0 {
            ring = Keyring::new(key);
        } else {
            ring.install(key);
        }
    }
    Ok(ring)
}

/// Persist the current ring back to `path`, primary first, so a restart
/// picks up whatever rotation happened via `_serf_use-key`/`install-key`.
pub async fn save_keyring_file(path: &str, keyring: &Keyring) -> Result<()> {
    let encoded: Vec<String> = keyring.keys().iter().map(|k| BASE64.encode(k)).collect();
    let json = serde_json::to_string_pretty(&encoded)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

async fn run_key_query(serf: &Serf, name: &str, key: Option<[u8; 32]>) -> Result<Vec<NodeKeyResponse>> {
    let payload = rmp_serde::to_vec_named(&KeyRequest { key: key.map(|k| BASE64.encode(k)) })?;
    let mut handle = serf
        .query_internal(name.to_string(), payload, QueryParam { timeout: Some(Duration::from_secs(10)), ..Default::default() })
        .await?;
    let mut responses = Vec::new();
    while let Some(item) = handle.recv().await {
        if let QueryItem::Response(r) = item {
            if let Ok(mut parsed) = rmp_serde::from_slice::<NodeKeyResponse>(&r.payload) {
                parsed.from = r.from;
                responses.push(parsed);
            }
        }
    }
    Ok(responses)
}

pub async fn install_key(serf: &Serf, key: [u8; 32]) -> Result<Vec<NodeKeyResponse>> {
    run_key_query(serf, "_serf_install-key", Some(key)).await
}

pub async fn use_key(serf: &Serf, key: [u8; 32]) -> Result<Vec<NodeKeyResponse>> {
    run_key_query(serf, "_serf_use-key", Some(key)).await
}

pub async fn remove_key(serf: &Serf, key: [u8; 32]) -> Result<Vec<NodeKeyResponse>> {
    run_key_query(serf, "_serf_remove-key", Some(key)).await
}

pub async fn list_keys(serf: &Serf) -> Result<Vec<NodeKeyResponse>> {
    run_key_query(serf, "_serf_list-keys", None).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_use_then_remove_round_trips() {
        let km = KeyManager::new(Arc::new(RwLock::new(Keyring::empty())));
        let key = [9u8; 32];
        let encoded = BASE64.encode(key);

        let resp = km.handle("_serf_install-key", &KeyRequest { key: Some(encoded.clone()) });
        assert!(resp.result);
        assert_eq!(resp.keys.len(), 1);

        let resp = km.handle("_serf_use-key", &KeyRequest { key: Some(encoded.clone()) });
        assert!(resp.result);

        let resp = km.handle("_serf_remove-key", &KeyRequest { key: Some(encoded) });
        assert!(!resp.result, "cannot remove the primary key");
    }

    #[test]
    fn missing_key_is_rejected() {
        let km = KeyManager::new(Arc::new(RwLock::new(Keyring::empty())));
        let resp = km.handle("_serf_install-key", &KeyRequest { key: None });
        assert!(!resp.result);
    }
}
