//! Network transport: UDP for probes/gossip, TCP for push/pull and larger
//! user messages. Both wrap every payload in the label/encrypt/crc pipeline
//! from [`crate::codec`] before it hits the wire.

pub mod tcp;
pub mod udp;

pub use tcp::{TcpTransport, TcpTransportConfig};
pub use udp::{UdpPacket, UdpTransport, UdpTransportConfig};

use crate::codec::{self, Keyring};
use crate::error::Result;
use std::sync::Arc;

/// Shared security context applied to every outbound/inbound packet:
/// label (AAD + cluster-separation prefix) and keyring (empty = no
/// encryption).
#[derive(Clone)]
pub struct WireSecurity {
    pub label: Arc<Vec<u8>>,
    pub keyring: Arc<parking_lot::RwLock<Keyring>>,
}

impl WireSecurity {
    pub fn new(label: Vec<u8>, keyring: Keyring) -> Self {
        Self {
            label: Arc::new(label),
            keyring: Arc::new(parking_lot::RwLock::new(keyring)),
        }
    }

    pub fn none() -> Self {
        Self::new(Vec::new(), Keyring::empty())
    }

    /// Apply label wrapping and, if a keyring is configured, encryption.
    /// This is the outbound half of the pipeline; CRC is added separately
    /// by the UDP path only (spec §4.2).
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let sealed = if self.keyring.read().is_empty() {
            payload.to_vec()
        } else {
            codec::encrypt(&self.keyring.read(), &self.label, payload)?
        };
        if self.label.is_empty() {
            Ok(sealed)
        } else {
            codec::wrap_label(&self.label, &sealed)
        }
    }

    /// Reverse of [`Self::seal`]: strip the label (rejecting a mismatch),
    /// then decrypt if the payload was encrypted.
    pub fn unseal(&self, buf: &[u8]) -> Result<Vec<u8>> {
        let (label, rest) = codec::strip_label(buf)?;
        if label != *self.label {
            return Err(crate::error::NserfError::Transport(
                "label mismatch, dropping message".into(),
            ));
        }
        if codec::peek_type(rest) == Some(codec::MessageType::Encrypt) {
            codec::decrypt(&self.keyring.read(), &self.label, &rest[1..])
        } else {
            Ok(rest.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_unseal_round_trip_without_encryption() {
        let sec = WireSecurity::new(b"cluster-a".to_vec(), Keyring::empty());
        let sealed = sec.seal(b"payload").unwrap();
        let out = sec.unseal(&sealed).unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn seal_unseal_round_trip_with_encryption() {
        let sec = WireSecurity::new(b"cluster-a".to_vec(), Keyring::new([7u8; 32]));
        let sealed = sec.seal(b"secret-payload").unwrap();
        let out = sec.unseal(&sealed).unwrap();
        assert_eq!(out, b"secret-payload");
    }

    #[test]
    fn rejects_mismatched_label() {
        let sender = WireSecurity::new(b"cluster-a".to_vec(), Keyring::empty());
        let receiver = WireSecurity::new(b"cluster-b".to_vec(), Keyring::empty());
        let sealed = sender.seal(b"payload").unwrap();
        assert!(receiver.unseal(&sealed).is_err());
    }
}
