//! `Encrypt` wrapper: `[Encrypt][version:u8][nonce:12B][ciphertext][tag:16B]`,
//! AES-256-GCM with the configured label as additional authenticated data.
//!
//! A [`Keyring`] holds an ordered list of keys: index 0 is primary (used to
//! encrypt), every key in the ring is tried in order when decrypting, so a
//! peer that has rotated its primary key but still carries the old one as a
//! secondary can decode messages from nodes that haven't rotated yet.

use crate::codec::MessageType;
use crate::error::{NserfError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

const WIRE_VERSION: u8 = 0;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Ordered set of 32-byte AES-256 keys. Index 0 is primary (encrypts new
/// outgoing messages); every entry is attempted when decrypting.
#[derive(Clone, Default)]
pub struct Keyring {
    keys: Vec<[u8; KEY_LEN]>,
}

impl Keyring {
    pub fn new(primary: [u8; KEY_LEN]) -> Self {
        Self { keys: vec![primary] }
    }

    pub fn empty() -> Self {
        Self { keys: Vec::new() }
    }

    pub fn primary(&self) -> Option<&[u8; KEY_LEN]> {
        self.keys.first()
    }

    pub fn keys(&self) -> &[[u8; KEY_LEN]] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Add `key` as a secondary (non-primary) key if not already present.
    pub fn install(&mut self, key: [u8; KEY_LEN]) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Promote `key` to primary. The key must already be in the ring.
    pub fn use_key(&mut self, key: &[u8; KEY_LEN]) -> Result<()> {
        let idx = self
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| NserfError::KeyManager("key not present in ring".into()))?;
        self.keys.swap(0, idx);
        Ok(())
    }

    /// Remove `key` from the ring. Refuses to remove the primary key.
    pub fn remove(&mut self, key: &[u8; KEY_LEN]) -> Result<()> {
        if self.primary() == Some(key) {
            return Err(NserfError::KeyManager("cannot remove the primary key".into()));
        }
        self.keys.retain(|k| k != key);
        Ok(())
    }
}

/// Encrypt `plaintext` with the keyring's primary key, authenticating
/// `label` as additional data.
pub fn encrypt(keyring: &Keyring, label: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = keyring
        .primary()
        .ok_or_else(|| NserfError::Encryption("no primary key configured".into()))?;

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| NserfError::Encryption(format!("invalid key: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(
        nonce,
        Payload {
            msg: plaintext,
            aad: label,
        },
    )?;

    let mut buf = Vec::with_capacity(2 + NONCE_LEN + ciphertext.len());
    buf.push(MessageType::Encrypt as u8);
    buf.push(WIRE_VERSION);
    buf.extend_from_slice(&nonce_bytes);
    buf.extend_from_slice(&ciphertext);
    Ok(buf)
}

/// Decrypt an `Encrypt`-wrapped buffer (must start right after the
/// `Encrypt` type byte, i.e. at the version byte). Tries every key in the
/// ring until one produces a valid tag.
pub fn decrypt(keyring: &Keyring, label: &[u8], buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() < 1 + NONCE_LEN {
        return Err(NserfError::Encryption("truncated encrypt header".into()));
    }
    let version = buf[0];
    if version != WIRE_VERSION {
        return Err(NserfError::Encryption(format!("unsupported encrypt version {}", version)));
    }
    let nonce = Nonce::from_slice(&buf[1..1 + NONCE_LEN]);
    let ciphertext = &buf[1 + NONCE_LEN..];

    for key in keyring.keys() {
        let cipher = match Aes256Gcm::new_from_slice(key) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if let Ok(plaintext) = cipher.decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: label,
            },
        ) {
            return Ok(plaintext);
        }
    }
    Err(NserfError::Encryption("no key in ring could decrypt message".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; KEY_LEN] {
        [byte; KEY_LEN]
    }

    #[test]
    fn round_trips_with_matching_label() {
        let ring = Keyring::new(key(1));
        let wrapped = encrypt(&ring, b"prod", b"hello").unwrap();
        let out = decrypt(&ring, b"prod", &wrapped[1..]).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn rejects_mismatched_label() {
        let ring = Keyring::new(key(1));
        let wrapped = encrypt(&ring, b"prod", b"hello").unwrap();
        assert!(decrypt(&ring, b"staging", &wrapped[1..]).is_err());
    }

    #[test]
    fn secondary_key_still_decodes() {
        // Peer A's primary is K1; peer B has rotated to K2 primary but kept
        // K1 as a secondary, so it can still decode A's traffic.
        let sender = Keyring::new(key(1));
        let mut receiver = Keyring::new(key(2));
        receiver.install(key(1));

        let wrapped = encrypt(&sender, b"prod", b"still-readable").unwrap();
        let out = decrypt(&receiver, b"prod", &wrapped[1..]).unwrap();
        assert_eq!(out, b"still-readable");
    }

    #[test]
    fn use_key_promotes_to_primary() {
        let mut ring = Keyring::new(key(1));
        ring.install(key(2));
        ring.use_key(&key(2)).unwrap();
        assert_eq!(ring.primary(), Some(&key(2)));
    }

    #[test]
    fn remove_refuses_primary() {
        let mut ring = Keyring::new(key(1));
        assert!(ring.remove(&key(1)).is_err());
    }
}
