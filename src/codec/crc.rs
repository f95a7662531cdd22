//! `HasCrc` wrapper: `[HasCrc][crc32:u32 BE][payload]`.
//!
//! Used on UDP paths as a cheap integrity check independent of encryption.

use crate::codec::MessageType;
use crate::error::{NserfError, Result};
use crc32fast::Hasher;

pub fn wrap_crc(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(MessageType::HasCrc as u8);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Verify and strip a `HasCrc` wrapper (buffer must start right after the
/// `HasCrc` type byte). Returns the inner payload, or an error if the CRC
/// doesn't match or the buffer is too short.
pub fn strip_crc(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < 4 {
        return Err(NserfError::Codec("truncated crc header".into()));
    }
    let expected = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let payload = &buf[4..];

    let mut hasher = Hasher::new();
    hasher.update(payload);
    let actual = hasher.finalize();

    if actual != expected {
        return Err(NserfError::Codec(format!(
            "crc mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_intact_payload() {
        let payload = b"ping-payload";
        let wrapped = wrap_crc(payload);
        assert_eq!(wrapped[0], MessageType::HasCrc as u8);
        let out = strip_crc(&wrapped[1..]).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn detects_corrupted_byte() {
        let payload = b"ping-payload";
        let mut wrapped = wrap_crc(payload);
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0xFF;
        assert!(strip_crc(&wrapped[1..]).is_err());
    }
}
