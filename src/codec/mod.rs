//! Wire framing for the SWIM/Serf binary protocol.
//!
//! Every message on the wire starts with a one-byte [`MessageType`] tag.
//! Several tags (`Compound`, `HasLabel`, `Encrypt`, `Compress`, `HasCrc`)
//! are *wrapper* tags: the remainder of the buffer after the tag-specific
//! header is itself a framed message, recursively. The numeric codes below
//! are part of the wire format and must not be renumbered.

mod compound;
mod compress;
mod crc;
mod encrypt;
mod label;

pub use compound::{decode_compound, encode_compound};
pub use compress::{compress, decompress, CompressAlgo};
pub use crc::{strip_crc, wrap_crc};
pub use encrypt::{decrypt, encrypt, Keyring};
pub use label::{strip_label, wrap_label};

use crate::error::{NserfError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// One-byte message type tag. Numeric values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    AckResp = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    PushPull = 6,
    Compound = 7,
    User = 8,
    Compress = 9,
    Encrypt = 10,
    NackResp = 11,
    HasCrc = 12,
    Err = 13,
    HasLabel = 244,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        use MessageType::*;
        Some(match b {
            0 => Ping,
            1 => IndirectPing,
            2 => AckResp,
            3 => Suspect,
            4 => Alive,
            5 => Dead,
            6 => PushPull,
            7 => Compound,
            8 => User,
            9 => Compress,
            10 => Encrypt,
            11 => NackResp,
            12 => HasCrc,
            13 => Err,
            244 => HasLabel,
            _ => return None,
        })
    }
}

/// Default per-packet UDP size budget; larger payloads must go over TCP.
pub const UDP_SIZE_BUDGET: usize = 1400;

/// Serialize a value as `[type byte][msgpack payload]`.
///
/// MessagePack is used (not bincode) to stay wire-compatible with the
/// reference implementation's field ordering, per spec.
pub fn encode_message<T: Serialize>(ty: MessageType, value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(ty as u8);
    let mut payload = rmp_serde::to_vec_named(value)?;
    buf.append(&mut payload);
    Ok(buf)
}

/// Decode the leading type byte and msgpack-deserialize the remainder.
pub fn decode_message<T: DeserializeOwned>(buf: &[u8]) -> Result<(MessageType, T)> {
    if buf.is_empty() {
        return Err(NserfError::Codec("empty message buffer".into()));
    }
    let ty = MessageType::from_u8(buf[0])
        .ok_or_else(|| NserfError::Codec(format!("unknown message type {}", buf[0])))?;
    let value = rmp_serde::from_slice(&buf[1..])?;
    Ok((ty, value))
}

/// Peek the type byte without consuming or deserializing the payload.
pub fn peek_type(buf: &[u8]) -> Option<MessageType> {
    buf.first().copied().and_then(MessageType::from_u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Ping {
        seq_no: u64,
        node: String,
    }

    #[test]
    fn round_trips_a_simple_message() {
        let msg = Ping {
            seq_no: 42,
            node: "a".into(),
        };
        let encoded = encode_message(MessageType::Ping, &msg).unwrap();
        assert_eq!(encoded[0], MessageType::Ping as u8);
        let (ty, decoded): (MessageType, Ping) = decode_message(&encoded).unwrap();
        assert_eq!(ty, MessageType::Ping);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let buf = vec![250u8, 1, 2, 3];
        let result: Result<(MessageType, Ping)> = decode_message(&buf);
        assert!(result.is_err());
    }
}
