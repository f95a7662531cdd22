//! Compound packet framing: `[Compound][count:u8][length:u16 BE × count][msg × count]`.

use crate::codec::MessageType;
use crate::error::{NserfError, Result};

/// Maximum sub-messages per compound packet; the count prefix is one byte.
pub const MAX_COMPOUND_MESSAGES: usize = 255;

/// Encode `messages` as a single compound packet. Fails if more than
/// [`MAX_COMPOUND_MESSAGES`] sub-messages are given, since the count field
/// is a single byte on the wire.
pub fn encode_compound(messages: &[Vec<u8>]) -> Result<Vec<u8>> {
    if messages.len() > MAX_COMPOUND_MESSAGES {
        return Err(NserfError::Codec(format!(
            "cannot compound {} messages, max is {}",
            messages.len(),
            MAX_COMPOUND_MESSAGES
        )));
    }

    let mut buf = Vec::with_capacity(1 + 1 + messages.len() * 2 + messages.iter().map(Vec::len).sum::<usize>());
    buf.push(MessageType::Compound as u8);
    buf.push(messages.len() as u8);
    for m in messages {
        let len = u16::try_from(m.len())
            .map_err(|_| NserfError::Codec("sub-message too large for compound packet".into()))?;
        buf.extend_from_slice(&len.to_be_bytes());
    }
    for m in messages {
        buf.extend_from_slice(m);
    }
    Ok(buf)
}

/// Result of decoding a compound packet: the sub-messages that were fully
/// present, and a count of how many trailing sub-messages were announced
/// in the header but truncated by a short buffer.
pub struct DecodedCompound {
    pub messages: Vec<Vec<u8>>,
    pub truncated: usize,
}

/// Decode a compound packet body (buffer must start right after the
/// `Compound` type byte).
pub fn decode_compound(buf: &[u8]) -> Result<DecodedCompound> {
    if buf.is_empty() {
        return Err(NserfError::Codec("truncated compound header".into()));
    }
    let count = buf[0] as usize;
    let mut offset = 1;

    let mut lengths = Vec::with_capacity(count);
    for i in 0..count {
        let start = offset + i * 2;
        if start + 2 > buf.len() {
            // Header itself was truncated; everything is unreadable.
            return Ok(DecodedCompound {
                messages: Vec::new(),
                truncated: count,
            });
        }
        let len = u16::from_be_bytes([buf[start], buf[start + 1]]) as usize;
        lengths.push(len);
    }
    offset += count * 2;

    let mut messages = Vec::with_capacity(count);
    let mut truncated = 0;
    for len in lengths {
        if offset + len > buf.len() {
            truncated += 1;
            continue;
        }
        messages.push(buf[offset..offset + len].to_vec());
        offset += len;
    }

    Ok(DecodedCompound { messages, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_full_255_messages() {
        let messages: Vec<Vec<u8>> = (0..255u16).map(|i| i.to_be_bytes().to_vec()).collect();
        let encoded = encode_compound(&messages).unwrap();
        let decoded = decode_compound(&encoded[1..]).unwrap();
        assert_eq!(decoded.truncated, 0);
        assert_eq!(decoded.messages, messages);
    }

    #[test]
    fn rejects_256_messages_at_encode_time() {
        let messages: Vec<Vec<u8>> = (0..256u16).map(|i| i.to_be_bytes().to_vec()).collect();
        assert!(encode_compound(&messages).is_err());
    }

    #[test]
    fn reports_truncation_count_on_short_buffer() {
        let messages: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![4, 5], vec![6]];
        let encoded = encode_compound(&messages).unwrap();
        // Drop the final sub-message's bytes to simulate a short read.
        let short = &encoded[1..encoded.len() - 1];
        let decoded = decode_compound(short).unwrap();
        assert_eq!(decoded.messages.len(), 2);
        assert_eq!(decoded.truncated, 1);
    }
}
