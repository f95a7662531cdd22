//! `HasLabel` wrapper: `[HasLabel][labelLen:u8][label bytes][payload...]`.
//!
//! When a non-empty label is configured, every outbound message is
//! label-wrapped and the label bytes double as AAD for the encryption
//! layer, letting several logical clusters share one UDP port.

use crate::codec::MessageType;
use crate::error::{NserfError, Result};

const MAX_LABEL_LEN: usize = 255;

pub fn wrap_label(label: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    if label.len() > MAX_LABEL_LEN {
        return Err(NserfError::Codec(format!(
            "label too long: {} bytes (max {})",
            label.len(),
            MAX_LABEL_LEN
        )));
    }
    let mut buf = Vec::with_capacity(2 + label.len() + payload.len());
    buf.push(MessageType::HasLabel as u8);
    buf.push(label.len() as u8);
    buf.extend_from_slice(label);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Strip a `HasLabel` wrapper, if present, returning `(label, rest)`.
/// `rest` is `buf` unchanged when no label wrapper is present, with an
/// empty label.
pub fn strip_label(buf: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    if buf.first().copied() != Some(MessageType::HasLabel as u8) {
        return Ok((Vec::new(), buf));
    }
    if buf.len() < 2 {
        return Err(NserfError::Codec("truncated label header".into()));
    }
    let label_len = buf[1] as usize;
    if buf.len() < 2 + label_len {
        return Err(NserfError::Codec("truncated label bytes".into()));
    }
    let label = buf[2..2 + label_len].to_vec();
    Ok((label, &buf[2 + label_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_label() {
        let wrapped = wrap_label(b"prod-us-east", b"payload").unwrap();
        let (label, rest) = strip_label(&wrapped).unwrap();
        assert_eq!(label, b"prod-us-east");
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn passes_through_when_unlabeled() {
        let (label, rest) = strip_label(b"payload").unwrap();
        assert!(label.is_empty());
        assert_eq!(rest, b"payload");
    }
}
