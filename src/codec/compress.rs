//! `Compress` wrapper: `[Compress][algo:u8][body]`.
//!
//! Algorithm byte 0 denotes gzip in this port. The reference implementation's
//! comments reference an LZW variant, but its actual wire bytes are gzip;
//! this codebase freezes algo-byte 0 = gzip (see DESIGN.md).

use crate::codec::MessageType;
use crate::error::{NserfError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressAlgo {
    Gzip = 0,
}

impl CompressAlgo {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(CompressAlgo::Gzip),
            other => Err(NserfError::Codec(format!("unknown compression algo {}", other))),
        }
    }
}

pub fn compress(algo: CompressAlgo, body: &[u8]) -> Result<Vec<u8>> {
    let compressed = match algo {
        CompressAlgo::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()?
        }
    };

    let mut buf = Vec::with_capacity(2 + compressed.len());
    buf.push(MessageType::Compress as u8);
    buf.push(algo as u8);
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Decompress a `Compress`-wrapped body (buffer must start right after the
/// `Compress` type byte, i.e. at the algo byte).
pub fn decompress(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.is_empty() {
        return Err(NserfError::Codec("truncated compress header".into()));
    }
    let algo = CompressAlgo::from_u8(buf[0])?;
    match algo {
        CompressAlgo::Gzip => {
            let mut decoder = GzDecoder::new(&buf[1..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_gzip() {
        let body = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let wrapped = compress(CompressAlgo::Gzip, &body).unwrap();
        assert_eq!(wrapped[0], MessageType::Compress as u8);
        let out = decompress(&wrapped[1..]).unwrap();
        assert_eq!(out, body);
    }
}
