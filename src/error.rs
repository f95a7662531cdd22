use thiserror::Error;

/// Crate-wide error type. Most variants here are surfaced to callers
/// (configuration, join, query, key management); protocol and transport
/// failures are logged and counted at the point of occurrence and rarely
/// propagate as a constructed `NserfError` (see `metrics`).
#[derive(Error, Debug)]
pub enum NserfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("join failed: {0}")]
    Join(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("key manager error: {0}")]
    KeyManager(String),

    #[error("name conflict for node {0}")]
    Conflict(String),

    #[error("value too large: {0}")]
    TooLarge(String),

    #[error("agent is shutting down")]
    Shutdown,

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, NserfError>;

impl From<rmp_serde::encode::Error> for NserfError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NserfError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NserfError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        NserfError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for NserfError {
    fn from(e: serde_json::Error) -> Self {
        NserfError::Codec(e.to_string())
    }
}

impl From<aes_gcm::Error> for NserfError {
    fn from(e: aes_gcm::Error) -> Self {
        NserfError::Encryption(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_message() {
        let e = NserfError::Conflict("node-a".into());
        assert_eq!(e.to_string(), "name conflict for node node-a");
    }
}
