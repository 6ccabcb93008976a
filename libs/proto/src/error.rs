//! Error types for parsing and framing.

use thiserror::Error;

/// Errors produced while parsing access points, validating keys or decoding
/// frames.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The access point string is empty or structurally malformed.
    #[error("invalid access point '{input}': {reason}")]
    InvalidAccessPoint { input: String, reason: &'static str },

    /// Unknown protocol name in an access point string.
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    /// The key cannot be sent to a backend.
    #[error("invalid key: {reason}")]
    BadKey { reason: &'static str },

    /// A frame could not be encoded or decoded.
    #[error("framing error: {0}")]
    Framing(#[from] serde_json::Error),
}

impl ProtoError {
    /// Returns true if this error was caused by an unusable key.
    pub fn is_bad_key(&self) -> bool {
        matches!(self, ProtoError::BadKey { .. })
    }
}
