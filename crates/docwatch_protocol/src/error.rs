//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while parsing or encoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A resume token was empty or malformed.
    #[error("invalid resume token: {0}")]
    InvalidToken(String),

    /// A timestamp string was not `seconds.ordinal`.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Unknown operation type name.
    #[error("invalid operation type: {0}")]
    InvalidOperationType(String),
}

impl ProtocolError {
    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }
}
