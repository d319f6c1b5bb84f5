//! Error types for encoding and decoding.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding protocol data.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization to CBOR failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Deserialization from CBOR failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Bytes decoded but do not describe the expected structure.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}

impl CodecError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
