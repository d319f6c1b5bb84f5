//! Error types for the zone server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by the zone server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The zone does not exist.
    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    /// The change token is malformed or no longer valid.
    #[error("change token expired")]
    ChangeTokenExpired,

    /// A batch exceeds the server limit.
    #[error("batch of {size} exceeds limit {max}")]
    BatchTooLarge {
        /// Submitted batch size.
        size: usize,
        /// Server limit.
        max: usize,
    },

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The service is temporarily unreachable.
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ServerError {
    /// Returns true if the request can succeed when repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServerError::Unavailable(_))
    }
}
