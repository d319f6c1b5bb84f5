//! Error types for storage operations.

use crate::record::BackingId;
use std::io;
use thiserror::Error;
use zonesync_protocol::{CodecError, RecordId};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the backing store or the schema layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The stored data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store directory lock.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The entity model cannot be turned into a shadow schema.
    #[error("schema error: {0}")]
    Schema(String),

    /// A record ID is already used by another shadow record.
    #[error("duplicate record id: {0}")]
    DuplicateRecordId(RecordId),

    /// No shadow record exists under this backing identity.
    #[error("shadow record not found: {0:?}")]
    RecordNotFound(BackingId),

    /// The entity is not part of the schema.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// An attribute value does not match its declared type.
    #[error("type mismatch for {entity}.{attribute}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Entity name.
        entity: String,
        /// Attribute name.
        attribute: String,
        /// Declared type.
        expected: String,
        /// Type of the supplied value.
        found: String,
    },

    /// The commit was rejected by the store.
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

impl StorageError {
    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
