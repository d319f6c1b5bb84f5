//! Error types for the sync engine.

use crate::remote::RemoteError;
use thiserror::Error;
use zonesync_protocol::RecordId;
use zonesync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in a store session.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The shadow schema could not be built. Fatal at open.
    #[error("schema setup failed: {0}")]
    SchemaSetup(String),

    /// Creating the zone or the subscription failed. The step's flag stays
    /// unset and the next run retries it.
    #[error("bootstrap step {step} failed: {message}")]
    Bootstrap {
        /// Step that failed (`zone` or `subscription`).
        step: &'static str,
        /// Error message.
        message: String,
    },

    /// Reading the change feed failed.
    #[error("fetch failed: {message}")]
    Fetch {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The stored change token is no longer accepted.
    #[error("change token expired")]
    ChangeTokenExpired,

    /// A record could not be pushed.
    #[error("push failed for {record_id}: {message}")]
    Push {
        /// Record that failed.
        record_id: RecordId,
        /// Error message.
        message: String,
    },

    /// A conflict could not be resolved; local state was kept.
    #[error("conflict resolution failed for {record_id}: {message}")]
    ConflictResolution {
        /// Record in conflict.
        record_id: RecordId,
        /// Error message.
        message: String,
    },

    /// Backing store or sync state error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote service error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The store options are inconsistent.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The object has no permanent identity yet.
    #[error("object {0} has only a temporary identity")]
    TemporaryIdentity(String),

    /// No live object exists under this identity.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The sync worker could not be started.
    #[error("sync worker error: {0}")]
    Worker(String),

    /// The session has been closed.
    #[error("store session closed")]
    SessionClosed,
}

impl SyncError {
    /// Creates a retryable fetch error.
    pub fn fetch_retryable(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable fetch error.
    pub fn fetch_fatal(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if repeating the run may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Fetch { retryable, .. } => *retryable,
            SyncError::Remote(remote) => remote.is_retryable(),
            SyncError::Bootstrap { .. } => true,
            SyncError::ChangeTokenExpired => true,
            _ => false,
        }
    }
}

impl From<zonesync_protocol::CodecError> for SyncError {
    fn from(error: zonesync_protocol::CodecError) -> Self {
        SyncError::Storage(StorageError::Codec(error))
    }
}
