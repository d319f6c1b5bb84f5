//! The remote zone service boundary.

use thiserror::Error;
use zonesync_protocol::{
    DeleteRecordsResponse, FetchChangesRequest, FetchChangesResponse, RecordId, RemoteRecord,
    SaveRecordsResponse,
};

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a remote zone service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The service could not be reached or is overloaded.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The change token is no longer accepted.
    #[error("change token expired")]
    ChangeTokenExpired,

    /// The zone does not exist.
    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    /// The request was rejected.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// A remote, zone-based record service.
///
/// This trait abstracts the network layer. Calls block the caller; the
/// engine only ever calls it from the scheduler worker.
///
/// Per-record problems in batched calls are reported as outcomes, not as
/// errors. An `Err` means the whole call failed.
pub trait RemoteZoneService: Send + Sync {
    /// Creates the zone if it does not exist.
    fn ensure_zone(&self, zone: &str) -> RemoteResult<()>;

    /// Creates the zone's change subscription if it does not exist.
    fn ensure_subscription(&self, zone: &str, subscription_id: &str) -> RemoteResult<()>;

    /// Reads one page of the zone change feed.
    fn fetch_changes(&self, request: &FetchChangesRequest) -> RemoteResult<FetchChangesResponse>;

    /// Saves a batch of records. One outcome per record, plus the feed
    /// positions around the batch.
    fn save_records(&self, zone: &str, records: Vec<RemoteRecord>)
        -> RemoteResult<SaveRecordsResponse>;

    /// Deletes a batch of records. One outcome per record, plus the feed
    /// positions around the batch.
    fn delete_records(&self, zone: &str, record_ids: Vec<RecordId>)
        -> RemoteResult<DeleteRecordsResponse>;

    /// Largest batch the service accepts.
    fn max_batch_size(&self) -> usize;
}

impl<T: RemoteZoneService + ?Sized> RemoteZoneService for std::sync::Arc<T> {
    fn ensure_zone(&self, zone: &str) -> RemoteResult<()> {
        (**self).ensure_zone(zone)
    }

    fn ensure_subscription(&self, zone: &str, subscription_id: &str) -> RemoteResult<()> {
        (**self).ensure_subscription(zone, subscription_id)
    }

    fn fetch_changes(&self, request: &FetchChangesRequest) -> RemoteResult<FetchChangesResponse> {
        (**self).fetch_changes(request)
    }

    fn save_records(
        &self,
        zone: &str,
        records: Vec<RemoteRecord>,
    ) -> RemoteResult<SaveRecordsResponse> {
        (**self).save_records(zone, records)
    }

    fn delete_records(
        &self,
        zone: &str,
        record_ids: Vec<RecordId>,
    ) -> RemoteResult<DeleteRecordsResponse> {
        (**self).delete_records(zone, record_ids)
    }

    fn max_batch_size(&self) -> usize {
        (**self).max_batch_size()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Adapter from the reference server to the service trait.

    use super::*;
    use zonesync_server::{ServerError, ZoneServer};

    fn convert(error: ServerError) -> RemoteError {
        match error {
            ServerError::ZoneNotFound(zone) => RemoteError::ZoneNotFound(zone),
            ServerError::ChangeTokenExpired => RemoteError::ChangeTokenExpired,
            ServerError::Unavailable(message) => RemoteError::Unavailable(message),
            other => RemoteError::Rejected(other.to_string()),
        }
    }

    impl RemoteZoneService for ZoneServer {
        fn ensure_zone(&self, zone: &str) -> RemoteResult<()> {
            ZoneServer::ensure_zone(self, zone).map_err(convert)
        }

        fn ensure_subscription(&self, zone: &str, subscription_id: &str) -> RemoteResult<()> {
            ZoneServer::ensure_subscription(self, zone, subscription_id).map_err(convert)
        }

        fn fetch_changes(
            &self,
            request: &FetchChangesRequest,
        ) -> RemoteResult<FetchChangesResponse> {
            ZoneServer::fetch_changes(self, request).map_err(convert)
        }

        fn save_records(
            &self,
            zone: &str,
            records: Vec<RemoteRecord>,
        ) -> RemoteResult<SaveRecordsResponse> {
            ZoneServer::save_records(self, zone, records).map_err(convert)
        }

        fn delete_records(
            &self,
            zone: &str,
            record_ids: Vec<RecordId>,
        ) -> RemoteResult<DeleteRecordsResponse> {
            ZoneServer::delete_records(self, zone, record_ids).map_err(convert)
        }

        fn max_batch_size(&self) -> usize {
            ZoneServer::max_batch_size(self)
        }
    }
}
