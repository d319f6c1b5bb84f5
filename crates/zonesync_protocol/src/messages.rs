//! Messages exchanged with the remote record service.

use crate::codec::{from_cbor, to_cbor};
use crate::error::CodecResult;
use crate::ids::{ChangeToken, RecordId};
use crate::record::RemoteRecord;
use serde::{Deserialize, Serialize};

/// Request for the zone's changes since a change token.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchChangesRequest {
    /// Zone to read from.
    pub zone: String,
    /// Position to resume from. `None` fetches the whole zone.
    pub token: Option<ChangeToken>,
    /// Maximum number of changes per page.
    pub limit: u32,
}

impl FetchChangesRequest {
    /// Creates a fetch request.
    pub fn new(zone: impl Into<String>, token: Option<ChangeToken>, limit: u32) -> Self {
        Self {
            zone: zone.into(),
            token,
            limit,
        }
    }
}

/// One page of the zone change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchChangesResponse {
    /// Records created or modified since the token (latest state only).
    pub changed: Vec<RemoteRecord>,
    /// Records deleted since the token.
    pub deleted: Vec<RecordId>,
    /// Token positioned after this page.
    pub new_token: ChangeToken,
    /// Whether another page follows.
    pub more_coming: bool,
}

impl FetchChangesResponse {
    /// Creates a response page.
    pub fn new(
        changed: Vec<RemoteRecord>,
        deleted: Vec<RecordId>,
        new_token: ChangeToken,
        more_coming: bool,
    ) -> Self {
        Self {
            changed,
            deleted,
            new_token,
            more_coming,
        }
    }

    /// Number of changes in this page.
    pub fn len(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }

    /// Returns true if the page carries no changes.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Per-record result of a batched save.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveResult {
    /// Accepted; carries the record as stored, with new system fields.
    Saved(RemoteRecord),
    /// Rejected because the record's version token is stale.
    VersionConflict {
        /// The server's current copy.
        server: RemoteRecord,
    },
    /// Rejected for any other reason.
    Failed(String),
}

/// Outcome of saving one record.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// The record the outcome refers to.
    pub record_id: RecordId,
    /// What happened.
    pub result: SaveResult,
}

impl SaveOutcome {
    /// Creates a successful outcome.
    pub fn saved(record: RemoteRecord) -> Self {
        Self {
            record_id: record.record_id.clone(),
            result: SaveResult::Saved(record),
        }
    }

    /// Creates a stale-version outcome.
    pub fn conflict(server: RemoteRecord) -> Self {
        Self {
            record_id: server.record_id.clone(),
            result: SaveResult::VersionConflict { server },
        }
    }

    /// Creates a failed outcome.
    pub fn failed(record_id: RecordId, message: impl Into<String>) -> Self {
        Self {
            record_id,
            result: SaveResult::Failed(message.into()),
        }
    }
}

/// Per-record result of a batched delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteResult {
    /// The record is gone (deleting an unknown record also reports this).
    Deleted,
    /// The delete was rejected.
    Failed(String),
}

/// Outcome of deleting one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The record the outcome refers to.
    pub record_id: RecordId,
    /// What happened.
    pub result: DeleteResult,
}

impl DeleteOutcome {
    /// Creates a successful outcome.
    pub fn deleted(record_id: RecordId) -> Self {
        Self {
            record_id,
            result: DeleteResult::Deleted,
        }
    }

    /// Creates a failed outcome.
    pub fn failed(record_id: RecordId, message: impl Into<String>) -> Self {
        Self {
            record_id,
            result: DeleteResult::Failed(message.into()),
        }
    }
}

/// Response to a batched save or delete.
///
/// The two tokens bracket the batch in the change feed: every change
/// between `previous_token` and `new_token` was made by this batch. A
/// client whose cursor equals `previous_token` may move it to `new_token`
/// without reading its own writes back.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse<T> {
    /// One outcome per record, in request order.
    pub outcomes: Vec<T>,
    /// Feed position before the batch.
    pub previous_token: ChangeToken,
    /// Feed position after the batch.
    pub new_token: ChangeToken,
}

impl<T> WriteResponse<T> {
    /// Creates a response.
    pub fn new(outcomes: Vec<T>, previous_token: ChangeToken, new_token: ChangeToken) -> Self {
        Self {
            outcomes,
            previous_token,
            new_token,
        }
    }

    /// Returns true if the batch was applied right after `token`.
    pub fn follows(&self, token: &ChangeToken) -> bool {
        &self.previous_token == token
    }
}

/// Response to a batched save.
pub type SaveRecordsResponse = WriteResponse<SaveOutcome>;

/// Response to a batched delete.
pub type DeleteRecordsResponse = WriteResponse<DeleteOutcome>;

/// Kind of remote push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Something changed in a record zone.
    RecordZone,
    /// A query subscription fired.
    Query,
    /// Anything else.
    Other,
}

/// Decoded push-notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNotification {
    /// Notification kind.
    pub kind: NotificationKind,
    /// Zone the notification concerns, for zone notifications.
    pub zone: Option<String>,
    /// Subscription that produced the notification.
    pub subscription_id: Option<String>,
}

impl RemoteNotification {
    /// Creates a record-zone notification.
    pub fn record_zone(zone: impl Into<String>, subscription_id: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::RecordZone,
            zone: Some(zone.into()),
            subscription_id: Some(subscription_id.into()),
        }
    }

    /// Returns true if this is a zone notification for `zone`.
    pub fn concerns_zone(&self, zone: &str) -> bool {
        self.kind == NotificationKind::RecordZone && self.zone.as_deref() == Some(zone)
    }

    /// Encodes to the opaque payload bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from the opaque payload bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}
