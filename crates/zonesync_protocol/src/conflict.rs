//! Conflict detection and resolution types.

use crate::change_type::ChangeType;
use crate::ids::RecordId;
use crate::record::RemoteRecord;

/// Shape of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both sides modified the record.
    UpdateUpdate,
    /// Local side modified the record, remote side deleted it.
    UpdateDelete,
    /// Local side deleted the record, remote side modified it.
    DeleteUpdate,
}

/// A record with pending local changes and an incompatible remote change.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Record identity.
    pub record_id: RecordId,
    /// Local state, built from the shadow record (for tombstones, the final
    /// local state at deletion time).
    pub local: RemoteRecord,
    /// Pending local change.
    pub local_change: ChangeType,
    /// Remote state, or `None` if the remote side deleted the record.
    pub remote: Option<RemoteRecord>,
}

impl Conflict {
    /// Creates a conflict.
    pub fn new(local: RemoteRecord, local_change: ChangeType, remote: Option<RemoteRecord>) -> Self {
        Self {
            record_id: local.record_id.clone(),
            local,
            local_change,
            remote,
        }
    }

    /// Classifies the conflict.
    pub fn kind(&self) -> ConflictKind {
        match (&self.remote, self.local_change) {
            (None, _) => ConflictKind::UpdateDelete,
            (Some(_), ChangeType::Deleted) => ConflictKind::DeleteUpdate,
            (Some(_), _) => ConflictKind::UpdateUpdate,
        }
    }

    /// Returns true if the remote side deleted the record.
    pub fn is_remote_delete(&self) -> bool {
        self.remote.is_none()
    }
}

/// Decision taken for one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local pending state; it will be pushed.
    UseLocal,
    /// Overwrite local with the remote state.
    UseRemote,
    /// A caller-supplied record replaces both sides.
    Merged(RemoteRecord),
    /// Apply the remote state under the existing identity and keep the local
    /// version as a new record with a fresh identity.
    Fork(RemoteRecord),
}

/// Policy for resolving conflicts, selected once per store session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Local pending state always wins.
    ClientWins,
    /// Remote state always wins.
    ServerWins,
    /// An injected callback decides.
    AskCaller,
    /// The later modification timestamp wins.
    #[default]
    LatestModificationWins,
    /// Both versions are kept as separate records.
    KeepBoth,
}

impl ConflictPolicy {
    /// Returns true if this policy needs a resolution callback.
    pub fn requires_callback(&self) -> bool {
        matches!(self, ConflictPolicy::AskCaller)
    }

    /// Converts to a stable numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictPolicy::ClientWins => 0,
            ConflictPolicy::ServerWins => 1,
            ConflictPolicy::AskCaller => 2,
            ConflictPolicy::LatestModificationWins => 3,
            ConflictPolicy::KeepBoth => 4,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConflictPolicy::ClientWins),
            1 => Some(ConflictPolicy::ServerWins),
            2 => Some(ConflictPolicy::AskCaller),
            3 => Some(ConflictPolicy::LatestModificationWins),
            4 => Some(ConflictPolicy::KeepBoth),
            _ => None,
        }
    }
}
