//! Conflict resolution policies.

use crate::config::ResolveCallback;
use crate::error::{SyncError, SyncResult};
use zonesync_protocol::{
    Conflict, ConflictKind, ConflictPolicy, RecordId, RemoteRecord, Resolution, SystemFields,
};

/// Applies the session's conflict policy.
#[derive(Clone)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
    callback: Option<ResolveCallback>,
}

impl ConflictResolver {
    /// Creates a resolver.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] if the policy needs a callback
    /// and none is given.
    pub fn new(policy: ConflictPolicy, callback: Option<ResolveCallback>) -> SyncResult<Self> {
        if policy.requires_callback() && callback.is_none() {
            return Err(SyncError::Configuration(
                "AskCaller policy requires a resolver callback".into(),
            ));
        }
        Ok(Self { policy, callback })
    }

    /// The configured policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Decides a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConflictResolution`] if the callback fails or
    /// returns a record with another identity. The caller must leave the
    /// local state untouched.
    pub fn resolve(&self, conflict: &Conflict) -> SyncResult<Resolution> {
        let kind = conflict.kind();
        let resolution = match self.policy {
            ConflictPolicy::ClientWins => Resolution::UseLocal,
            ConflictPolicy::ServerWins => Resolution::UseRemote,
            ConflictPolicy::LatestModificationWins => latest_wins(conflict),
            ConflictPolicy::KeepBoth => match kind {
                ConflictKind::DeleteUpdate => Resolution::UseRemote,
                ConflictKind::UpdateUpdate | ConflictKind::UpdateDelete => {
                    Resolution::Fork(fork_of(&conflict.local))
                }
            },
            ConflictPolicy::AskCaller => self.ask_caller(conflict)?,
        };

        tracing::debug!(
            record_id = %conflict.record_id,
            ?kind,
            policy = ?self.policy,
            resolution = resolution_name(&resolution),
            "conflict resolved"
        );
        Ok(resolution)
    }

    fn ask_caller(&self, conflict: &Conflict) -> SyncResult<Resolution> {
        let Some(remote) = &conflict.remote else {
            // Nothing to hand the callback; keep the local data.
            return Ok(Resolution::UseLocal);
        };
        let Some(callback) = &self.callback else {
            return Err(SyncError::Configuration(
                "AskCaller policy requires a resolver callback".into(),
            ));
        };

        let record = callback(&conflict.local, remote).map_err(|message| {
            SyncError::ConflictResolution {
                record_id: conflict.record_id.clone(),
                message,
            }
        })?;

        if record.record_id != conflict.record_id {
            return Err(SyncError::ConflictResolution {
                record_id: conflict.record_id.clone(),
                message: format!("resolver returned record {}", record.record_id),
            });
        }

        if record.same_content(remote) {
            Ok(Resolution::UseRemote)
        } else if record.same_content(&conflict.local) {
            Ok(Resolution::UseLocal)
        } else {
            Ok(Resolution::Merged(record))
        }
    }
}

/// Later timestamp wins; equal timestamps go to the remote side.
fn latest_wins(conflict: &Conflict) -> Resolution {
    let local_time = conflict.local.system.local_modified_at;
    let remote_time = conflict
        .remote
        .as_ref()
        .and_then(|remote| remote.system.modified_at);

    match (local_time, remote_time) {
        (Some(local), Some(remote)) if local > remote => Resolution::UseLocal,
        (Some(_), None) => Resolution::UseLocal,
        _ => Resolution::UseRemote,
    }
}

/// Copy of the local state under a fresh identity.
fn fork_of(local: &RemoteRecord) -> RemoteRecord {
    RemoteRecord {
        record_id: RecordId::generate(),
        entity: local.entity.clone(),
        fields: local.fields.clone(),
        references: local.references.clone(),
        system: SystemFields {
            version: None,
            modified_at: None,
            local_modified_at: local.system.local_modified_at,
        },
    }
}

fn resolution_name(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::UseLocal => "use_local",
        Resolution::UseRemote => "use_remote",
        Resolution::Merged(_) => "merged",
        Resolution::Fork(_) => "fork",
    }
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("policy", &self.policy)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
