//! Mapping between object identities and record ids.

use crate::error::{SyncError, SyncResult};
use crate::object::{Identity, ObjectId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zonesync_protocol::RecordId;
use zonesync_storage::{BackingId, BackingStore, ShadowRecord};

/// Maps host object identities to record ids and back.
///
/// Permanent identities carry their record id directly. Temporary
/// identities gain one when promoted; the promotion is remembered until the
/// save that inserts the object completes, so relationships inside that save
/// can already point at it.
pub struct IdentityMapper {
    backing: Arc<dyn BackingStore>,
    next_temporary: AtomicU64,
    promoted: Mutex<HashMap<u64, RecordId>>,
}

impl IdentityMapper {
    /// Creates a mapper over the backing store.
    pub fn new(backing: Arc<dyn BackingStore>) -> Self {
        Self {
            backing,
            next_temporary: AtomicU64::new(1),
            promoted: Mutex::new(HashMap::new()),
        }
    }

    /// Mints a temporary identity for a new object.
    pub fn new_temporary(&self, entity: impl Into<String>) -> ObjectId {
        let tag = self.next_temporary.fetch_add(1, Ordering::SeqCst);
        ObjectId::temporary(entity, tag)
    }

    /// Mints a new globally unique record id.
    pub fn allocate_identity(&self) -> RecordId {
        RecordId::generate()
    }

    /// Returns the permanent form of an identity, minting a record id for
    /// temporary identities that have none yet.
    pub fn allocate_permanent(&self, id: &ObjectId) -> ObjectId {
        match &id.identity {
            Identity::Permanent(_) => id.clone(),
            Identity::Temporary(tag) => {
                let record_id = self
                    .promoted
                    .lock()
                    .entry(*tag)
                    .or_insert_with(RecordId::generate)
                    .clone();
                ObjectId::permanent(id.entity.clone(), record_id)
            }
        }
    }

    /// Returns the record id of an identity, if it has one.
    pub fn resolve(&self, id: &ObjectId) -> Option<RecordId> {
        match &id.identity {
            Identity::Permanent(record_id) => Some(record_id.clone()),
            Identity::Temporary(tag) => self.promoted.lock().get(tag).cloned(),
        }
    }

    /// Returns the record id of an identity.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TemporaryIdentity`] if the identity has none.
    pub fn remote_for(&self, id: &ObjectId) -> SyncResult<RecordId> {
        self.resolve(id)
            .ok_or_else(|| SyncError::TemporaryIdentity(id.to_string()))
    }

    /// Returns the identity of the live object backed by this record id.
    ///
    /// Tombstones have no live object.
    pub fn local_for(&self, record_id: &RecordId) -> SyncResult<Option<ObjectId>> {
        Ok(self
            .backing
            .find_by_record_id(record_id)?
            .filter(|(_, shadow)| !shadow.is_tombstone())
            .map(|(_, shadow)| ObjectId::permanent(shadow.entity, record_id.clone())))
    }

    /// Looks up the shadow record behind an identity.
    pub fn shadow_for(&self, id: &ObjectId) -> SyncResult<Option<(BackingId, ShadowRecord)>> {
        match self.resolve(id) {
            Some(record_id) => Ok(self.backing.find_by_record_id(&record_id)?),
            None => Ok(None),
        }
    }

    /// Drops remembered promotions once their objects are persisted.
    pub fn forget(&self, ids: &[ObjectId]) {
        let mut promoted = self.promoted.lock();
        for id in ids {
            if let Identity::Temporary(tag) = id.identity {
                promoted.remove(&tag);
            }
        }
    }
}

impl std::fmt::Debug for IdentityMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMapper")
            .field("promoted", &self.promoted.lock().len())
            .finish()
    }
}
