//! Backing store trait definition.

use crate::error::StorageResult;
use crate::query::ShadowQuery;
use crate::record::{BackingId, ShadowRecord};
use zonesync_protocol::RecordId;

/// The durable store that holds shadow records.
///
/// Backing stores know nothing about remote records or sync. They store
/// [`ShadowRecord`]s under [`BackingId`]s, answer predicate queries and
/// apply [`WriteBatch`]es atomically.
///
/// # Invariants
///
/// - A [`RecordId`] identifies at most one shadow record across the store
/// - `commit` applies every operation of a batch or none of them
/// - Deleting a record removes every edge pointing at it
/// - Edges never point at records that do not exist after a commit
/// - Backing identities are never reused
///
/// # Implementors
///
/// - [`super::InMemoryBackingStore`] - For testing
/// - [`super::FileBackingStore`] - For persistent storage
pub trait BackingStore: Send + Sync {
    /// Reserves a fresh backing identity for a record about to be inserted.
    ///
    /// Reserving identities up front lets one batch insert several records
    /// that point at each other.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot allocate identities.
    fn allocate_id(&self) -> StorageResult<BackingId>;

    /// Reads a record by backing identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, id: BackingId) -> StorageResult<Option<ShadowRecord>>;

    /// Looks a record up by its record identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn find_by_record_id(
        &self,
        record_id: &RecordId,
    ) -> StorageResult<Option<(BackingId, ShadowRecord)>>;

    /// Runs a query. Results without a sort key come in backing-id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn query(&self, query: &ShadowQuery) -> StorageResult<Vec<(BackingId, ShadowRecord)>>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the store unchanged, if:
    /// - An insert reuses an existing backing identity or record identity
    /// - An update or delete targets a missing record
    /// - An edge points at a record that does not exist
    /// - The store cannot be written
    fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Number of shadow records, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn count(&self) -> StorageResult<usize>;
}

/// One write in a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Inserts a record under a reserved identity.
    Insert(BackingId, ShadowRecord),
    /// Replaces an existing record.
    Update(BackingId, ShadowRecord),
    /// Removes a record.
    Delete(BackingId),
}

/// An ordered list of writes applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an insert.
    pub fn insert(&mut self, id: BackingId, record: ShadowRecord) {
        self.ops.push(WriteOp::Insert(id, record));
    }

    /// Adds an update.
    pub fn update(&mut self, id: BackingId, record: ShadowRecord) {
        self.ops.push(WriteOp::Update(id, record));
    }

    /// Adds a delete.
    pub fn delete(&mut self, id: BackingId) {
        self.ops.push(WriteOp::Delete(id));
    }

    /// Returns the operations in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
