//! In-memory backing store.

use crate::backend::{BackingStore, WriteBatch, WriteOp};
use crate::error::{StorageError, StorageResult};
use crate::query::ShadowQuery;
use crate::record::{BackingId, ShadowRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use zonesync_protocol::RecordId;

/// The record table shared by the in-memory and file stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ShadowTable {
    next_id: u64,
    rows: BTreeMap<BackingId, ShadowRecord>,
    #[serde(skip)]
    index: HashMap<RecordId, BackingId>,
}

impl ShadowTable {
    /// Rebuilds the record-id index after deserialization.
    pub(crate) fn reindex(&mut self) -> StorageResult<()> {
        self.index.clear();
        for (id, record) in &self.rows {
            if self.index.insert(record.record_id.clone(), *id).is_some() {
                return Err(StorageError::corrupted(format!(
                    "record id {} stored twice",
                    record.record_id
                )));
            }
            if id.as_u64() >= self.next_id {
                return Err(StorageError::corrupted(format!(
                    "backing id {id} beyond allocator position {}",
                    self.next_id
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn allocate(&mut self) -> BackingId {
        let id = BackingId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn get(&self, id: BackingId) -> Option<&ShadowRecord> {
        self.rows.get(&id)
    }

    pub(crate) fn find(&self, record_id: &RecordId) -> Option<(BackingId, ShadowRecord)> {
        let id = self.index.get(record_id)?;
        self.rows.get(id).map(|record| (*id, record.clone()))
    }

    pub(crate) fn query(&self, query: &ShadowQuery) -> Vec<(BackingId, ShadowRecord)> {
        let rows = self
            .rows
            .iter()
            .filter(|(_, record)| query.matches(record))
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        query.finish(rows, |(_, record)| record)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Applies a batch to a copy of the table and returns the copy.
    ///
    /// The receiver is untouched, so a failed batch leaves no trace.
    pub(crate) fn apply(&self, batch: WriteBatch) -> StorageResult<ShadowTable> {
        let mut next = self.clone();
        let mut deleted = BTreeSet::new();

        for op in batch.into_ops() {
            match op {
                WriteOp::Insert(id, record) => {
                    if id.as_u64() >= next.next_id || next.rows.contains_key(&id) {
                        return Err(StorageError::CommitFailed(format!(
                            "backing id {id} was not reserved or is in use"
                        )));
                    }
                    if next.index.contains_key(&record.record_id) {
                        return Err(StorageError::DuplicateRecordId(record.record_id));
                    }
                    next.index.insert(record.record_id.clone(), id);
                    next.rows.insert(id, record);
                }
                WriteOp::Update(id, record) => {
                    let Some(previous) = next.rows.get(&id) else {
                        return Err(StorageError::RecordNotFound(id));
                    };
                    if previous.record_id != record.record_id {
                        if next.index.contains_key(&record.record_id) {
                            return Err(StorageError::DuplicateRecordId(record.record_id));
                        }
                        next.index.remove(&previous.record_id);
                        next.index.insert(record.record_id.clone(), id);
                    }
                    next.rows.insert(id, record);
                }
                WriteOp::Delete(id) => {
                    let Some(previous) = next.rows.remove(&id) else {
                        return Err(StorageError::RecordNotFound(id));
                    };
                    next.index.remove(&previous.record_id);
                    deleted.insert(id);
                }
            }
        }

        let existing: BTreeSet<BackingId> = next.rows.keys().copied().collect();
        for (id, record) in next.rows.iter_mut() {
            for edge in record.relationships.values_mut() {
                for target in edge.targets() {
                    if deleted.contains(&target) {
                        edge.remove(target);
                    } else if !existing.contains(&target) {
                        return Err(StorageError::CommitFailed(format!(
                            "record {id} points at missing record {target}"
                        )));
                    }
                }
            }
        }

        Ok(next)
    }
}

/// An in-memory backing store.
///
/// Suitable for unit tests, integration tests and stores that do not need
/// to survive the process.
///
/// # Thread Safety
///
/// The store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use zonesync_protocol::RecordId;
/// use zonesync_storage::{BackingStore, InMemoryBackingStore, ShadowRecord, WriteBatch};
///
/// let store = InMemoryBackingStore::new();
/// let id = store.allocate_id().unwrap();
/// let mut batch = WriteBatch::new();
/// batch.insert(id, ShadowRecord::new("Folder", RecordId::from("f1")));
/// store.commit(batch).unwrap();
/// assert_eq!(store.count().unwrap(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackingStore {
    table: RwLock<ShadowTable>,
    failing_commits: RwLock<usize>,
}

impl InMemoryBackingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail without touching the store.
    ///
    /// Useful for testing that sync leaves no partial state behind.
    pub fn fail_next_commits(&self, count: usize) {
        *self.failing_commits.write() = count;
    }

    /// Returns a copy of every record.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(BackingId, ShadowRecord)> {
        self.table.read().query(&ShadowQuery::all())
    }
}

impl BackingStore for InMemoryBackingStore {
    fn allocate_id(&self) -> StorageResult<BackingId> {
        Ok(self.table.write().allocate())
    }

    fn get(&self, id: BackingId) -> StorageResult<Option<ShadowRecord>> {
        Ok(self.table.read().get(id).cloned())
    }

    fn find_by_record_id(
        &self,
        record_id: &RecordId,
    ) -> StorageResult<Option<(BackingId, ShadowRecord)>> {
        Ok(self.table.read().find(record_id))
    }

    fn query(&self, query: &ShadowQuery) -> StorageResult<Vec<(BackingId, ShadowRecord)>> {
        Ok(self.table.read().query(query))
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        {
            let mut failing = self.failing_commits.write();
            if *failing > 0 {
                *failing -= 1;
                return Err(StorageError::CommitFailed("injected failure".into()));
            }
        }
        let mut table = self.table.write();
        let next = table.apply(batch)?;
        *table = next;
        Ok(())
    }

    fn count(&self) -> StorageResult<usize> {
        Ok(self.table.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Predicate;
    use crate::record::Edge;
    use zonesync_protocol::{ChangeType, Value};

    fn insert(store: &InMemoryBackingStore, record: ShadowRecord) -> BackingId {
        let id = store.allocate_id().unwrap();
        let mut batch = WriteBatch::new();
        batch.insert(id, record);
        store.commit(batch).unwrap();
        id
    }

    #[test]
    fn insert_and_lookup() {
        let store = InMemoryBackingStore::new();
        let id = insert(&store, ShadowRecord::new("Note", RecordId::from("n1")));

        assert_eq!(store.get(id).unwrap().unwrap().entity, "Note");
        let (found, _) = store
            .find_by_record_id(&RecordId::from("n1"))
            .unwrap()
            .unwrap();
        assert_eq!(found, id);
        assert!(store.find_by_record_id(&RecordId::from("x")).unwrap().is_none());
    }

    #[test]
    fn duplicate_record_id_rejected() {
        let store = InMemoryBackingStore::new();
        insert(&store, ShadowRecord::new("Note", RecordId::from("n1")));

        let id = store.allocate_id().unwrap();
        let mut batch = WriteBatch::new();
        batch.insert(id, ShadowRecord::new("Folder", RecordId::from("n1")));
        assert!(matches!(
            store.commit(batch),
            Err(StorageError::DuplicateRecordId(_))
        ));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn failed_batch_leaves_no_trace() {
        let store = InMemoryBackingStore::new();
        let first = store.allocate_id().unwrap();
        let mut batch = WriteBatch::new();
        batch.insert(first, ShadowRecord::new("Note", RecordId::from("n1")));
        batch.delete(BackingId::new(999));

        assert!(store.commit(batch).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn batch_inserts_can_reference_each_other() {
        let store = InMemoryBackingStore::new();
        let folder_id = store.allocate_id().unwrap();
        let note_id = store.allocate_id().unwrap();

        let mut folder = ShadowRecord::new("Folder", RecordId::from("f1"));
        folder
            .relationships
            .insert("notes".into(), Edge::Many([note_id].into_iter().collect()));
        let mut note = ShadowRecord::new("Note", RecordId::from("n1"));
        note.relationships
            .insert("folder".into(), Edge::One(Some(folder_id)));

        let mut batch = WriteBatch::new();
        batch.insert(folder_id, folder);
        batch.insert(note_id, note);
        store.commit(batch).unwrap();

        let note = store.get(note_id).unwrap().unwrap();
        assert_eq!(note.relationships["folder"], Edge::One(Some(folder_id)));
    }

    #[test]
    fn delete_nullifies_edges() {
        let store = InMemoryBackingStore::new();
        let folder_id = insert(&store, ShadowRecord::new("Folder", RecordId::from("f1")));

        let mut note = ShadowRecord::new("Note", RecordId::from("n1"));
        note.relationships
            .insert("folder".into(), Edge::One(Some(folder_id)));
        let note_id = insert(&store, note);

        let mut batch = WriteBatch::new();
        batch.delete(folder_id);
        store.commit(batch).unwrap();

        let note = store.get(note_id).unwrap().unwrap();
        assert_eq!(note.relationships["folder"], Edge::One(None));
    }

    #[test]
    fn dangling_edge_rejected() {
        let store = InMemoryBackingStore::new();
        let mut note = ShadowRecord::new("Note", RecordId::from("n1"));
        note.relationships
            .insert("folder".into(), Edge::One(Some(BackingId::new(77))));

        let id = store.allocate_id().unwrap();
        let mut batch = WriteBatch::new();
        batch.insert(id, note);
        assert!(matches!(
            store.commit(batch),
            Err(StorageError::CommitFailed(_))
        ));
    }

    #[test]
    fn query_excludes_by_change_type() {
        let store = InMemoryBackingStore::new();
        let mut live = ShadowRecord::new("Note", RecordId::from("n1"));
        live.attributes.insert("title".into(), Value::from("a"));
        insert(&store, live);

        let mut gone = ShadowRecord::new("Note", RecordId::from("n2"));
        gone.change_type = ChangeType::Deleted;
        insert(&store, gone);

        let query =
            ShadowQuery::all().with_predicate(Predicate::NotChangeType(ChangeType::Deleted));
        let rows = store.query(&query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.record_id, RecordId::from("n1"));
    }

    #[test]
    fn injected_failures() {
        let store = InMemoryBackingStore::new();
        store.fail_next_commits(1);

        let id = store.allocate_id().unwrap();
        let mut batch = WriteBatch::new();
        batch.insert(id, ShadowRecord::new("Note", RecordId::from("n1")));
        assert!(store.commit(batch.clone()).is_err());
        store.commit(batch).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn ids_are_not_reused() {
        let store = InMemoryBackingStore::new();
        let a = insert(&store, ShadowRecord::new("Note", RecordId::from("n1")));
        let mut batch = WriteBatch::new();
        batch.delete(a);
        store.commit(batch).unwrap();

        let b = store.allocate_id().unwrap();
        assert_ne!(a, b);
    }
}
