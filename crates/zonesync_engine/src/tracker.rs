//! Recording local object changes into shadow records.

use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityMapper;
use crate::object::{ManagedObject, ObjectId, SaveRequest};
use crate::relationships::{PendingIds, RelationshipResolver, SkippedEdge};
use parking_lot::Mutex;
use std::sync::Arc;
use zonesync_protocol::{ChangeType, Clock};
use zonesync_storage::{
    BackingId, BackingStore, ShadowRecord, ShadowSchema, StorageError, WriteBatch,
};

/// A change that could not be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFailure {
    /// Object whose change was aborted.
    pub object: ObjectId,
    /// Error message.
    pub message: String,
}

/// Outcome of recording one save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Objects inserted, with their permanent identities.
    pub inserted: Vec<ObjectId>,
    /// Objects updated.
    pub updated: Vec<ObjectId>,
    /// Objects turned into tombstones.
    pub deleted: Vec<ObjectId>,
    /// Relationship edges that were left out.
    pub skipped_edges: Vec<SkippedEdge>,
    /// Changes that were aborted.
    pub failures: Vec<ObjectFailure>,
}

impl SaveReport {
    /// Returns true if every change was recorded completely.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped_edges.is_empty()
    }

    /// Number of objects whose change was recorded.
    pub fn changed(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// Writes local inserts, updates and deletes into shadow records and marks
/// them for push.
///
/// Each object's change is its own backing-store commit, so one failing
/// object never undoes the others.
pub struct ChangeTracker {
    schema: Arc<ShadowSchema>,
    backing: Arc<dyn BackingStore>,
    identities: Arc<IdentityMapper>,
    relationships: Arc<RelationshipResolver>,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl ChangeTracker {
    /// Creates a tracker.
    ///
    /// `write_lock` is shared with the sync engine so local writes never
    /// interleave with a remote merge.
    pub fn new(
        schema: Arc<ShadowSchema>,
        backing: Arc<dyn BackingStore>,
        identities: Arc<IdentityMapper>,
        relationships: Arc<RelationshipResolver>,
        clock: Arc<dyn Clock>,
        write_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            schema,
            backing,
            identities,
            relationships,
            clock,
            write_lock,
        }
    }

    /// Records a newly inserted object.
    ///
    /// The object's identity must already be permanent, or promoted through
    /// [`IdentityMapper::allocate_permanent`].
    pub fn on_insert(&self, object: &ManagedObject) -> SyncResult<Vec<SkippedEdge>> {
        let _guard = self.write_lock.lock();
        let (id, shadow) = self.new_shadow(object)?;
        self.commit_insert(object, id, shadow, &PendingIds::new())
    }

    /// Records changed values of an existing object.
    pub fn on_update(&self, object: &ManagedObject) -> SyncResult<Vec<SkippedEdge>> {
        let _guard = self.write_lock.lock();
        self.update_locked(object)
    }

    /// Turns an object into a tombstone awaiting remote deletion.
    ///
    /// Deleting an object that already is a tombstone does nothing.
    pub fn on_delete(&self, object: &ManagedObject) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        self.delete_locked(object)
    }

    /// Records a whole host save.
    ///
    /// Inserted objects are written in one batch so edges between objects
    /// inserted by the same save resolve. If that batch is rejected, each
    /// insert is written on its own and edges to inserts not yet written
    /// are reported as skipped. Either way every insert is committed at
    /// most once. Updates and deletes follow.
    pub fn apply_save(&self, request: &SaveRequest) -> SaveReport {
        let _guard = self.write_lock.lock();
        let mut report = SaveReport::default();

        let mut staged = Vec::new();
        for object in &request.inserted {
            match self.new_shadow(object) {
                Ok((id, shadow)) => staged.push((object, id, shadow)),
                Err(e) => report.failures.push(failure(object, &e)),
            }
        }

        for (object, skipped) in self.commit_inserts(staged, &mut report) {
            report.skipped_edges.extend(skipped);
            report.inserted.push(self.identities.allocate_permanent(&object.id));
        }

        for object in &request.updated {
            match self.update_locked(object) {
                Ok(skipped) => {
                    report.skipped_edges.extend(skipped);
                    report.updated.push(object.id.clone());
                }
                Err(e) => report.failures.push(failure(object, &e)),
            }
        }

        for object in &request.deleted {
            match self.delete_locked(object) {
                Ok(()) => report.deleted.push(object.id.clone()),
                Err(e) => report.failures.push(failure(object, &e)),
            }
        }

        let temporaries: Vec<ObjectId> = request
            .inserted
            .iter()
            .map(|object| object.id.clone())
            .collect();
        self.identities.forget(&temporaries);

        tracing::debug!(
            inserted = report.inserted.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            skipped_edges = report.skipped_edges.len(),
            failures = report.failures.len(),
            "save recorded"
        );
        report
    }

    fn new_shadow(&self, object: &ManagedObject) -> SyncResult<(BackingId, ShadowRecord)> {
        let record_id = self.identities.remote_for(&object.id)?;
        let field_map = self.schema.field_map(&object.id.entity)?;
        if self.backing.find_by_record_id(&record_id)?.is_some() {
            return Err(StorageError::DuplicateRecordId(record_id).into());
        }

        let mut shadow = ShadowRecord::new(object.id.entity.clone(), record_id);
        shadow.attributes = field_map.copy_attributes(&object.attributes)?;
        shadow.change_type = ChangeType::Updated;
        self.stamp(&mut shadow)?;
        Ok((self.backing.allocate_id()?, shadow))
    }

    /// Writes staged inserts, returning the objects recorded with their
    /// skipped edges.
    fn commit_inserts<'a>(
        &self,
        staged: Vec<(&'a ManagedObject, BackingId, ShadowRecord)>,
        report: &mut SaveReport,
    ) -> Vec<(&'a ManagedObject, Vec<SkippedEdge>)> {
        if staged.is_empty() {
            return Vec::new();
        }
        let pending: PendingIds = staged
            .iter()
            .map(|(_, id, shadow)| (shadow.record_id.clone(), (*id, shadow.entity.clone())))
            .collect();

        match self.commit_together(&staged, &pending) {
            Ok(skipped) => staged
                .into_iter()
                .map(|(object, _, _)| object)
                .zip(skipped)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, inserts = staged.len(), "save batch rejected; recording inserts one by one");
                let mut recorded = Vec::new();
                for (object, id, shadow) in staged {
                    match self.commit_insert(object, id, shadow, &PendingIds::new()) {
                        Ok(skipped) => recorded.push((object, skipped)),
                        Err(e) => report.failures.push(failure(object, &e)),
                    }
                }
                recorded
            }
        }
    }

    fn commit_together(
        &self,
        staged: &[(&ManagedObject, BackingId, ShadowRecord)],
        pending: &PendingIds,
    ) -> SyncResult<Vec<Vec<SkippedEdge>>> {
        let mut batch = WriteBatch::new();
        let mut skipped = Vec::with_capacity(staged.len());
        for (object, id, shadow) in staged {
            let mut shadow = shadow.clone();
            let field_map = self.schema.field_map(&shadow.entity)?;
            skipped.push(self.relationships.apply_object_edges(
                field_map,
                object,
                &mut shadow,
                pending,
            )?);
            batch.insert(*id, shadow);
        }
        self.backing.commit(batch)?;
        Ok(skipped)
    }

    fn commit_insert(
        &self,
        object: &ManagedObject,
        id: BackingId,
        mut shadow: ShadowRecord,
        pending: &PendingIds,
    ) -> SyncResult<Vec<SkippedEdge>> {
        let field_map = self.schema.field_map(&shadow.entity)?;
        let skipped = self
            .relationships
            .apply_object_edges(field_map, object, &mut shadow, pending)?;

        let mut batch = WriteBatch::new();
        batch.insert(id, shadow);
        self.backing.commit(batch)?;
        Ok(skipped)
    }

    fn live_shadow(&self, object: &ManagedObject) -> SyncResult<(BackingId, ShadowRecord)> {
        match self.identities.shadow_for(&object.id)? {
            Some((id, shadow)) if !shadow.is_tombstone() => Ok((id, shadow)),
            _ => Err(SyncError::ObjectNotFound(object.id.to_string())),
        }
    }

    fn update_locked(&self, object: &ManagedObject) -> SyncResult<Vec<SkippedEdge>> {
        let (id, mut shadow) = self.live_shadow(object)?;
        let field_map = self.schema.field_map(&shadow.entity)?;
        let mut values = shadow.attributes.clone();
        values.extend(object.attributes.clone());
        shadow.attributes = field_map.copy_attributes(&values)?;
        shadow.change_type = ChangeType::Updated;
        self.stamp(&mut shadow)?;
        let skipped = self.relationships.apply_object_edges(
            field_map,
            object,
            &mut shadow,
            &PendingIds::new(),
        )?;

        let mut batch = WriteBatch::new();
        batch.update(id, shadow);
        self.backing.commit(batch)?;
        Ok(skipped)
    }

    fn delete_locked(&self, object: &ManagedObject) -> SyncResult<()> {
        let (id, mut shadow) = match self.identities.shadow_for(&object.id)? {
            Some((_, shadow)) if shadow.is_tombstone() => return Ok(()),
            Some(found) => found,
            None => return Err(SyncError::ObjectNotFound(object.id.to_string())),
        };

        let field_map = self.schema.field_map(&shadow.entity)?;
        let mut values = shadow.attributes.clone();
        values.extend(object.attributes.clone());
        shadow.attributes = field_map.copy_attributes(&values)?;
        shadow.change_type = ChangeType::Deleted;
        self.stamp(&mut shadow)?;

        let mut batch = WriteBatch::new();
        batch.update(id, shadow);
        self.backing.commit(batch)?;
        Ok(())
    }

    fn stamp(&self, shadow: &mut ShadowRecord) -> SyncResult<()> {
        let mut system = shadow.system_fields()?;
        system.local_modified_at = Some(self.clock.now_millis());
        shadow.set_system_fields(&system)?;
        Ok(())
    }
}

fn failure(object: &ManagedObject, error: &SyncError) -> ObjectFailure {
    tracing::warn!(object = %object.id, error = %error, "change not recorded");
    ObjectFailure {
        object: object.id.clone(),
        message: error.to_string(),
    }
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationships::SkipReason;
    use crate::testing::Fixture;
    use zonesync_protocol::{RecordId, Reference, Value};
    use zonesync_storage::Edge;

    #[test]
    fn insert_marks_updated_and_stamps() {
        let fixture = Fixture::new();
        fixture.clock.set(1_000);
        let note = fixture.note("groceries");

        fixture.tracker.on_insert(&note).unwrap();

        let shadow = fixture.shadow_of(&note.id);
        assert_eq!(shadow.change_type, ChangeType::Updated);
        assert_eq!(shadow.attribute("title"), &Value::from("groceries"));
        assert_eq!(shadow.attribute("pinned"), &Value::Bool(false));
        assert_eq!(shadow.system_fields().unwrap().local_modified_at, Some(1_000));
    }

    #[test]
    fn insert_requires_permanent_identity() {
        let fixture = Fixture::new();
        let temp = fixture.identities.new_temporary("Note");
        let object = ManagedObject::new(temp).with_attribute("title", "x");
        assert!(matches!(
            fixture.tracker.on_insert(&object),
            Err(SyncError::TemporaryIdentity(_))
        ));
    }

    #[test]
    fn insert_twice_is_rejected() {
        let fixture = Fixture::new();
        let note = fixture.note("a");
        fixture.tracker.on_insert(&note).unwrap();
        assert!(matches!(
            fixture.tracker.on_insert(&note),
            Err(SyncError::Storage(StorageError::DuplicateRecordId(_)))
        ));
    }

    #[test]
    fn update_overwrites_and_keeps_unmentioned_values() {
        let fixture = Fixture::new();
        let note = fixture.note("draft").with_attribute("body", "text");
        fixture.tracker.on_insert(&note).unwrap();
        fixture.settle(&note.id);

        fixture.clock.set(2_000);
        let change = ManagedObject::new(note.id.clone()).with_attribute("title", "final");
        fixture.tracker.on_update(&change).unwrap();

        let shadow = fixture.shadow_of(&note.id);
        assert_eq!(shadow.change_type, ChangeType::Updated);
        assert_eq!(shadow.attribute("title"), &Value::from("final"));
        assert_eq!(shadow.attribute("body"), &Value::from("text"));
        assert_eq!(shadow.system_fields().unwrap().local_modified_at, Some(2_000));
    }

    #[test]
    fn update_of_unknown_object_fails() {
        let fixture = Fixture::new();
        let ghost = ManagedObject::new(ObjectId::permanent("Note", RecordId::from("ghost")));
        assert!(matches!(
            fixture.tracker.on_update(&ghost),
            Err(SyncError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn delete_leaves_tombstone() {
        let fixture = Fixture::new();
        let note = fixture.note("old");
        fixture.tracker.on_insert(&note).unwrap();
        fixture.tracker.on_delete(&note).unwrap();

        let shadow = fixture.shadow_of(&note.id);
        assert_eq!(shadow.change_type, ChangeType::Deleted);
        assert_eq!(shadow.attribute("title"), &Value::from("old"));

        // Deleting again is a no-op; updating a tombstone is not allowed.
        fixture.tracker.on_delete(&note).unwrap();
        assert!(matches!(
            fixture.tracker.on_update(&note),
            Err(SyncError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn save_links_objects_inserted_together() {
        let fixture = Fixture::new();
        let folder_temp = fixture.identities.new_temporary("Folder");
        let note_temp = fixture.identities.new_temporary("Note");
        let folder_id = fixture.identities.allocate_permanent(&folder_temp);
        let note_id = fixture.identities.allocate_permanent(&note_temp);

        let request = SaveRequest::new()
            .insert(
                ManagedObject::new(note_temp.clone())
                    .with_attribute("title", "inside")
                    .with_to_one("folder", Some(folder_temp.clone())),
            )
            .insert(
                ManagedObject::new(folder_temp.clone())
                    .with_attribute("name", "inbox")
                    .with_to_many("notes", vec![note_temp.clone()]),
            );

        let report = fixture.tracker.apply_save(&request);
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.inserted, vec![note_id.clone(), folder_id.clone()]);

        let note = fixture.shadow_of(&note_id);
        let (folder_backing, _) = fixture
            .identities
            .shadow_for(&folder_id)
            .unwrap()
            .unwrap();
        assert_eq!(note.relationships.get("folder"), Some(&Edge::One(Some(folder_backing))));

        // Promotions are forgotten once the save is recorded.
        assert!(fixture.identities.resolve(&note_temp).is_none());
    }

    #[test]
    fn save_reports_edges_to_temporary_objects() {
        let fixture = Fixture::new();
        let unsaved = fixture.identities.new_temporary("Folder");
        let note = fixture.note("loose").with_to_one("folder", Some(unsaved.clone()));

        let report = fixture.tracker.apply_save(&SaveRequest::new().insert(note.clone()));
        assert_eq!(report.inserted.len(), 1);
        assert_eq!(report.skipped_edges.len(), 1);
        assert_eq!(report.skipped_edges[0].target, unsaved);
        assert_eq!(report.skipped_edges[0].reason, SkipReason::TemporaryTarget);
        assert_eq!(
            fixture.shadow_of(&note.id).relationships.get("folder"),
            Some(&Edge::One(None))
        );
    }

    #[test]
    fn failing_object_does_not_abort_others() {
        let fixture = Fixture::new();
        let good = fixture.note("good");
        let bad = fixture.note("bad").with_attribute("pinned", "not a bool");
        let ghost = ManagedObject::new(ObjectId::permanent("Note", RecordId::from("ghost")));

        let report = fixture.tracker.apply_save(
            &SaveRequest::new()
                .insert(good.clone())
                .insert(bad.clone())
                .update(ghost.clone()),
        );

        assert_eq!(report.inserted, vec![good.id.clone()]);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].object, bad.id);
        assert_eq!(report.failures[1].object, ghost.id);
        assert!(fixture.identities.shadow_for(&bad.id).unwrap().is_none());
        assert_eq!(fixture.shadow_of(&good.id).change_type, ChangeType::Updated);
    }

    #[test]
    fn failed_insert_in_a_save_leaves_nothing_to_push() {
        let fixture = Fixture::new();
        let folder_temp = fixture.identities.new_temporary("Folder");
        let note_temp = fixture.identities.new_temporary("Note");
        let folder_id = fixture.identities.allocate_permanent(&folder_temp);
        let note_id = fixture.identities.allocate_permanent(&note_temp);

        let request = SaveRequest::new()
            .insert(
                ManagedObject::new(note_temp.clone())
                    .with_attribute("title", "inside")
                    .with_to_one("folder", Some(folder_temp.clone())),
            )
            .insert(
                ManagedObject::new(folder_temp.clone())
                    .with_attribute("name", "inbox")
                    .with_to_many("notes", vec![note_temp.clone()]),
            );

        // The batch is rejected, then the note's own commit fails too.
        fixture.backing.fail_next_commits(2);
        let report = fixture.tracker.apply_save(&request);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].object, note_temp);
        assert_eq!(report.inserted, vec![folder_id.clone()]);
        assert_eq!(report.skipped_edges.len(), 1);
        assert_eq!(report.skipped_edges[0].source, folder_temp);
        assert_eq!(report.skipped_edges[0].target, note_temp);
        assert_eq!(report.skipped_edges[0].reason, SkipReason::MissingTarget);

        assert!(fixture.identities.shadow_for(&note_id).unwrap().is_none());
        let snapshot = fixture.backing.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot
            .iter()
            .all(|(_, shadow)| shadow.record_id == *folder_id.record_id().unwrap()));

        let folder = fixture.shadow_of(&folder_id);
        let references = fixture
            .relationships
            .references_of(fixture.schema.field_map("Folder").unwrap(), &folder)
            .unwrap();
        assert_eq!(references.get("notes"), Some(&Reference::Many(vec![])));
    }

    #[test]
    fn rejected_save_batch_falls_back_to_single_inserts() {
        let fixture = Fixture::new();
        let folder_temp = fixture.identities.new_temporary("Folder");
        let note_temp = fixture.identities.new_temporary("Note");
        let folder_id = fixture.identities.allocate_permanent(&folder_temp);
        let note_id = fixture.identities.allocate_permanent(&note_temp);

        let request = SaveRequest::new()
            .insert(
                ManagedObject::new(note_temp.clone())
                    .with_attribute("title", "inside")
                    .with_to_one("folder", Some(folder_temp.clone())),
            )
            .insert(
                ManagedObject::new(folder_temp.clone())
                    .with_attribute("name", "inbox")
                    .with_to_many("notes", vec![note_temp.clone()]),
            );

        fixture.backing.fail_next_commits(1);
        let report = fixture.tracker.apply_save(&request);

        assert!(report.failures.is_empty());
        assert_eq!(report.inserted, vec![note_id.clone(), folder_id.clone()]);
        // The note went first, before its folder existed.
        assert_eq!(report.skipped_edges.len(), 1);
        assert_eq!(report.skipped_edges[0].source, note_temp);
        assert_eq!(report.skipped_edges[0].reason, SkipReason::MissingTarget);

        let (note_backing, _) = fixture.identities.shadow_for(&note_id).unwrap().unwrap();
        assert_eq!(
            fixture.shadow_of(&folder_id).relationships.get("notes"),
            Some(&Edge::Many(std::collections::BTreeSet::from([note_backing])))
        );
        assert_eq!(fixture.backing.snapshot().len(), 2);
    }

    #[test]
    fn failed_commit_leaves_no_shadow() {
        let fixture = Fixture::new();
        let note = fixture.note("lost");
        fixture.backing.fail_next_commits(1);
        assert!(fixture.tracker.on_insert(&note).is_err());
        assert!(fixture.identities.shadow_for(&note.id).unwrap().is_none());
    }
}
