//! Test fixtures and store helpers.
//!
//! Provides a sample entity model and [`TestStore`], a session wired to a
//! [`SharedZone`] with helpers for the edits tests make most often.

use crate::remote::SharedZone;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zonesync_engine::{
    FetchRequest, IncrementalStore, ManagedObject, ObjectId, RetryConfig, SaveReport,
    SaveRequest, StoreOptions, SyncEvent, SyncReport, SyncSession,
};
use zonesync_protocol::{ChangeToken, Value};
use zonesync_storage::{
    AttributeDescription, AttributeType, BackingStore, EntityDescription, EntityModel,
    FileBackingStore, FileStateStore, InMemoryBackingStore, MemoryStateStore,
    RelationshipDescription, SyncStateStore,
};

/// Zone used by every test store.
pub const ZONE: &str = "notes";

/// Folders holding notes; a checklist is a kind of note.
pub fn notes_model() -> EntityModel {
    EntityModel::new()
        .with_entity(
            EntityDescription::new("Folder")
                .with_attribute(AttributeDescription::new("name", AttributeType::Text))
                .with_relationship(
                    RelationshipDescription::to_many("notes", "Note").with_inverse("folder"),
                ),
        )
        .with_entity(
            EntityDescription::new("Note")
                .with_attribute(AttributeDescription::new("title", AttributeType::Text).indexed())
                .with_attribute(AttributeDescription::new("body", AttributeType::Text).optional())
                .with_attribute(
                    AttributeDescription::new("pinned", AttributeType::Bool)
                        .with_default(Value::Bool(false)),
                )
                .with_relationship(
                    RelationshipDescription::to_one("folder", "Folder").with_inverse("notes"),
                ),
        )
        .with_entity(
            EntityDescription::new("Checklist")
                .with_parent("Note")
                .with_attribute(
                    AttributeDescription::new("items", AttributeType::Integer).optional(),
                ),
        )
}

/// Options for deterministic tests: the test zone, no sync on load and no
/// whole-run retries.
pub fn test_options() -> StoreOptions {
    StoreOptions::new()
        .with_zone_name(ZONE)
        .with_sync_on_open(false)
        .with_retry(RetryConfig::no_retry())
}

/// A loaded sync session with automatic cleanup.
pub struct TestStore {
    /// The session under test.
    pub session: SyncSession,
    sync_state: Arc<dyn SyncStateStore>,
    path: Option<PathBuf>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// An in-memory store with [`test_options`].
    pub fn memory(zone: &SharedZone) -> Self {
        Self::memory_with(zone, test_options())
    }

    /// An in-memory store with the given options.
    pub fn memory_with(zone: &SharedZone, options: StoreOptions) -> Self {
        Self::open(
            zone,
            Arc::new(InMemoryBackingStore::new()),
            Arc::new(MemoryStateStore::new()),
            options,
            None,
        )
    }

    /// A file-backed store in a fresh temporary directory.
    pub fn temp_file(zone: &SharedZone) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("store");
        let mut store = Self::file(zone, &path, test_options());
        store._temp_dir = Some(temp_dir);
        store
    }

    /// A file-backed store at `path`, created if missing.
    ///
    /// The store directory stays locked until the returned store is dropped.
    pub fn file(zone: &SharedZone, path: &Path, options: StoreOptions) -> Self {
        let backing =
            FileBackingStore::open(path, true).expect("Failed to open file backing store");
        Self::open(
            zone,
            Arc::new(backing),
            Arc::new(FileStateStore::for_store(path)),
            options,
            Some(path.to_path_buf()),
        )
    }

    fn open(
        zone: &SharedZone,
        backing: Arc<dyn BackingStore>,
        sync_state: Arc<dyn SyncStateStore>,
        options: StoreOptions,
        path: Option<PathBuf>,
    ) -> Self {
        let session = SyncSession::open(
            &notes_model(),
            backing,
            sync_state.clone(),
            zone.service(),
            options,
        )
        .expect("Failed to open sync session");
        session.load().expect("Failed to load store");
        Self {
            session,
            sync_state,
            path,
            _temp_dir: None,
        }
    }

    /// Returns the store directory if file-backed, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The stored sync cursor.
    pub fn cursor(&self) -> Option<ChangeToken> {
        self.sync_state
            .load()
            .expect("Failed to load sync state")
            .cursor
    }

    /// Saves one request and fails the test on any per-object failure.
    pub fn save(&self, request: SaveRequest) -> SaveReport {
        let report = self.session.execute_save(&request).expect("Failed to save");
        assert!(report.failures.is_empty(), "save failures: {:?}", report.failures);
        report
    }

    /// Inserts a note and returns its permanent identity.
    pub fn insert_note(&self, title: &str) -> ObjectId {
        let id = self.session.new_object_id("Note");
        let report = self.save(
            SaveRequest::new().insert(ManagedObject::new(id).with_attribute("title", title)),
        );
        report.inserted[0].clone()
    }

    /// Inserts a folder and a note filed in it, in one save.
    ///
    /// Returns `(folder, note)`.
    pub fn insert_filed_note(&self, folder_name: &str, title: &str) -> (ObjectId, ObjectId) {
        let folder = self.session.new_object_id("Folder");
        let note = self.session.new_object_id("Note");
        let report = self.save(
            SaveRequest::new()
                .insert(ManagedObject::new(folder.clone()).with_attribute("name", folder_name))
                .insert(
                    ManagedObject::new(note)
                        .with_attribute("title", title)
                        .with_to_one("folder", Some(folder)),
                ),
        );
        (report.inserted[0].clone(), report.inserted[1].clone())
    }

    /// Changes the title of a note.
    pub fn update_title(&self, id: &ObjectId, title: &str) {
        self.save(
            SaveRequest::new().update(ManagedObject::new(id.clone()).with_attribute("title", title)),
        );
    }

    /// Deletes an object.
    pub fn delete(&self, id: &ObjectId) {
        self.save(SaveRequest::new().delete(ManagedObject::new(id.clone())));
    }

    /// Every visible note, notes of sub-entities included.
    pub fn notes(&self) -> Vec<ObjectId> {
        self.session
            .execute_fetch(&FetchRequest::new("Note").sorted_by("title", true))
            .expect("Failed to fetch notes")
            .into_objects()
    }

    /// Titles of every visible note, sorted.
    pub fn titles(&self) -> Vec<String> {
        self.notes()
            .iter()
            .filter_map(|id| self.title_of(id))
            .collect()
    }

    /// Title of a note, or None if it is not visible.
    pub fn title_of(&self, id: &ObjectId) -> Option<String> {
        let node = self.session.resolve_incremental_values(id).ok()?;
        node.attributes
            .get("title")
            .and_then(Value::as_text)
            .map(str::to_string)
    }

    /// Folder a note is filed in.
    pub fn folder_of(&self, note: &ObjectId) -> Option<ObjectId> {
        let node = self
            .session
            .resolve_incremental_values(note)
            .expect("Failed to fault note");
        node.to_one.get("folder").cloned().flatten()
    }

    /// Number of shadow records waiting to be pushed.
    pub fn pending(&self) -> usize {
        self.session
            .pending_changes()
            .expect("Failed to count pending changes")
    }

    /// Runs one sync after any run in flight and returns its outcome.
    pub fn try_sync(&self) -> Result<SyncReport, String> {
        self.session.wait_idle();
        let events = self.session.subscribe();
        self.session.sync_now().map_err(|e| e.to_string())?;
        loop {
            match events.recv() {
                Ok(SyncEvent::Finished(result)) => return result,
                Ok(SyncEvent::Started) => continue,
                Err(_) => return Err("scheduler stopped".to_string()),
            }
        }
    }

    /// Runs one sync and fails the test if the run fails.
    pub fn sync(&self) -> SyncReport {
        self.try_sync().expect("Sync run failed")
    }
}

impl Deref for TestStore {
    type Target = SyncSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}
