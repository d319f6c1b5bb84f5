//! The store session: the host-facing entry point that owns the engine and
//! its scheduler.

use crate::config::StoreOptions;
use crate::engine::{EngineParts, SyncEngine, SyncReport, SyncState, SyncStats};
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityMapper;
use crate::mapper::RecordMapper;
use crate::object::{
    FetchRequest, FetchResult, FetchResultType, ObjectId, ObjectNode, SaveRequest, StoreMetadata,
};
use crate::relationships::RelationshipResolver;
use crate::remote::RemoteZoneService;
use crate::scheduler::{Scheduler, SyncEvent, SyncJob, TriggerOutcome};
use crate::tracker::{ChangeTracker, SaveReport};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use zonesync_protocol::{ChangeType, RemoteNotification};
use zonesync_storage::{
    BackingStore, EntityModel, Predicate, ShadowQuery, ShadowRecord, ShadowSchema, StorageError,
    SyncStateStore,
};

/// Store type reported to the host.
pub const STORE_TYPE: &str = "ZoneSyncStore";

/// The plugin lifecycle a host persistence framework drives.
pub trait IncrementalStore {
    /// Loads the store and returns its metadata.
    fn load(&self) -> SyncResult<StoreMetadata>;

    /// Runs a fetch against live objects.
    fn execute_fetch(&self, request: &FetchRequest) -> SyncResult<FetchResult>;

    /// Records inserted, updated and deleted objects.
    fn execute_save(&self, request: &SaveRequest) -> SyncResult<SaveReport>;

    /// Returns the attribute values and to-one targets of an object.
    fn resolve_incremental_values(&self, id: &ObjectId) -> SyncResult<ObjectNode>;

    /// Returns the targets of one relationship of an object.
    fn resolve_relationship_values(
        &self,
        id: &ObjectId,
        relationship: &str,
    ) -> SyncResult<Vec<ObjectId>>;

    /// Mints permanent identities for objects about to be inserted.
    fn allocate_permanent_identities(&self, ids: &[ObjectId]) -> SyncResult<Vec<ObjectId>>;
}

/// One open store, scoped to one backing store and its sync state.
///
/// The session owns the scheduler; closing it (or dropping it) finishes any
/// pending run and stops the worker.
///
/// # Example
///
/// ```rust,ignore
/// let session = SyncSession::open(&model, backing, sync_state, remote, StoreOptions::new())?;
/// session.load()?;
/// let note = session.new_object_id("Note");
/// session.execute_save(&SaveRequest::new().insert(ManagedObject::new(note)))?;
/// session.wait_idle();
/// ```
pub struct SyncSession {
    schema: Arc<ShadowSchema>,
    backing: Arc<dyn BackingStore>,
    sync_state: Arc<dyn SyncStateStore>,
    identities: Arc<IdentityMapper>,
    relationships: Arc<RelationshipResolver>,
    tracker: ChangeTracker,
    engine: Arc<SyncEngine>,
    scheduler: Scheduler,
    zone: String,
    sync_on_open: bool,
    metadata: Mutex<Option<StoreMetadata>>,
    closed: AtomicBool,
}

impl SyncSession {
    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchemaSetup`] if the model cannot be augmented,
    /// and [`SyncError::Configuration`] for inconsistent options.
    pub fn open(
        model: &EntityModel,
        backing: Arc<dyn BackingStore>,
        sync_state: Arc<dyn SyncStateStore>,
        remote: Arc<dyn RemoteZoneService>,
        options: StoreOptions,
    ) -> SyncResult<Self> {
        options.validate().map_err(SyncError::Configuration)?;
        let schema = Arc::new(
            ShadowSchema::build(model).map_err(|e| SyncError::SchemaSetup(e.to_string()))?,
        );

        let identities = Arc::new(IdentityMapper::new(backing.clone()));
        let relationships = Arc::new(RelationshipResolver::new(
            schema.clone(),
            backing.clone(),
            identities.clone(),
        ));
        let mapper = Arc::new(RecordMapper::new(schema.clone(), relationships.clone()));
        let write_lock = Arc::new(Mutex::new(()));
        let tracker = ChangeTracker::new(
            schema.clone(),
            backing.clone(),
            identities.clone(),
            relationships.clone(),
            options.clock.clone(),
            write_lock.clone(),
        );

        let engine = Arc::new(SyncEngine::new(
            EngineParts {
                schema: schema.clone(),
                backing: backing.clone(),
                sync_state: sync_state.clone(),
                remote,
                relationships: relationships.clone(),
                mapper,
                write_lock,
            },
            &options,
        )?);
        let job: SyncJob = {
            let engine = engine.clone();
            Arc::new(move || engine.run())
        };
        let scheduler = Scheduler::start(job)?;

        tracing::info!(
            zone = %options.zone_name,
            policy = ?options.conflict_policy,
            "store session open"
        );

        Ok(Self {
            schema,
            backing,
            sync_state,
            identities,
            relationships,
            tracker,
            engine,
            scheduler,
            zone: options.zone_name,
            sync_on_open: options.sync_on_open,
            metadata: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::SessionClosed);
        }
        Ok(())
    }

    /// Mints a temporary identity for a new object.
    pub fn new_object_id(&self, entity: impl Into<String>) -> ObjectId {
        self.identities.new_temporary(entity)
    }

    /// Zone the session syncs with.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// The shadow schema.
    pub fn schema(&self) -> &ShadowSchema {
        &self.schema
    }

    /// Handles a push notification payload.
    ///
    /// Returns true if it concerned the watched zone and a sync was
    /// requested. Never blocks on the run.
    pub fn handle_push(&self, payload: &[u8]) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let notification = match RemoteNotification::decode(payload) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring undecodable push payload");
                return false;
            }
        };
        if !notification.concerns_zone(&self.zone) {
            tracing::debug!(zone = ?notification.zone, "push for another zone ignored");
            return false;
        }
        self.scheduler.trigger();
        true
    }

    /// Requests a sync.
    pub fn sync_now(&self) -> SyncResult<TriggerOutcome> {
        self.ensure_open()?;
        Ok(self.scheduler.trigger())
    }

    /// Registers for "sync started" and "sync finished" notifications.
    pub fn subscribe(&self) -> Receiver<SyncEvent> {
        self.scheduler.subscribe()
    }

    /// Blocks until no sync is executing or pending.
    pub fn wait_idle(&self) {
        self.scheduler.wait_idle();
    }

    /// Current engine state.
    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    /// Cumulative sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Report of the last successful run.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.engine.last_report()
    }

    /// Number of shadow records with pending local changes.
    pub fn pending_changes(&self) -> SyncResult<usize> {
        let pending = self.backing.query(
            &ShadowQuery::all().with_predicate(Predicate::NotChangeType(ChangeType::NoChange)),
        )?;
        Ok(pending.len())
    }

    /// Finishes the pending run and stops the scheduler. Later calls fail
    /// with [`SyncError::SessionClosed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.scheduler.shutdown();
            tracing::info!(zone = %self.zone, "store session closed");
        }
    }

    fn live_shadow(&self, id: &ObjectId) -> SyncResult<ShadowRecord> {
        match self.identities.shadow_for(id)? {
            Some((_, shadow)) if !shadow.is_tombstone() => Ok(shadow),
            _ => Err(SyncError::ObjectNotFound(id.to_string())),
        }
    }
}

impl IncrementalStore for SyncSession {
    fn load(&self) -> SyncResult<StoreMetadata> {
        self.ensure_open()?;
        let mut cached = self.metadata.lock();
        if let Some(metadata) = cached.as_ref() {
            return Ok(metadata.clone());
        }

        let mut state = self.sync_state.load()?;
        let store_uuid = match &state.store_uuid {
            Some(uuid) => uuid.clone(),
            None => {
                let uuid = uuid::Uuid::new_v4().to_string();
                state.store_uuid = Some(uuid.clone());
                self.sync_state.save(&state)?;
                uuid
            }
        };
        let metadata = StoreMetadata {
            store_uuid,
            store_type: STORE_TYPE.to_string(),
        };
        *cached = Some(metadata.clone());
        drop(cached);

        tracing::info!(store_uuid = %metadata.store_uuid, "store loaded");
        if self.sync_on_open {
            self.scheduler.trigger();
        }
        Ok(metadata)
    }

    fn execute_fetch(&self, request: &FetchRequest) -> SyncResult<FetchResult> {
        self.ensure_open()?;
        let entities = if request.include_subentities {
            self.schema.with_descendants(&request.entity)?
        } else {
            self.schema.field_map(&request.entity)?;
            vec![request.entity.clone()]
        };

        let mut query = ShadowQuery::entities(entities).with_predicate(
            Predicate::NotChangeType(ChangeType::Deleted).and(request.predicate.clone()),
        );
        query.sort_by = request.sort_by.clone();
        query.limit = request.limit;

        let rows = self.backing.query(&query)?;
        Ok(match request.result_type {
            FetchResultType::Count => FetchResult::Count(rows.len()),
            FetchResultType::ObjectIds => FetchResult::Objects(
                rows.into_iter()
                    .map(|(_, shadow)| ObjectId::permanent(shadow.entity, shadow.record_id))
                    .collect(),
            ),
        })
    }

    fn execute_save(&self, request: &SaveRequest) -> SyncResult<SaveReport> {
        self.ensure_open()?;
        if request.is_empty() {
            return Ok(SaveReport::default());
        }

        // Every inserted object needs its identity before any edge is written.
        for object in &request.inserted {
            self.identities.allocate_permanent(&object.id);
        }
        let report = self.tracker.apply_save(request);
        if report.changed() > 0 {
            self.scheduler.trigger();
        }
        Ok(report)
    }

    fn resolve_incremental_values(&self, id: &ObjectId) -> SyncResult<ObjectNode> {
        self.ensure_open()?;
        let shadow = self.live_shadow(id)?;
        let field_map = self.schema.field_map(&shadow.entity)?;

        let mut to_one = BTreeMap::new();
        for relationship in field_map.relationships().filter(|r| !r.to_many) {
            let target = self
                .relationships
                .targets_of(&shadow, &relationship.name)?
                .into_iter()
                .next();
            to_one.insert(relationship.name.clone(), target);
        }

        let system = shadow.system_fields()?;
        let version = system
            .local_modified_at
            .or(system.modified_at)
            .unwrap_or(1);

        Ok(ObjectNode {
            id: ObjectId::permanent(shadow.entity.clone(), shadow.record_id.clone()),
            attributes: shadow.attributes,
            to_one,
            version,
        })
    }

    fn resolve_relationship_values(
        &self,
        id: &ObjectId,
        relationship: &str,
    ) -> SyncResult<Vec<ObjectId>> {
        self.ensure_open()?;
        let shadow = self.live_shadow(id)?;
        let field_map = self.schema.field_map(&shadow.entity)?;
        if field_map.relationship(relationship).is_none() {
            return Err(StorageError::schema(format!(
                "{} has no relationship {relationship}",
                shadow.entity
            ))
            .into());
        }
        self.relationships.targets_of(&shadow, relationship)
    }

    fn allocate_permanent_identities(&self, ids: &[ObjectId]) -> SyncResult<Vec<ObjectId>> {
        self.ensure_open()?;
        Ok(ids
            .iter()
            .map(|id| self.identities.allocate_permanent(id))
            .collect())
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("zone", &self.zone)
            .field("engine", &self.engine)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
