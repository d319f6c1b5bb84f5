//! The sync engine: fetch, apply remote changes, push local changes, commit.

use crate::bootstrap::CloudBootstrap;
use crate::config::{RetryConfig, StoreOptions};
use crate::conflict::ConflictResolver;
use crate::error::{SyncError, SyncResult};
use crate::mapper::RecordMapper;
use crate::relationships::{PendingIds, RelationshipResolver};
use crate::remote::{RemoteError, RemoteZoneService};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zonesync_protocol::{
    ChangeToken, ChangeType, Conflict, DeleteResult, FetchChangesRequest, RecordId, Reference,
    RemoteRecord, Resolution, SaveResult, SystemFields, WriteResponse,
};
use zonesync_storage::{
    BackingId, BackingStore, Predicate, ShadowQuery, ShadowRecord, ShadowSchema, SyncStateStore,
    WriteBatch,
};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No run has started yet.
    Idle,
    /// Creating the zone or the subscription.
    Bootstrapping,
    /// Reading the change feed.
    Fetching,
    /// Merging remote changes into shadow records.
    ApplyingRemote,
    /// Sending local changes.
    Pushing,
    /// Storing the cursor after the last push.
    Committing,
    /// The last run completed.
    Synced,
    /// The last run failed.
    Error,
}

impl SyncState {
    /// Returns true while a run is in progress.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Phase in which a per-record failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Reading the change feed.
    Fetch,
    /// Merging remote changes.
    ApplyRemote,
    /// Sending local changes.
    Push,
    /// Committing pushed changes.
    Commit,
}

/// A record that could not be synced in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    /// Record concerned.
    pub record_id: RecordId,
    /// Phase that failed.
    pub phase: SyncPhase,
    /// Error message.
    pub message: String,
}

/// Result of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Changed records read from the feed.
    pub fetched: usize,
    /// Deleted record ids read from the feed.
    pub remote_deletions: usize,
    /// Shadow records written from remote state.
    pub applied: usize,
    /// Shadow records removed because they were deleted remotely.
    pub removed: usize,
    /// Conflicts handed to the resolver.
    pub conflicts: usize,
    /// Forked copies created.
    pub forks: usize,
    /// Records saved remotely.
    pub saved: usize,
    /// Records deleted remotely.
    pub deleted: usize,
    /// Saves that succeeded on the retry after a conflict.
    pub retried: usize,
    /// Records that could not be synced.
    pub failures: Vec<RecordFailure>,
    /// Whether the whole feed was read.
    pub full_resync: bool,
    /// Whether the cursor was stored.
    pub cursor_advanced: bool,
    /// Attempts used, the first one included.
    pub attempts: u32,
    /// Duration of the run.
    pub duration: Duration,
}

impl SyncReport {
    /// Records saved or deleted remotely.
    pub fn pushed(&self) -> usize {
        self.saved + self.deleted
    }

    /// Returns true if no record failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, record_id: &RecordId, phase: SyncPhase, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(record_id = %record_id, ?phase, error = %message, "record not synced");
        self.failures.push(RecordFailure {
            record_id: record_id.clone(),
            phase,
            message,
        });
    }
}

/// Cumulative statistics about sync runs.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Runs that completed.
    pub runs_completed: u64,
    /// Runs that failed after all attempts.
    pub runs_failed: u64,
    /// Changed records read from the feed.
    pub records_fetched: u64,
    /// Records saved or deleted remotely.
    pub records_pushed: u64,
    /// Conflicts handed to the resolver.
    pub conflicts_resolved: u64,
    /// Whole-run retries.
    pub retries: u64,
    /// Completion time of the last successful run.
    pub last_sync_time: Option<Instant>,
    /// Error of the last failed run.
    pub last_error: Option<String>,
}

/// Everything the engine works on, shared with the rest of the session.
#[derive(Clone)]
pub struct EngineParts {
    /// Shadow schema.
    pub schema: Arc<ShadowSchema>,
    /// Local backing store.
    pub backing: Arc<dyn BackingStore>,
    /// Cursor and bootstrap flags.
    pub sync_state: Arc<dyn SyncStateStore>,
    /// Remote zone service.
    pub remote: Arc<dyn RemoteZoneService>,
    /// Edge resolution.
    pub relationships: Arc<RelationshipResolver>,
    /// Shadow to remote record mapping.
    pub mapper: Arc<RecordMapper>,
    /// Serializes backing-store writes with the change tracker.
    pub write_lock: Arc<Mutex<()>>,
}

/// Changes read from the feed in one run.
#[derive(Debug, Default)]
struct FetchedChanges {
    changed: BTreeMap<RecordId, RemoteRecord>,
    deleted: BTreeSet<RecordId>,
    token: Option<ChangeToken>,
    full_resync: bool,
}

enum Staged {
    Insert,
    Update,
}

/// Feed position followed from the fetch token through the run's own
/// writes.
///
/// Each write batch reports the positions around it. While every batch
/// starts where the previous one ended, nothing but this run's writes lies
/// beyond the fetch token and the cursor may skip over them. The first gap
/// pins the cursor to the fetch token.
#[derive(Debug)]
struct FeedPosition {
    fetched: Option<ChangeToken>,
    latest: Option<ChangeToken>,
}

impl FeedPosition {
    fn new(fetched: Option<ChangeToken>) -> Self {
        Self {
            latest: fetched.clone(),
            fetched,
        }
    }

    fn follow<T>(&mut self, response: &WriteResponse<T>) {
        match &self.latest {
            Some(token) if response.follows(token) => {
                self.latest = Some(response.new_token.clone());
            }
            Some(_) => {
                tracing::debug!("zone changed between writes; keeping the fetch token");
                self.latest = None;
            }
            None => {}
        }
    }

    fn cursor(self) -> Option<ChangeToken> {
        self.latest.or(self.fetched)
    }
}

/// A shadow record waiting for the Apply-Remote commit.
struct StagedShadow {
    id: BackingId,
    shadow: ShadowRecord,
    references: Option<BTreeMap<String, Reference>>,
    op: Staged,
}

/// Runs sync cycles for one store session.
///
/// A run walks through the phases in order and stops at the first
/// unrecoverable error. Per-record problems are collected in the
/// [`SyncReport`] instead. The cursor is stored only when a run completes
/// and every remote change was applied.
pub struct SyncEngine {
    parts: EngineParts,
    resolver: ConflictResolver,
    bootstrap: CloudBootstrap,
    zone: String,
    fetch_limit: u32,
    push_batch_size: usize,
    retry: RetryConfig,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    last_report: RwLock<Option<SyncReport>>,
}

impl SyncEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] if the options are inconsistent.
    pub fn new(parts: EngineParts, options: &StoreOptions) -> SyncResult<Self> {
        options.validate().map_err(SyncError::Configuration)?;
        let resolver = ConflictResolver::new(options.conflict_policy, options.resolver.clone())?;
        let bootstrap = CloudBootstrap::new(
            parts.remote.clone(),
            parts.sync_state.clone(),
            options.zone_name.clone(),
            options.subscription_id.clone(),
        );
        Ok(Self {
            parts,
            resolver,
            bootstrap,
            zone: options.zone_name.clone(),
            fetch_limit: options.fetch_limit,
            push_batch_size: options.push_batch_size,
            retry: options.retry.clone(),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            last_report: RwLock::new(None),
        })
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the cumulative stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Report of the last successful run.
    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().clone()
    }

    /// Zone this engine syncs with.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Runs a sync, repeating it on retryable failures.
    pub fn run(&self) -> SyncResult<SyncReport> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                std::thread::sleep(self.retry.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
            }

            match self.run_once() {
                Ok(mut report) => {
                    report.attempts = attempt + 1;
                    *self.last_report.write() = Some(report.clone());
                    return Ok(report);
                }
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    tracing::warn!(attempt, error = %e, "sync run failed; retrying");
                    attempt += 1;
                }
                Err(e) => {
                    let mut stats = self.stats.write();
                    stats.runs_failed += 1;
                    stats.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// Runs a single sync attempt.
    pub fn run_once(&self) -> SyncResult<SyncReport> {
        let span = tracing::info_span!("sync_run", zone = %self.zone);
        let _entered = span.enter();
        let start = Instant::now();

        match self.cycle() {
            Ok(mut report) => {
                report.duration = start.elapsed();
                self.set_state(SyncState::Synced);
                {
                    let mut stats = self.stats.write();
                    stats.runs_completed += 1;
                    stats.records_fetched += report.fetched as u64;
                    stats.records_pushed += report.pushed() as u64;
                    stats.conflicts_resolved += report.conflicts as u64;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                tracing::info!(
                    fetched = report.fetched,
                    applied = report.applied,
                    removed = report.removed,
                    conflicts = report.conflicts,
                    pushed = report.pushed(),
                    failures = report.failures.len(),
                    "sync run complete"
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(SyncState::Error);
                tracing::warn!(error = %e, "sync run failed");
                Err(e)
            }
        }
    }

    fn cycle(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();

        self.set_state(SyncState::Bootstrapping);
        self.bootstrap.ensure()?;

        self.set_state(SyncState::Fetching);
        let changes = self.fetch_all()?;
        report.fetched = changes.changed.len();
        report.remote_deletions = changes.deleted.len();
        report.full_resync = changes.full_resync;

        self.set_state(SyncState::ApplyingRemote);
        self.apply_remote(&changes, &mut report)?;
        let applied_cleanly = report.is_clean();

        self.set_state(SyncState::Pushing);
        let mut position = FeedPosition::new(changes.token);
        self.push_local(&mut position, &mut report)?;

        self.set_state(SyncState::Committing);
        if applied_cleanly {
            self.parts.sync_state.set_cursor(position.cursor())?;
            report.cursor_advanced = true;
        } else {
            tracing::warn!("remote changes not fully applied; cursor kept");
        }
        Ok(report)
    }

    // ---- Fetch ----

    fn fetch_all(&self) -> SyncResult<FetchedChanges> {
        let cursor = self.parts.sync_state.load()?.cursor;
        let mut full_resync = cursor.is_none();

        let fetched = match self.fetch_from(cursor) {
            Err(RemoteError::ChangeTokenExpired) if !full_resync => {
                tracing::warn!("change token expired; reading the whole zone");
                self.parts.sync_state.set_cursor(None)?;
                full_resync = true;
                self.fetch_from(None)
            }
            other => other,
        };

        match fetched {
            Ok(mut changes) => {
                changes.full_resync = full_resync;
                Ok(changes)
            }
            Err(RemoteError::ZoneNotFound(zone)) => {
                // The zone is gone: bootstrap again and read from scratch.
                match self.bootstrap.forget_zone() {
                    Ok(()) => Err(SyncError::fetch_fatal(format!("zone not found: {zone}"))),
                    Err(e) => Err(SyncError::fetch_fatal(format!(
                        "zone not found: {zone}; sync state not reset: {e}"
                    ))),
                }
            }
            Err(e) => Err(Self::fetch_error(e)),
        }
    }

    fn fetch_from(&self, cursor: Option<ChangeToken>) -> Result<FetchedChanges, RemoteError> {
        let mut changes = FetchedChanges {
            token: cursor,
            ..FetchedChanges::default()
        };

        loop {
            let request =
                FetchChangesRequest::new(self.zone.clone(), changes.token.clone(), self.fetch_limit);
            let response = self.parts.remote.fetch_changes(&request)?;

            tracing::debug!(
                changed = response.changed.len(),
                deleted = response.deleted.len(),
                more_coming = response.more_coming,
                "fetched page"
            );

            for record in response.changed {
                changes.deleted.remove(&record.record_id);
                changes.changed.insert(record.record_id.clone(), record);
            }
            for record_id in response.deleted {
                changes.changed.remove(&record_id);
                changes.deleted.insert(record_id);
            }
            changes.token = Some(response.new_token);

            if !response.more_coming {
                return Ok(changes);
            }
        }
    }

    fn fetch_error(error: RemoteError) -> SyncError {
        match error {
            RemoteError::ChangeTokenExpired => SyncError::ChangeTokenExpired,
            RemoteError::ZoneNotFound(zone) => SyncError::fetch_fatal(format!("zone not found: {zone}")),
            RemoteError::Unavailable(message) => SyncError::fetch_retryable(message),
            RemoteError::Rejected(message) => SyncError::fetch_fatal(message),
        }
    }

    // ---- Apply-Remote ----

    fn apply_remote(&self, changes: &FetchedChanges, report: &mut SyncReport) -> SyncResult<()> {
        let _guard = self.parts.write_lock.lock();
        let mut staged = Vec::new();
        let mut removals = BTreeSet::new();

        for remote in changes.changed.values() {
            if let Err(e) = self.merge_changed(remote, &mut staged, report) {
                report.fail(&remote.record_id, SyncPhase::ApplyRemote, e.to_string());
            }
        }

        for record_id in &changes.deleted {
            if let Err(e) = self.merge_deleted(record_id, &mut staged, &mut removals, report) {
                report.fail(record_id, SyncPhase::ApplyRemote, e.to_string());
            }
        }

        if changes.full_resync {
            let stale = self.parts.backing.query(
                &ShadowQuery::all().with_predicate(Predicate::ChangeType(ChangeType::NoChange)),
            )?;
            for (id, shadow) in stale {
                if !changes.changed.contains_key(&shadow.record_id) {
                    tracing::debug!(record_id = %shadow.record_id, "absent remotely; removing");
                    removals.insert(id);
                }
            }
        }

        let pending: PendingIds = staged
            .iter()
            .map(|s| (s.shadow.record_id.clone(), (s.id, s.shadow.entity.clone())))
            .collect();

        let mut batch = WriteBatch::new();
        for StagedShadow {
            id,
            mut shadow,
            references,
            op,
        } in staged
        {
            if let Some(references) = references {
                let field_map = self.parts.schema.field_map(&shadow.entity)?;
                let unresolved = self.parts.relationships.apply_references(
                    field_map,
                    &references,
                    &mut shadow,
                    &pending,
                )?;
                if !unresolved.is_empty() {
                    tracing::debug!(
                        record_id = %shadow.record_id,
                        unresolved = unresolved.len(),
                        "references to unknown records left out"
                    );
                }
            }
            match op {
                Staged::Insert => batch.insert(id, shadow),
                Staged::Update => batch.update(id, shadow),
            }
        }
        report.removed = removals.len();
        for id in removals {
            batch.delete(id);
        }

        if !batch.is_empty() {
            self.parts.backing.commit(batch)?;
        }
        Ok(())
    }

    fn merge_changed(
        &self,
        remote: &RemoteRecord,
        staged: &mut Vec<StagedShadow>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let Some((id, shadow)) = self.parts.backing.find_by_record_id(&remote.record_id)? else {
            let id = self.parts.backing.allocate_id()?;
            let mut shadow = ShadowRecord::new(remote.entity.clone(), remote.record_id.clone());
            self.overwrite_from_remote(&mut shadow, remote)?;
            staged.push(StagedShadow {
                id,
                shadow,
                references: Some(remote.references.clone()),
                op: Staged::Insert,
            });
            report.applied += 1;
            return Ok(());
        };

        if shadow.change_type == ChangeType::NoChange {
            if self.parts.mapper.is_current(&shadow, remote)? {
                return Ok(());
            }
            let mut shadow = shadow;
            self.overwrite_from_remote(&mut shadow, remote)?;
            staged.push(StagedShadow {
                id,
                shadow,
                references: Some(remote.references.clone()),
                op: Staged::Update,
            });
            report.applied += 1;
            return Ok(());
        }

        // The feed echoes our own last save; the pending change applies on top of it.
        let known = shadow.system_fields()?.version;
        if known.is_some() && known == remote.system.version {
            return Ok(());
        }

        let local = self.parts.mapper.to_remote(&shadow)?;
        let conflict = Conflict::new(local, shadow.change_type, Some(remote.clone()));
        report.conflicts += 1;
        let resolution = self.resolver.resolve(&conflict)?;
        let mut shadow = shadow;

        match resolution {
            Resolution::UseLocal => {
                // Local state stands; the next save must carry the new version.
                let mut system = shadow.system_fields()?;
                system.version = remote.system.version.clone();
                system.modified_at = remote.system.modified_at;
                shadow.set_system_fields(&system)?;
                staged.push(StagedShadow {
                    id,
                    shadow,
                    references: None,
                    op: Staged::Update,
                });
            }
            Resolution::UseRemote => {
                self.overwrite_from_remote(&mut shadow, remote)?;
                staged.push(StagedShadow {
                    id,
                    shadow,
                    references: Some(remote.references.clone()),
                    op: Staged::Update,
                });
                report.applied += 1;
            }
            Resolution::Merged(merged) => {
                self.write_merged(&mut shadow, &merged, remote)?;
                staged.push(StagedShadow {
                    id,
                    shadow,
                    references: Some(merged.references.clone()),
                    op: Staged::Update,
                });
            }
            Resolution::Fork(copy) => {
                self.overwrite_from_remote(&mut shadow, remote)?;
                staged.push(StagedShadow {
                    id,
                    shadow,
                    references: Some(remote.references.clone()),
                    op: Staged::Update,
                });
                staged.push(self.stage_fork(&copy)?);
                report.applied += 1;
                report.forks += 1;
            }
        }
        Ok(())
    }

    fn merge_deleted(
        &self,
        record_id: &RecordId,
        staged: &mut Vec<StagedShadow>,
        removals: &mut BTreeSet<BackingId>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let Some((id, mut shadow)) = self.parts.backing.find_by_record_id(record_id)? else {
            return Ok(());
        };

        match shadow.change_type {
            ChangeType::NoChange => {
                removals.insert(id);
            }
            ChangeType::Deleted => {}
            ChangeType::Updated => {
                let local = self.parts.mapper.to_remote(&shadow)?;
                let conflict = Conflict::new(local, ChangeType::Updated, None);
                report.conflicts += 1;

                match self.resolver.resolve(&conflict)? {
                    Resolution::UseRemote => {
                        removals.insert(id);
                    }
                    Resolution::UseLocal => {
                        // Pushed again as a new remote record.
                        let mut system = shadow.system_fields()?;
                        system.version = None;
                        system.modified_at = None;
                        shadow.set_system_fields(&system)?;
                        staged.push(StagedShadow {
                            id,
                            shadow,
                            references: None,
                            op: Staged::Update,
                        });
                    }
                    Resolution::Merged(merged) => {
                        let mut gone = RemoteRecord::new(record_id.clone(), merged.entity.clone());
                        gone.system = SystemFields::default();
                        self.write_merged(&mut shadow, &merged, &gone)?;
                        staged.push(StagedShadow {
                            id,
                            shadow,
                            references: Some(merged.references.clone()),
                            op: Staged::Update,
                        });
                    }
                    Resolution::Fork(copy) => {
                        removals.insert(id);
                        staged.push(self.stage_fork(&copy)?);
                        report.forks += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Makes a shadow hold exactly the remote state, synced. Edges are
    /// left to the caller.
    fn overwrite_from_remote(&self, shadow: &mut ShadowRecord, remote: &RemoteRecord) -> SyncResult<()> {
        self.parts.mapper.apply_fields(remote, shadow)?;
        shadow.set_system_fields(&SystemFields {
            version: remote.system.version.clone(),
            modified_at: remote.system.modified_at,
            local_modified_at: None,
        })?;
        shadow.change_type = ChangeType::NoChange;
        Ok(())
    }

    /// Writes a merged record as a pending local change based on the
    /// server's current version.
    fn write_merged(
        &self,
        shadow: &mut ShadowRecord,
        merged: &RemoteRecord,
        server: &RemoteRecord,
    ) -> SyncResult<()> {
        let local_modified_at = shadow.system_fields()?.local_modified_at;
        self.parts.mapper.apply_fields(merged, shadow)?;
        shadow.set_system_fields(&SystemFields {
            version: server.system.version.clone(),
            modified_at: server.system.modified_at,
            local_modified_at,
        })?;
        shadow.change_type = ChangeType::Updated;
        Ok(())
    }

    fn stage_fork(&self, copy: &RemoteRecord) -> SyncResult<StagedShadow> {
        let id = self.parts.backing.allocate_id()?;
        let mut shadow = ShadowRecord::new(copy.entity.clone(), copy.record_id.clone());
        self.parts.mapper.apply_fields(copy, &mut shadow)?;
        shadow.set_system_fields(&copy.system)?;
        shadow.change_type = ChangeType::Updated;
        tracing::info!(record_id = %copy.record_id, "forked local copy");
        Ok(StagedShadow {
            id,
            shadow,
            references: Some(copy.references.clone()),
            op: Staged::Insert,
        })
    }

    // ---- Push-Local and Commit ----

    fn push_local(&self, position: &mut FeedPosition, report: &mut SyncReport) -> SyncResult<()> {
        let pending = self.parts.backing.query(
            &ShadowQuery::all().with_predicate(Predicate::NotChangeType(ChangeType::NoChange)),
        )?;
        if pending.is_empty() {
            return Ok(());
        }

        let batch_size = self
            .push_batch_size
            .min(self.parts.remote.max_batch_size())
            .max(1);
        let (deletions, saves): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .map(|(_, shadow)| shadow)
            .partition(|shadow| shadow.change_type == ChangeType::Deleted);

        tracing::debug!(
            saves = saves.len(),
            deletions = deletions.len(),
            batch_size,
            "pushing local changes"
        );

        for chunk in saves.chunks(batch_size) {
            self.push_saves(chunk, position, report)?;
        }
        for chunk in deletions.chunks(batch_size) {
            self.push_deletes(chunk, position, report)?;
        }
        Ok(())
    }

    fn push_saves(
        &self,
        chunk: &[ShadowRecord],
        position: &mut FeedPosition,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let mut records = Vec::with_capacity(chunk.len());
        for shadow in chunk {
            match self.parts.mapper.to_remote(shadow) {
                Ok(record) => records.push(record),
                Err(e) => report.fail(&shadow.record_id, SyncPhase::Push, e.to_string()),
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        let retries = self.send_saves(records, position, report, true)?;
        if !retries.is_empty() {
            self.send_saves(retries, position, report, false)?;
        }
        Ok(())
    }

    /// Sends one save batch and commits its outcomes. Returns the records
    /// to send again after conflict resolution.
    fn send_saves(
        &self,
        records: Vec<RemoteRecord>,
        position: &mut FeedPosition,
        report: &mut SyncReport,
        first_attempt: bool,
    ) -> SyncResult<Vec<RemoteRecord>> {
        let sent: HashMap<RecordId, RemoteRecord> = records
            .iter()
            .map(|record| (record.record_id.clone(), record.clone()))
            .collect();
        let response = self.parts.remote.save_records(&self.zone, records)?;
        position.follow(&response);

        let _guard = self.parts.write_lock.lock();
        let mut batch = WriteBatch::new();
        let mut retries = Vec::new();
        let mut forks = Vec::new();

        for outcome in response.outcomes {
            let Some(record) = sent.get(&outcome.record_id) else {
                tracing::warn!(record_id = %outcome.record_id, "outcome for a record not sent");
                continue;
            };
            match outcome.result {
                SaveResult::Saved(server) => {
                    if let Err(e) = self.stage_saved(record, &server, &mut batch) {
                        report.fail(&outcome.record_id, SyncPhase::Commit, e.to_string());
                        continue;
                    }
                    report.saved += 1;
                    if !first_attempt {
                        report.retried += 1;
                    }
                }
                SaveResult::VersionConflict { server } if first_attempt => {
                    match self.resolve_push_conflict(&server, &mut batch, &mut forks, report) {
                        Ok(Some(retry)) => retries.push(retry),
                        Ok(None) => {}
                        Err(e) => report.fail(&outcome.record_id, SyncPhase::Push, e.to_string()),
                    }
                }
                SaveResult::VersionConflict { .. } => report.fail(
                    &outcome.record_id,
                    SyncPhase::Push,
                    "version conflict persisted after retry",
                ),
                SaveResult::Failed(message) => {
                    report.fail(&outcome.record_id, SyncPhase::Push, message);
                }
            }
        }

        for fork in forks {
            let mut fork_shadow = fork.shadow;
            if let Some(references) = fork.references {
                let field_map = self.parts.schema.field_map(&fork_shadow.entity)?;
                self.parts.relationships.apply_references(
                    field_map,
                    &references,
                    &mut fork_shadow,
                    &PendingIds::new(),
                )?;
            }
            retries.push(self.parts.mapper.to_remote(&fork_shadow)?);
            batch.insert(fork.id, fork_shadow);
        }

        if !batch.is_empty() {
            self.parts.backing.commit(batch)?;
        }
        Ok(retries)
    }

    /// Marks a saved record as synced, unless it changed while in flight.
    fn stage_saved(
        &self,
        sent: &RemoteRecord,
        server: &RemoteRecord,
        batch: &mut WriteBatch,
    ) -> SyncResult<()> {
        let Some((id, mut shadow)) = self.parts.backing.find_by_record_id(&sent.record_id)? else {
            return Ok(());
        };

        let mut system = shadow.system_fields()?;
        system.version = server.system.version.clone();
        system.modified_at = server.system.modified_at;

        if shadow.change_type == ChangeType::Updated
            && self.parts.mapper.to_remote(&shadow)?.same_content(sent)
        {
            shadow.change_type = ChangeType::NoChange;
        }
        shadow.set_system_fields(&system)?;
        batch.update(id, shadow);
        Ok(())
    }

    /// Resolves a rejected save. Returns the record to send again, if any.
    fn resolve_push_conflict(
        &self,
        server: &RemoteRecord,
        batch: &mut WriteBatch,
        forks: &mut Vec<StagedShadow>,
        report: &mut SyncReport,
    ) -> SyncResult<Option<RemoteRecord>> {
        let Some((id, mut shadow)) = self.parts.backing.find_by_record_id(&server.record_id)?
        else {
            return Ok(None);
        };
        let local = self.parts.mapper.to_remote(&shadow)?;
        let conflict = Conflict::new(local.clone(), shadow.change_type, Some(server.clone()));
        report.conflicts += 1;

        match self.resolver.resolve(&conflict)? {
            Resolution::UseLocal => {
                let mut retry = local;
                retry.system.version = server.system.version.clone();
                Ok(Some(retry))
            }
            Resolution::UseRemote => {
                self.overwrite_with_edges(&mut shadow, server)?;
                batch.update(id, shadow);
                report.applied += 1;
                Ok(None)
            }
            Resolution::Merged(merged) => {
                self.write_merged(&mut shadow, &merged, server)?;
                let field_map = self.parts.schema.field_map(&shadow.entity)?;
                self.parts.relationships.apply_references(
                    field_map,
                    &merged.references,
                    &mut shadow,
                    &PendingIds::new(),
                )?;
                let mut retry = merged;
                retry.system.version = server.system.version.clone();
                batch.update(id, shadow);
                Ok(Some(retry))
            }
            Resolution::Fork(copy) => {
                self.overwrite_with_edges(&mut shadow, server)?;
                batch.update(id, shadow);
                forks.push(self.stage_fork(&copy)?);
                report.applied += 1;
                report.forks += 1;
                Ok(None)
            }
        }
    }

    fn overwrite_with_edges(&self, shadow: &mut ShadowRecord, remote: &RemoteRecord) -> SyncResult<()> {
        self.overwrite_from_remote(shadow, remote)?;
        let field_map = self.parts.schema.field_map(&shadow.entity)?;
        self.parts.relationships.apply_references(
            field_map,
            &remote.references,
            shadow,
            &PendingIds::new(),
        )?;
        Ok(())
    }

    fn push_deletes(
        &self,
        chunk: &[ShadowRecord],
        position: &mut FeedPosition,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let ids: Vec<RecordId> = chunk.iter().map(|shadow| shadow.record_id.clone()).collect();
        let response = self.parts.remote.delete_records(&self.zone, ids)?;
        position.follow(&response);

        let _guard = self.parts.write_lock.lock();
        let mut batch = WriteBatch::new();
        for outcome in response.outcomes {
            match outcome.result {
                DeleteResult::Deleted => {
                    if let Some((id, shadow)) =
                        self.parts.backing.find_by_record_id(&outcome.record_id)?
                    {
                        if shadow.is_tombstone() {
                            batch.delete(id);
                        }
                    }
                    report.deleted += 1;
                }
                DeleteResult::Failed(message) => {
                    report.fail(&outcome.record_id, SyncPhase::Push, message);
                }
            }
        }
        if !batch.is_empty() {
            self.parts.backing.commit(batch)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("zone", &self.zone)
            .field("state", &self.state())
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ManagedObject;
    use crate::testing::Fixture;
    use crate::remote::RemoteResult;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};
    use zonesync_protocol::{
        ConflictPolicy, DeleteRecordsResponse, FetchChangesResponse, SaveRecordsResponse, Value,
        VersionTag,
    };
    use zonesync_server::ZoneServer;
    use zonesync_storage::{
        Edge, InMemoryBackingStore, MemoryStateStore, StorageError, StorageResult,
        SyncStateSnapshot,
    };

    const ZONE: &str = "notes";

    fn options(policy: ConflictPolicy) -> StoreOptions {
        StoreOptions::new()
            .with_zone_name(ZONE)
            .with_conflict_policy(policy)
            .with_retry(RetryConfig::no_retry())
    }

    fn engine(fixture: &Fixture, server: &Arc<ZoneServer>, options: StoreOptions) -> SyncEngine {
        SyncEngine::new(fixture.engine_parts(server.clone()), &options).unwrap()
    }

    fn remote_note(id: &str, title: &str) -> RemoteRecord {
        RemoteRecord::new(RecordId::from(id), "Note").with_field("title", title)
    }

    fn saved(server: &ZoneServer, record: RemoteRecord) -> RemoteRecord {
        server.ensure_zone(ZONE).unwrap();
        let response = server.save_records(ZONE, vec![record]).unwrap();
        let SaveResult::Saved(saved) = response.outcomes[0].result.clone() else {
            unreachable!("seeding save is accepted");
        };
        saved
    }

    fn edit_remotely(server: &ZoneServer, id: &str, title: &str) {
        let mut record = server.record(ZONE, &RecordId::from(id)).unwrap();
        record.fields.insert("title".into(), Value::from(title));
        saved(server, record);
    }

    fn stored_cursor(fixture: &Fixture) -> Option<ChangeToken> {
        fixture.sync_state.load().unwrap().cursor
    }

    /// Lands a write from another client right before each save batch.
    struct Interleaved {
        server: Arc<ZoneServer>,
        foreign: Mutex<Vec<RemoteRecord>>,
    }

    impl RemoteZoneService for Interleaved {
        fn ensure_zone(&self, zone: &str) -> RemoteResult<()> {
            RemoteZoneService::ensure_zone(self.server.as_ref(), zone)
        }

        fn ensure_subscription(&self, zone: &str, subscription_id: &str) -> RemoteResult<()> {
            RemoteZoneService::ensure_subscription(self.server.as_ref(), zone, subscription_id)
        }

        fn fetch_changes(
            &self,
            request: &FetchChangesRequest,
        ) -> RemoteResult<FetchChangesResponse> {
            RemoteZoneService::fetch_changes(self.server.as_ref(), request)
        }

        fn save_records(
            &self,
            zone: &str,
            records: Vec<RemoteRecord>,
        ) -> RemoteResult<SaveRecordsResponse> {
            if let Some(record) = self.foreign.lock().pop() {
                saved(&self.server, record);
            }
            RemoteZoneService::save_records(self.server.as_ref(), zone, records)
        }

        fn delete_records(
            &self,
            zone: &str,
            record_ids: Vec<RecordId>,
        ) -> RemoteResult<DeleteRecordsResponse> {
            RemoteZoneService::delete_records(self.server.as_ref(), zone, record_ids)
        }

        fn max_batch_size(&self) -> usize {
            self.server.max_batch_size()
        }
    }

    /// Sync state whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyState {
        inner: MemoryStateStore,
        failing: AtomicBool,
    }

    impl SyncStateStore for FlakyState {
        fn load(&self) -> StorageResult<SyncStateSnapshot> {
            self.inner.load()
        }

        fn save(&self, state: &SyncStateSnapshot) -> StorageResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::CommitFailed("state write refused".into()));
            }
            self.inner.save(state)
        }
    }

    /// Records the engine state at every local commit.
    struct Watched {
        inner: Arc<InMemoryBackingStore>,
        engine: OnceLock<Weak<SyncEngine>>,
        seen: Mutex<Vec<SyncState>>,
    }

    impl BackingStore for Watched {
        fn allocate_id(&self) -> StorageResult<BackingId> {
            self.inner.allocate_id()
        }

        fn get(&self, id: BackingId) -> StorageResult<Option<ShadowRecord>> {
            self.inner.get(id)
        }

        fn find_by_record_id(
            &self,
            record_id: &RecordId,
        ) -> StorageResult<Option<(BackingId, ShadowRecord)>> {
            self.inner.find_by_record_id(record_id)
        }

        fn query(&self, query: &ShadowQuery) -> StorageResult<Vec<(BackingId, ShadowRecord)>> {
            self.inner.query(query)
        }

        fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                self.seen.lock().push(engine.state());
            }
            self.inner.commit(batch)
        }

        fn count(&self) -> StorageResult<usize> {
            self.inner.count()
        }
    }

    #[test]
    fn first_run_pushes_local_inserts() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));

        let note = fixture.note("hello");
        fixture.tracker.on_insert(&note).unwrap();

        let report = engine.run().unwrap();
        assert_eq!(report.saved, 1);
        assert!(report.is_clean());
        assert!(report.cursor_advanced);
        assert_eq!(engine.state(), SyncState::Synced);

        let shadow = fixture.shadow_of(&note.id);
        assert_eq!(shadow.change_type, ChangeType::NoChange);
        let record_id = note.id.record_id().unwrap();
        let remote = server.record(ZONE, record_id).unwrap();
        assert_eq!(remote.field("title"), Some(&Value::from("hello")));
        assert_eq!(shadow.system_fields().unwrap().version, remote.system.version);
    }

    #[test]
    fn remote_records_are_applied_with_edges() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(
            &server,
            remote_note("n1", "child").with_reference("folder", Reference::One(Some(RecordId::from("f1")))),
        );
        saved(
            &server,
            RemoteRecord::new(RecordId::from("f1"), "Folder").with_field("name", "inbox"),
        );
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));

        let report = engine.run().unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.pushed(), 0);

        let (folder_id, _) = fixture.find("f1");
        let (_, note) = fixture.find("n1");
        assert_eq!(note.change_type, ChangeType::NoChange);
        assert_eq!(note.relationships.get("folder"), Some(&Edge::One(Some(folder_id))));
    }

    #[test]
    fn second_run_is_idle() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "remote"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        fixture.tracker.on_insert(&fixture.note("local")).unwrap();

        engine.run().unwrap();
        let before = server.counters();
        let report = engine.run().unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.pushed(), 0);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.applied, 0);
        assert_eq!(server.counters().save_batches, before.save_batches);
        assert_eq!(server.counters().fetches, before.fetches + 1);
        assert_eq!(stored_cursor(&fixture), Some(server.current_token(ZONE).unwrap()));
    }

    #[test]
    fn run_after_pushing_fetches_nothing() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        fixture.tracker.on_insert(&fixture.note("only")).unwrap();

        assert_eq!(engine.run().unwrap().saved, 1);
        let report = engine.run().unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.pushed(), 0);
    }

    #[test]
    fn local_and_remote_changes_settle_at_the_latest_token() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("a", "a"));
        saved(&server, remote_note("b", "b"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        engine.run().unwrap();

        let local = ManagedObject::new(fixture.object_id("a")).with_attribute("title", "a2");
        fixture.tracker.on_update(&local).unwrap();
        edit_remotely(&server, "b", "b2");

        let report = engine.run().unwrap();
        assert_eq!(report.saved, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(fixture.find("b").1.attribute("title"), &Value::from("b2"));
        assert_eq!(stored_cursor(&fixture), Some(server.current_token(ZONE).unwrap()));
    }

    #[test]
    fn foreign_write_during_push_keeps_the_fetch_token() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        server.ensure_zone(ZONE).unwrap();
        let remote = Arc::new(Interleaved {
            server: server.clone(),
            foreign: Mutex::new(vec![remote_note("other", "from elsewhere")]),
        });
        let engine = SyncEngine::new(
            fixture.engine_parts_with(remote),
            &options(ConflictPolicy::ServerWins),
        )
        .unwrap();
        fixture.tracker.on_insert(&fixture.note("mine")).unwrap();

        let report = engine.run().unwrap();
        assert_eq!(report.saved, 1);
        assert_ne!(stored_cursor(&fixture), Some(server.current_token(ZONE).unwrap()));

        // The foreign record arrives next; the own save reads back as current.
        let report = engine.run().unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts, 0);
        assert!(fixture.backing.find_by_record_id(&RecordId::from("other")).unwrap().is_some());
        assert_eq!(stored_cursor(&fixture), Some(server.current_token(ZONE).unwrap()));
    }

    #[test]
    fn pending_edit_read_back_unchanged_is_not_a_conflict() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        let note = fixture.note("draft");
        fixture.tracker.on_insert(&note).unwrap();
        engine.run().unwrap();

        // Reading the zone again returns the save above.
        fixture.sync_state.set_cursor(None).unwrap();
        let edit = ManagedObject::new(note.id.clone()).with_attribute("title", "final");
        fixture.tracker.on_update(&edit).unwrap();

        let report = engine.run().unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.saved, 1);
        let remote = server.record(ZONE, note.id.record_id().unwrap()).unwrap();
        assert_eq!(remote.field("title"), Some(&Value::from("final")));
    }

    #[test]
    fn server_wins_overwrites_local_edit() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "original"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        engine.run().unwrap();

        let local = ManagedObject::new(fixture.object_id("n1")).with_attribute("title", "mine");
        fixture.tracker.on_update(&local).unwrap();
        edit_remotely(&server, "n1", "theirs");

        let report = engine.run().unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.pushed(), 0);
        let (_, shadow) = fixture.find("n1");
        assert_eq!(shadow.change_type, ChangeType::NoChange);
        assert_eq!(shadow.attribute("title"), &Value::from("theirs"));
    }

    #[test]
    fn client_wins_pushes_over_remote_edit() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "original"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ClientWins));
        engine.run().unwrap();

        let local = ManagedObject::new(fixture.object_id("n1")).with_attribute("title", "mine");
        fixture.tracker.on_update(&local).unwrap();
        edit_remotely(&server, "n1", "theirs");

        let report = engine.run().unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.saved, 1);
        let remote = server.record(ZONE, &RecordId::from("n1")).unwrap();
        assert_eq!(remote.field("title"), Some(&Value::from("mine")));
        assert_eq!(fixture.find("n1").1.change_type, ChangeType::NoChange);
    }

    #[test]
    fn stale_save_is_resolved_and_retried_once() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "original"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ClientWins));
        engine.run().unwrap();

        // The shadow carries an outdated version tag, so the save is rejected.
        let (id, mut shadow) = fixture.find("n1");
        let mut system = shadow.system_fields().unwrap();
        system.version = Some(VersionTag::new("v0"));
        shadow.set_system_fields(&system).unwrap();
        shadow.change_type = ChangeType::Updated;
        shadow.attributes.insert("title".into(), Value::from("mine"));
        fixture.overwrite(id, shadow);

        let report = engine.run().unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.retried, 1);
        assert!(report.is_clean());
        let remote = server.record(ZONE, &RecordId::from("n1")).unwrap();
        assert_eq!(remote.field("title"), Some(&Value::from("mine")));
    }

    #[test]
    fn keep_both_forks_on_update_conflict() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "original"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::KeepBoth));
        engine.run().unwrap();

        let local = ManagedObject::new(fixture.object_id("n1")).with_attribute("title", "mine");
        fixture.tracker.on_update(&local).unwrap();
        edit_remotely(&server, "n1", "theirs");

        let report = engine.run().unwrap();
        assert_eq!(report.forks, 1);
        assert_eq!(report.saved, 1);

        let records = server.records(ZONE);
        assert_eq!(records.len(), 2);
        let titles: BTreeSet<String> = records
            .iter()
            .filter_map(|r| r.field("title").and_then(|v| v.as_text()).map(String::from))
            .collect();
        assert_eq!(titles, BTreeSet::from(["mine".to_string(), "theirs".to_string()]));
        assert!(fixture
            .backing
            .snapshot()
            .iter()
            .all(|(_, shadow)| shadow.change_type == ChangeType::NoChange));
    }

    #[test]
    fn tombstone_is_removed_after_push() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        let note = fixture.note("short lived");
        fixture.tracker.on_insert(&note).unwrap();
        engine.run().unwrap();

        fixture.tracker.on_delete(&note).unwrap();
        assert_eq!(fixture.shadow_of(&note.id).change_type, ChangeType::Deleted);

        let report = engine.run().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(fixture.identities.shadow_for(&note.id).unwrap().is_none());
        assert!(server.record(ZONE, note.id.record_id().unwrap()).is_none());
    }

    #[test]
    fn failed_push_keeps_tombstone() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        let note = fixture.note("sticky");
        fixture.tracker.on_insert(&note).unwrap();
        engine.run().unwrap();
        fixture.tracker.on_delete(&note).unwrap();

        server.set_unavailable(true);
        assert!(engine.run().is_err());
        assert_eq!(engine.state(), SyncState::Error);
        assert_eq!(fixture.shadow_of(&note.id).change_type, ChangeType::Deleted);

        server.set_unavailable(false);
        engine.run().unwrap();
        assert!(fixture.identities.shadow_for(&note.id).unwrap().is_none());
    }

    #[test]
    fn remote_delete_removes_synced_shadow() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "doomed"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        engine.run().unwrap();

        server.delete_records(ZONE, vec![RecordId::from("n1")]).unwrap();
        let report = engine.run().unwrap();
        assert_eq!(report.removed, 1);
        assert!(fixture
            .backing
            .find_by_record_id(&RecordId::from("n1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn remote_delete_of_edited_record_keeps_local_under_client_wins() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "original"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ClientWins));
        engine.run().unwrap();

        let local = ManagedObject::new(fixture.object_id("n1")).with_attribute("title", "keep");
        fixture.tracker.on_update(&local).unwrap();
        server.delete_records(ZONE, vec![RecordId::from("n1")]).unwrap();

        let report = engine.run().unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.saved, 1);
        let remote = server.record(ZONE, &RecordId::from("n1")).unwrap();
        assert_eq!(remote.field("title"), Some(&Value::from("keep")));
    }

    #[test]
    fn expired_token_triggers_full_resync() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "kept"));
        saved(&server, remote_note("n2", "vanishing"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        engine.run().unwrap();

        // n2 disappears without the engine seeing the deletion in the feed.
        server.delete_records(ZONE, vec![RecordId::from("n2")]).unwrap();
        server.expire_tokens(ZONE).unwrap();

        let report = engine.run().unwrap();
        assert!(report.full_resync);
        assert_eq!(report.removed, 1);
        assert!(fixture.backing.find_by_record_id(&RecordId::from("n1")).unwrap().is_some());
        assert!(fixture.backing.find_by_record_id(&RecordId::from("n2")).unwrap().is_none());
    }

    #[test]
    fn paged_fetch_reads_every_page() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        for i in 0..7 {
            saved(&server, remote_note(&format!("n{i}"), "paged"));
        }
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins).with_fetch_limit(3));

        let report = engine.run().unwrap();
        assert_eq!(report.fetched, 7);
        assert!(server.counters().fetches >= 3);
        assert_eq!(fixture.backing.snapshot().len(), 7);
    }

    #[test]
    fn lost_zone_reset_failure_is_reported() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let state = Arc::new(FlakyState::default());
        let mut parts = fixture.engine_parts(server.clone());
        parts.sync_state = state.clone();
        let engine = SyncEngine::new(parts, &options(ConflictPolicy::ServerWins)).unwrap();
        engine.run().unwrap();

        server.delete_zone(ZONE);
        state.failing.store(true, Ordering::SeqCst);
        let err = engine.run().unwrap_err();
        assert!(err.to_string().contains("not reset"), "{err}");
        assert!(state.load().unwrap().zone_created);

        // Once the state can be written the zone is forgotten, then rebuilt.
        state.failing.store(false, Ordering::SeqCst);
        assert!(engine.run().is_err());
        let flags = state.load().unwrap();
        assert!(!flags.zone_created);
        assert!(flags.cursor.is_none());

        let report = engine.run().unwrap();
        assert!(report.full_resync);
        assert!(server.zone_exists(ZONE));
    }

    #[test]
    fn state_stays_pushing_across_batches() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let backing = Arc::new(Watched {
            inner: fixture.backing.clone(),
            engine: OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        let mut parts = fixture.engine_parts(server.clone());
        parts.backing = backing.clone();
        let engine = Arc::new(
            SyncEngine::new(parts, &options(ConflictPolicy::ServerWins).with_push_batch_size(2))
                .unwrap(),
        );
        let _ = backing.engine.set(Arc::downgrade(&engine));
        for i in 0..5 {
            fixture.tracker.on_insert(&fixture.note(&format!("note {i}"))).unwrap();
        }

        engine.run().unwrap();
        let seen = backing.seen.lock().clone();
        assert_eq!(seen, vec![SyncState::Pushing; 3]);
        assert_eq!(engine.state(), SyncState::Synced);
    }

    #[test]
    fn push_batches_respect_size() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins).with_push_batch_size(2));
        for i in 0..5 {
            fixture.tracker.on_insert(&fixture.note(&format!("note {i}"))).unwrap();
        }

        let report = engine.run().unwrap();
        assert_eq!(report.saved, 5);
        assert_eq!(server.counters().save_batches, 3);
    }

    #[test]
    fn failed_apply_commit_keeps_cursor_and_local_state() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        saved(&server, remote_note("n1", "remote"));
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));

        fixture.backing.fail_next_commits(1);
        assert!(engine.run().is_err());
        assert!(fixture.sync_state.load().unwrap().cursor.is_none());
        assert!(fixture.backing.snapshot().is_empty());

        engine.run().unwrap();
        assert_eq!(fixture.backing.snapshot().len(), 1);
    }

    #[test]
    fn per_record_failure_does_not_abort_batch() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        let good = fixture.note("good");
        let bad = fixture.note("bad");
        fixture.tracker.on_insert(&good).unwrap();
        fixture.tracker.on_insert(&bad).unwrap();
        server.fail_next_save_of(bad.id.record_id().unwrap().clone());

        let report = engine.run().unwrap();
        assert_eq!(report.saved, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(&report.failures[0].record_id, bad.id.record_id().unwrap());
        assert_eq!(fixture.shadow_of(&bad.id).change_type, ChangeType::Updated);
        assert_eq!(fixture.shadow_of(&good.id).change_type, ChangeType::NoChange);
    }

    #[test]
    fn retries_transient_failures() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .without_jitter();
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins).with_retry(retry));
        server.fail_next_fetches(1);

        let report = engine.run().unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(engine.stats().retries, 1);
        assert_eq!(engine.stats().runs_completed, 1);
    }

    #[test]
    fn stats_record_failures() {
        let fixture = Fixture::new();
        let server = Arc::new(ZoneServer::new());
        let engine = engine(&fixture, &server, options(ConflictPolicy::ServerWins));
        server.fail_next_zone_creations(1);

        let err = engine.run().unwrap_err();
        assert!(matches!(err, SyncError::Bootstrap { step: "zone", .. }));
        let stats = engine.stats();
        assert_eq!(stats.runs_failed, 1);
        assert!(stats.last_error.is_some());
    }
}
