//! The zone server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::token::TokenBody;
use crate::zone::Zone;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use zonesync_protocol::{
    ChangeToken, Clock, DeleteOutcome, DeleteRecordsResponse, FetchChangesRequest,
    FetchChangesResponse, RecordId, RemoteNotification, RemoteRecord, SaveOutcome,
    SaveRecordsResponse, SaveResult, SystemClock, WriteResponse,
};

/// Call counters, for asserting how much traffic a sync produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCounters {
    /// Change-feed fetches.
    pub fetches: u64,
    /// Save batches.
    pub save_batches: u64,
    /// Records accepted by saves.
    pub saved_records: u64,
    /// Save attempts rejected with a version conflict.
    pub version_conflicts: u64,
    /// Delete batches.
    pub delete_batches: u64,
    /// Records removed by deletes.
    pub deleted_records: u64,
    /// Zones created.
    pub zones_created: u64,
    /// Subscriptions created.
    pub subscriptions_created: u64,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_fetches: usize,
    failing_zone_creations: usize,
    failing_subscriptions: usize,
    failing_saves: BTreeSet<RecordId>,
}

/// In-memory remote zone service.
///
/// # Thread Safety
///
/// The server is thread-safe; several client stores can share one instance
/// behind an `Arc`.
pub struct ZoneServer {
    config: ServerConfig,
    clock: Arc<dyn Clock>,
    zones: RwLock<BTreeMap<String, Zone>>,
    subscriptions: RwLock<BTreeMap<String, String>>,
    outbox: Mutex<Vec<Vec<u8>>>,
    faults: Mutex<Faults>,
    counters: Mutex<ServerCounters>,
}

impl ZoneServer {
    /// Creates a server with the default configuration and the system clock.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a server with the given configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            zones: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(BTreeMap::new()),
            outbox: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            counters: Mutex::new(ServerCounters::default()),
        }
    }

    /// Replaces the clock used for modification timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Largest batch accepted by saves and deletes.
    pub fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    fn check_available(&self) -> ServerResult<()> {
        if self.faults.lock().unavailable {
            return Err(ServerError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn check_batch(&self, size: usize) -> ServerResult<()> {
        if size > self.config.max_batch_size {
            return Err(ServerError::BatchTooLarge {
                size,
                max: self.config.max_batch_size,
            });
        }
        Ok(())
    }

    /// Creates the zone if it does not exist.
    pub fn ensure_zone(&self, zone: &str) -> ServerResult<()> {
        self.check_available()?;
        {
            let mut faults = self.faults.lock();
            if faults.failing_zone_creations > 0 {
                faults.failing_zone_creations -= 1;
                return Err(ServerError::Unavailable("injected zone failure".into()));
            }
        }
        let mut zones = self.zones.write();
        if !zones.contains_key(zone) {
            zones.insert(zone.to_string(), Zone::default());
            self.counters.lock().zones_created += 1;
            tracing::debug!(zone, "zone created");
        }
        Ok(())
    }

    /// Creates a change subscription for the zone if it does not exist.
    pub fn ensure_subscription(&self, zone: &str, subscription_id: &str) -> ServerResult<()> {
        self.check_available()?;
        {
            let mut faults = self.faults.lock();
            if faults.failing_subscriptions > 0 {
                faults.failing_subscriptions -= 1;
                return Err(ServerError::Unavailable(
                    "injected subscription failure".into(),
                ));
            }
        }
        if !self.zones.read().contains_key(zone) {
            return Err(ServerError::ZoneNotFound(zone.to_string()));
        }
        let mut subscriptions = self.subscriptions.write();
        if subscriptions.get(subscription_id).map(String::as_str) != Some(zone) {
            subscriptions.insert(subscription_id.to_string(), zone.to_string());
            self.counters.lock().subscriptions_created += 1;
            tracing::debug!(zone, subscription_id, "subscription created");
        }
        Ok(())
    }

    /// Returns one page of the zone's change feed.
    pub fn fetch_changes(&self, request: &FetchChangesRequest) -> ServerResult<FetchChangesResponse> {
        self.check_available()?;
        {
            let mut faults = self.faults.lock();
            if faults.failing_fetches > 0 {
                faults.failing_fetches -= 1;
                return Err(ServerError::Unavailable("injected fetch failure".into()));
            }
        }
        self.counters.lock().fetches += 1;

        let zones = self.zones.read();
        let zone = zones
            .get(&request.zone)
            .ok_or_else(|| ServerError::ZoneNotFound(request.zone.clone()))?;

        let since = match &request.token {
            Some(token) => {
                let body = TokenBody::decode(token)?;
                if body.epoch != zone.epoch() || body.seq > zone.position().seq {
                    return Err(ServerError::ChangeTokenExpired);
                }
                body.seq
            }
            None => 0,
        };

        let limit = request.limit.clamp(1, self.config.max_fetch_limit.max(1)) as usize;
        let page = zone.changes_since(since, limit);
        let token = TokenBody {
            epoch: zone.epoch(),
            seq: page.position,
        }
        .encode()?;

        Ok(FetchChangesResponse::new(
            page.changed,
            page.deleted,
            token,
            page.more_coming,
        ))
    }

    /// Saves a batch of records.
    ///
    /// Each record is accepted only if its version tag matches the stored
    /// copy; otherwise the outcome carries the server's copy. The batch is
    /// applied under the zone lock, so nothing else lands between its
    /// previous and new tokens.
    pub fn save_records(
        &self,
        zone: &str,
        records: Vec<RemoteRecord>,
    ) -> ServerResult<SaveRecordsResponse> {
        self.check_available()?;
        self.check_batch(records.len())?;

        let now = self.clock.now_millis();
        let mut outcomes = Vec::with_capacity(records.len());
        let mut changed = false;
        let (previous_token, new_token) = {
            let mut zones = self.zones.write();
            let zone_state = zones
                .get_mut(zone)
                .ok_or_else(|| ServerError::ZoneNotFound(zone.to_string()))?;
            let previous_token = zone_state.position().encode()?;
            let mut faults = self.faults.lock();
            let mut counters = self.counters.lock();
            counters.save_batches += 1;

            for record in records {
                if faults.failing_saves.remove(&record.record_id) {
                    outcomes.push(SaveOutcome::failed(record.record_id, "injected save failure"));
                    continue;
                }
                let record_id = record.record_id.clone();
                match zone_state.save(record, now) {
                    SaveResult::Saved(saved) => {
                        counters.saved_records += 1;
                        changed = true;
                        outcomes.push(SaveOutcome::saved(saved));
                    }
                    SaveResult::VersionConflict { server } => {
                        counters.version_conflicts += 1;
                        outcomes.push(SaveOutcome::conflict(server));
                    }
                    SaveResult::Failed(message) => {
                        outcomes.push(SaveOutcome::failed(record_id, message));
                    }
                }
            }
            (previous_token, zone_state.position().encode()?)
        };

        if changed {
            self.notify(zone);
        }
        Ok(WriteResponse::new(outcomes, previous_token, new_token))
    }

    /// Deletes a batch of records. Unknown records count as deleted.
    pub fn delete_records(
        &self,
        zone: &str,
        record_ids: Vec<RecordId>,
    ) -> ServerResult<DeleteRecordsResponse> {
        self.check_available()?;
        self.check_batch(record_ids.len())?;

        let mut outcomes = Vec::with_capacity(record_ids.len());
        let mut changed = false;
        let (previous_token, new_token) = {
            let mut zones = self.zones.write();
            let zone_state = zones
                .get_mut(zone)
                .ok_or_else(|| ServerError::ZoneNotFound(zone.to_string()))?;
            let previous_token = zone_state.position().encode()?;
            let mut counters = self.counters.lock();
            counters.delete_batches += 1;

            for record_id in record_ids {
                if zone_state.record(&record_id).is_some() {
                    counters.deleted_records += 1;
                    changed = true;
                }
                zone_state.delete(&record_id);
                outcomes.push(DeleteOutcome::deleted(record_id));
            }
            (previous_token, zone_state.position().encode()?)
        };

        if changed {
            self.notify(zone);
        }
        Ok(WriteResponse::new(outcomes, previous_token, new_token))
    }

    fn notify(&self, zone: &str) {
        let subscriptions = self.subscriptions.read();
        let mut outbox = self.outbox.lock();
        for (subscription_id, subscribed_zone) in subscriptions.iter() {
            if subscribed_zone != zone {
                continue;
            }
            match RemoteNotification::record_zone(zone, subscription_id.as_str()).encode() {
                Ok(payload) => outbox.push(payload),
                Err(e) => tracing::warn!(zone, error = %e, "cannot encode notification"),
            }
        }
    }

    /// Drains the push-notification payloads produced so far.
    pub fn take_notifications(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Returns true if the zone exists.
    pub fn zone_exists(&self, zone: &str) -> bool {
        self.zones.read().contains_key(zone)
    }

    /// Returns true if a subscription with this id watches the zone.
    pub fn has_subscription(&self, zone: &str, subscription_id: &str) -> bool {
        self.subscriptions.read().get(subscription_id).map(String::as_str) == Some(zone)
    }

    /// Removes a zone together with its subscriptions.
    pub fn delete_zone(&self, zone: &str) -> bool {
        self.subscriptions.write().retain(|_, z| z != zone);
        self.zones.write().remove(zone).is_some()
    }

    /// Invalidates every change token issued for the zone.
    pub fn expire_tokens(&self, zone: &str) -> ServerResult<()> {
        let mut zones = self.zones.write();
        let zone_state = zones
            .get_mut(zone)
            .ok_or_else(|| ServerError::ZoneNotFound(zone.to_string()))?;
        zone_state.expire_tokens();
        Ok(())
    }

    /// Token positioned after the zone's latest change.
    pub fn current_token(&self, zone: &str) -> ServerResult<ChangeToken> {
        let zones = self.zones.read();
        let zone_state = zones
            .get(zone)
            .ok_or_else(|| ServerError::ZoneNotFound(zone.to_string()))?;
        zone_state.position().encode()
    }

    /// Returns the stored copy of a record.
    pub fn record(&self, zone: &str, record_id: &RecordId) -> Option<RemoteRecord> {
        self.zones
            .read()
            .get(zone)
            .and_then(|z| z.record(record_id).cloned())
    }

    /// Returns every stored record of the zone.
    pub fn records(&self, zone: &str) -> Vec<RemoteRecord> {
        self.zones
            .read()
            .get(zone)
            .map(|z| z.records().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes every call fail as unavailable until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Makes the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.faults.lock().failing_fetches = count;
    }

    /// Makes the next `count` zone creations fail.
    pub fn fail_next_zone_creations(&self, count: usize) {
        self.faults.lock().failing_zone_creations = count;
    }

    /// Makes the next `count` subscription creations fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.faults.lock().failing_subscriptions = count;
    }

    /// Makes the next save of this record fail.
    pub fn fail_next_save_of(&self, record_id: RecordId) {
        self.faults.lock().failing_saves.insert(record_id);
    }

    /// Returns the call counters.
    pub fn counters(&self) -> ServerCounters {
        self.counters.lock().clone()
    }

    /// Resets the call counters.
    pub fn reset_counters(&self) {
        *self.counters.lock() = ServerCounters::default();
    }
}

impl Default for ZoneServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZoneServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneServer")
            .field("config", &self.config)
            .field("zones", &self.zones.read().len())
            .finish()
    }
}
