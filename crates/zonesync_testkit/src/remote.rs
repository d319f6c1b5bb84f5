//! Remote service adapter over the reference zone server.
//!
//! Several test stores can share one [`SharedZone`]; every clone talks to
//! the same [`ZoneServer`].

use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::sync::Arc;
use zonesync_engine::{RemoteError, RemoteResult, RemoteZoneService};
use zonesync_protocol::{
    DeleteRecordsResponse, FetchChangesRequest, FetchChangesResponse, RecordId, RemoteRecord,
    SaveRecordsResponse,
};
use zonesync_server::{ServerError, ZoneServer};

/// Maps server errors onto the service error taxonomy.
pub fn remote_error(error: ServerError) -> RemoteError {
    match error {
        ServerError::ZoneNotFound(zone) => RemoteError::ZoneNotFound(zone),
        ServerError::ChangeTokenExpired => RemoteError::ChangeTokenExpired,
        ServerError::Unavailable(message) => RemoteError::Unavailable(message),
        other => RemoteError::Rejected(other.to_string()),
    }
}

/// A barrier that holds change-feed reads until it is opened.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl Gate {
    /// A gate that blocks until [`Gate::open`] is called.
    pub fn closed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lets every blocked and future caller through.
    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }

    /// Blocks future callers again.
    pub fn close(&self) {
        self.state.lock().open = false;
    }

    /// Blocks until at least one caller is held at the gate.
    pub fn wait_for_waiter(&self) {
        let mut state = self.state.lock();
        while state.waiting == 0 && !state.open {
            self.changed.wait(&mut state);
        }
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
        state.waiting -= 1;
    }
}

/// A [`RemoteZoneService`] backed by a shared [`ZoneServer`].
#[derive(Debug, Clone)]
pub struct SharedZone {
    server: Arc<ZoneServer>,
    gate: Option<Arc<Gate>>,
}

impl SharedZone {
    /// A fresh server with the default configuration.
    pub fn new() -> Self {
        Self::with_server(ZoneServer::new())
    }

    /// Wraps an already configured server.
    pub fn with_server(server: ZoneServer) -> Self {
        Self {
            server: Arc::new(server),
            gate: None,
        }
    }

    /// Returns a handle on the same server whose fetches wait at `gate`.
    pub fn gated(&self, gate: Arc<Gate>) -> Self {
        Self {
            server: self.server.clone(),
            gate: Some(gate),
        }
    }

    /// The underlying server, for fault injection and inspection.
    pub fn server(&self) -> &ZoneServer {
        &self.server
    }

    /// The adapter as a trait object.
    pub fn service(&self) -> Arc<dyn RemoteZoneService> {
        Arc::new(self.clone())
    }
}

impl Default for SharedZone {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for SharedZone {
    type Target = ZoneServer;

    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

impl RemoteZoneService for SharedZone {
    fn ensure_zone(&self, zone: &str) -> RemoteResult<()> {
        self.server.ensure_zone(zone).map_err(remote_error)
    }

    fn ensure_subscription(&self, zone: &str, subscription_id: &str) -> RemoteResult<()> {
        self.server
            .ensure_subscription(zone, subscription_id)
            .map_err(remote_error)
    }

    fn fetch_changes(&self, request: &FetchChangesRequest) -> RemoteResult<FetchChangesResponse> {
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        self.server.fetch_changes(request).map_err(remote_error)
    }

    fn save_records(
        &self,
        zone: &str,
        records: Vec<RemoteRecord>,
    ) -> RemoteResult<SaveRecordsResponse> {
        self.server.save_records(zone, records).map_err(remote_error)
    }

    fn delete_records(
        &self,
        zone: &str,
        record_ids: Vec<RecordId>,
    ) -> RemoteResult<DeleteRecordsResponse> {
        self.server
            .delete_records(zone, record_ids)
            .map_err(remote_error)
    }

    fn max_batch_size(&self) -> usize {
        self.server.max_batch_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn errors_keep_their_class() {
        assert_eq!(
            remote_error(ServerError::ChangeTokenExpired),
            RemoteError::ChangeTokenExpired
        );
        assert!(remote_error(ServerError::Unavailable("down".into())).is_retryable());
        assert!(matches!(
            remote_error(ServerError::InvalidRequest("bad".into())),
            RemoteError::Rejected(_)
        ));
    }

    #[test]
    fn clones_share_the_server() {
        let zone = SharedZone::new();
        let other = zone.clone();
        zone.ensure_zone("notes").unwrap();
        assert!(other.zone_exists("notes"));
    }

    #[test]
    fn gate_holds_fetches_until_open() {
        let zone = SharedZone::new();
        zone.ensure_zone("notes").unwrap();
        let gate = Gate::closed();
        let gated = zone.gated(gate.clone());

        let reader = thread::spawn(move || {
            gated
                .fetch_changes(&FetchChangesRequest::new("notes", None, 10))
                .map(|page| page.len())
        });
        gate.wait_for_waiter();
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());

        gate.open();
        assert_eq!(reader.join().unwrap().unwrap(), 0);
    }
}
