//! One-time creation of the remote zone and its subscription.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteZoneService;
use std::sync::Arc;
use zonesync_storage::SyncStateStore;

/// What a bootstrap call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BootstrapOutcome {
    /// The zone was created by this call.
    pub zone_created: bool,
    /// The subscription was created by this call.
    pub subscription_created: bool,
}

/// Idempotent zone and subscription setup, tracked by the two persisted
/// bootstrap flags.
pub struct CloudBootstrap {
    remote: Arc<dyn RemoteZoneService>,
    sync_state: Arc<dyn SyncStateStore>,
    zone: String,
    subscription_id: String,
}

impl CloudBootstrap {
    /// Creates a bootstrapper.
    pub fn new(
        remote: Arc<dyn RemoteZoneService>,
        sync_state: Arc<dyn SyncStateStore>,
        zone: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            sync_state,
            zone: zone.into(),
            subscription_id: subscription_id.into(),
        }
    }

    /// Returns true if both steps have succeeded before.
    pub fn is_complete(&self) -> SyncResult<bool> {
        let state = self.sync_state.load()?;
        Ok(state.zone_created && state.subscription_created)
    }

    /// Runs the steps whose flags are unset.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Bootstrap`] naming the failed step. Flags of
    /// steps that succeeded stay set.
    pub fn ensure(&self) -> SyncResult<BootstrapOutcome> {
        let state = self.sync_state.load()?;
        let mut outcome = BootstrapOutcome::default();

        if !state.zone_created {
            self.remote
                .ensure_zone(&self.zone)
                .map_err(|e| SyncError::Bootstrap {
                    step: "zone",
                    message: e.to_string(),
                })?;
            self.sync_state.set_zone_created(true)?;
            outcome.zone_created = true;
            tracing::info!(zone = %self.zone, "zone ready");
        }

        if !state.subscription_created {
            self.remote
                .ensure_subscription(&self.zone, &self.subscription_id)
                .map_err(|e| SyncError::Bootstrap {
                    step: "subscription",
                    message: e.to_string(),
                })?;
            self.sync_state.set_subscription_created(true)?;
            outcome.subscription_created = true;
            tracing::info!(
                zone = %self.zone,
                subscription_id = %self.subscription_id,
                "subscription ready"
            );
        }

        Ok(outcome)
    }

    /// Clears both flags so the next run repeats both steps.
    pub fn reset(&self) -> SyncResult<()> {
        let mut state = self.sync_state.load()?;
        state.zone_created = false;
        state.subscription_created = false;
        self.sync_state.save(&state)?;
        Ok(())
    }

    /// Forgets a zone that no longer exists remotely: clears both flags and
    /// the cursor in one write.
    pub fn forget_zone(&self) -> SyncResult<()> {
        let mut state = self.sync_state.load()?;
        state.zone_created = false;
        state.subscription_created = false;
        state.cursor = None;
        self.sync_state.save(&state)?;
        tracing::info!(zone = %self.zone, "zone forgotten; next run bootstraps again");
        Ok(())
    }
}

impl std::fmt::Debug for CloudBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudBootstrap")
            .field("zone", &self.zone)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}
