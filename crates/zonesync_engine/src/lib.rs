//! # ZoneSync Engine
//!
//! Keeps a local object store in sync with a remote zone-based record store.
//!
//! This crate provides:
//! - Identity mapping between host objects and record ids
//! - Change tracking into shadow records
//! - Conflict resolution under a per-session policy
//! - The fetch, apply, push and commit cycle
//! - A serial scheduler that coalesces triggers
//! - [`SyncSession`], the host-facing store
//!
//! ## Architecture
//!
//! The engine follows a **fetch-then-push** model:
//! 1. Bootstrap the zone and its subscription, once
//! 2. Fetch remote changes since the stored cursor
//! 3. Apply them to shadow records, resolving conflicts
//! 4. Push pending local changes
//! 5. Commit: mark pushed records synced and store the cursor
//!
//! ## Key Invariants
//!
//! - Push never runs before remote changes of the same run are applied
//! - The cursor moves only after a complete run, and skips the run's own
//!   writes only when nothing else reached the zone in between
//! - At most one run executes, and at most one waits
//! - Failures never lose pending local changes

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bootstrap;
mod config;
mod conflict;
mod engine;
mod error;
mod identity;
mod mapper;
mod object;
mod relationships;
mod remote;
mod scheduler;
mod session;
mod tracker;

pub use bootstrap::{BootstrapOutcome, CloudBootstrap};
pub use config::{ResolveCallback, RetryConfig, StoreOptions};
pub use conflict::ConflictResolver;
pub use engine::{
    EngineParts, RecordFailure, SyncEngine, SyncPhase, SyncReport, SyncState, SyncStats,
};
pub use error::{SyncError, SyncResult};
pub use identity::IdentityMapper;
pub use mapper::RecordMapper;
pub use object::{
    FetchRequest, FetchResult, FetchResultType, Identity, ManagedObject, ObjectId, ObjectNode,
    RelationshipValue, SaveRequest, StoreMetadata,
};
pub use relationships::{PendingIds, RelationshipResolver, SkipReason, SkippedEdge};
pub use remote::{RemoteError, RemoteResult, RemoteZoneService};
pub use scheduler::{Scheduler, SyncEvent, SyncJob, TriggerOutcome};
pub use session::{IncrementalStore, SyncSession, STORE_TYPE};
pub use tracker::{ChangeTracker, ObjectFailure, SaveReport};
