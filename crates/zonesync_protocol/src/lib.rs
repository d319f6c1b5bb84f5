//! # ZoneSync Protocol
//!
//! Data types exchanged between a local shadow store and a remote,
//! zone-based record service.
//!
//! This crate provides:
//! - [`RecordId`], [`ChangeToken`] and [`VersionTag`] identities
//! - [`Value`] attribute values and [`RemoteRecord`]s
//! - [`ChangeType`], the local pending-sync marker
//! - Change-feed and batch save/delete messages
//! - [`Conflict`], [`ConflictPolicy`] and [`Resolution`]
//! - CBOR encoding helpers
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_type;
mod clock;
mod codec;
mod conflict;
mod error;
mod ids;
mod messages;
mod record;
mod value;

pub use change_type::ChangeType;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{from_cbor, to_cbor};
pub use conflict::{Conflict, ConflictKind, ConflictPolicy, Resolution};
pub use error::{CodecError, CodecResult};
pub use ids::{ChangeToken, RecordId, VersionTag};
pub use messages::{
    DeleteOutcome, DeleteRecordsResponse, DeleteResult, FetchChangesRequest, FetchChangesResponse,
    NotificationKind, RemoteNotification, SaveOutcome, SaveRecordsResponse, SaveResult,
    WriteResponse,
};
pub use record::{Reference, RemoteRecord, SystemFields};
pub use value::Value;

/// Zone name used when the store options do not name one.
pub const DEFAULT_ZONE_NAME: &str = "zonesync_zone";

/// Subscription identifier used when the store options do not name one.
pub const DEFAULT_SUBSCRIPTION_ID: &str = "zonesync_zone_subscription";
