//! # ZoneSync Server
//!
//! Reference in-memory remote zone service.
//!
//! This crate provides:
//! - Named record zones with a sequenced change feed
//! - Change tokens that can be expired to force a full resync
//! - Version tags and stale-write detection on save
//! - Zone subscriptions and push-notification payloads
//! - Fault injection for tests
//!
//! # Change feed
//!
//! Every accepted save or delete takes the next sequence number of its
//! zone. A change token names a position in that sequence; fetching with a
//! token returns the latest state of every record changed after it, in
//! sequence order, one page at a time.
//!
//! ```rust
//! use zonesync_protocol::{FetchChangesRequest, RecordId, RemoteRecord};
//! use zonesync_server::ZoneServer;
//!
//! let server = ZoneServer::new();
//! server.ensure_zone("notes").unwrap();
//! server
//!     .save_records("notes", vec![RemoteRecord::new(RecordId::from("n1"), "Note")])
//!     .unwrap();
//!
//! let page = server
//!     .fetch_changes(&FetchChangesRequest::new("notes", None, 100))
//!     .unwrap();
//! assert_eq!(page.changed.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod server;
mod token;
mod zone;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{ServerCounters, ZoneServer};
