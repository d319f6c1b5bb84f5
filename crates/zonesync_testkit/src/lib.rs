//! # ZoneSync Testkit
//!
//! Test utilities for ZoneSync.
//!
//! This crate provides:
//! - A sample entity model and session-backed test stores
//! - A [`remote::SharedZone`] adapter that serves several stores from one
//!   reference server, with an optional gate for blocking runs
//! - Property-based generators for local edit sequences
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zonesync_testkit::prelude::*;
//!
//! let zone = SharedZone::new();
//! let alice = TestStore::memory(&zone);
//! let bob = TestStore::memory(&zone);
//!
//! alice.insert_note("groceries");
//! alice.sync();
//! bob.sync();
//! assert_eq!(bob.titles(), vec!["groceries"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use generators::*;
pub use remote::*;
