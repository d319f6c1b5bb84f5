//! Sync cursor and bootstrap flags.
//!
//! This state lives beside the backing store, never inside it, so resetting
//! sync never touches shadow records.

use crate::error::StorageResult;
use crate::file::write_atomic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use zonesync_protocol::{from_cbor, to_cbor, ChangeToken};

const STATE_FILE: &str = "sync_state.cbor";

/// Everything the engine persists between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateSnapshot {
    /// Change token of the last fully applied run.
    pub cursor: Option<ChangeToken>,
    /// Whether the custom zone is known to exist.
    pub zone_created: bool,
    /// Whether the zone subscription is known to exist.
    pub subscription_created: bool,
    /// Identifier handed to the host when the store is first loaded.
    #[serde(default)]
    pub store_uuid: Option<String>,
}

/// Persistent home of a [`SyncStateSnapshot`].
pub trait SyncStateStore: Send + Sync {
    /// Loads the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read or decoded.
    fn load(&self) -> StorageResult<SyncStateSnapshot>;

    /// Replaces the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn save(&self, state: &SyncStateSnapshot) -> StorageResult<()>;

    /// Stores or clears the sync cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    fn set_cursor(&self, cursor: Option<ChangeToken>) -> StorageResult<()> {
        let mut state = self.load()?;
        state.cursor = cursor;
        self.save(&state)
    }

    /// Records whether the zone exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    fn set_zone_created(&self, created: bool) -> StorageResult<()> {
        let mut state = self.load()?;
        state.zone_created = created;
        self.save(&state)
    }

    /// Records whether the subscription exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    fn set_subscription_created(&self, created: bool) -> StorageResult<()> {
        let mut state = self.load()?;
        state.subscription_created = created;
        self.save(&state)
    }
}

/// Sync state held in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<SyncStateSnapshot>,
}

impl MemoryStateStore {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStateStore for MemoryStateStore {
    fn load(&self) -> StorageResult<SyncStateSnapshot> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &SyncStateSnapshot) -> StorageResult<()> {
        *self.state.lock() = state.clone();
        Ok(())
    }
}

/// Sync state kept as `sync_state.cbor` in a store directory.
///
/// The directory lock is owned by the [`crate::FileBackingStore`] opened on
/// the same path.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl FileStateStore {
    /// State store for the store directory at `dir`.
    #[must_use]
    pub fn for_store(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }
}

impl SyncStateStore for FileStateStore {
    fn load(&self) -> StorageResult<SyncStateSnapshot> {
        let _guard = self.guard.lock();
        let path = self.path();
        if !path.exists() {
            return Ok(SyncStateSnapshot::default());
        }
        let data = fs::read(path)?;
        Ok(from_cbor(&data)?)
    }

    fn save(&self, state: &SyncStateSnapshot) -> StorageResult<()> {
        let _guard = self.guard.lock();
        write_atomic(&self.dir, STATE_FILE, &to_cbor(state)?)
    }
}
