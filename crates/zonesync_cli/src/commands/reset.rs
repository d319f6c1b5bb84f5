//! Reset command implementations.
//!
//! Both commands hold the store's exclusive lock while they write, so they
//! fail instead of racing an open session.

use std::path::Path;
use zonesync_storage::{FileBackingStore, FileStateStore, SyncStateStore};

/// Clears the sync cursor. The next run reads the whole zone.
pub fn cursor(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let _store = FileBackingStore::open(path, false)?;
    FileStateStore::for_store(path).set_cursor(None)?;
    tracing::info!(path = %path.display(), "sync cursor cleared");
    println!("Cursor cleared; the next sync is a full resync.");
    Ok(())
}

/// Clears both bootstrap flags. The next run creates the zone and the
/// subscription again.
pub fn bootstrap(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let _store = FileBackingStore::open(path, false)?;
    let state = FileStateStore::for_store(path);
    let mut snapshot = state.load()?;
    snapshot.zone_created = false;
    snapshot.subscription_created = false;
    state.save(&snapshot)?;
    tracing::info!(path = %path.display(), "bootstrap flags cleared");
    println!("Bootstrap flags cleared; the next sync sets up the zone again.");
    Ok(())
}
