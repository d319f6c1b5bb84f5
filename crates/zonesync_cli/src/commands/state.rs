//! State command implementation.

use serde::Serialize;
use std::path::Path;
use zonesync_storage::{FileStateStore, SyncStateStore};

/// Persisted sync state of a store.
#[derive(Debug, Serialize)]
pub struct StateResult {
    /// Store path.
    pub path: String,
    /// Hex-encoded change token, if one is stored.
    pub cursor: Option<String>,
    /// Whether the zone is known to exist.
    pub zone_created: bool,
    /// Whether the zone subscription is known to exist.
    pub subscription_created: bool,
    /// Identifier handed to the host on load.
    pub store_uuid: Option<String>,
}

/// Runs the state command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            println!("ZoneSync Store: {}", result.path);
            println!();
            println!("Sync State:");
            println!("  Store UUID:    {}", result.store_uuid.as_deref().unwrap_or("-"));
            println!("  Cursor:        {}", result.cursor.as_deref().unwrap_or("none (full resync)"));
            println!("  Zone:          {}", created(result.zone_created));
            println!("  Subscription:  {}", created(result.subscription_created));
        }
    }

    Ok(())
}

/// Reads the persisted state.
pub fn collect(path: &Path) -> Result<StateResult, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No store found at {:?}", path).into());
    }
    let state = FileStateStore::for_store(path).load()?;

    Ok(StateResult {
        path: path.display().to_string(),
        cursor: state
            .cursor
            .map(|token| token.as_bytes().iter().map(|b| format!("{b:02x}")).collect()),
        zone_created: state.zone_created,
        subscription_created: state.subscription_created,
        store_uuid: state.store_uuid,
    })
}

fn created(flag: bool) -> &'static str {
    if flag {
        "created"
    } else {
        "not created"
    }
}
