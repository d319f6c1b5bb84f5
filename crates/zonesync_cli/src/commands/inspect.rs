//! Inspect command implementation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use zonesync_protocol::{ChangeType, Value};
use zonesync_storage::{BackingStore, FileBackingStore, Predicate, ShadowQuery, ShadowRecord};

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Number of shadow records in the store.
    pub total_records: usize,
    /// Records waiting to be saved remotely.
    pub updated_count: usize,
    /// Tombstones waiting to be deleted remotely.
    pub deleted_count: usize,
    /// Records matching the filters.
    pub records: Vec<RecordRow>,
}

/// One shadow record.
#[derive(Debug, Serialize)]
pub struct RecordRow {
    /// Local row id.
    pub backing_id: u64,
    /// Entity name.
    pub entity: String,
    /// Shared record id.
    pub record_id: String,
    /// Pending-sync marker.
    pub change_type: &'static str,
    /// Last known server version.
    pub version: Option<String>,
    /// Server modification time (ms since epoch).
    pub modified_at: Option<u64>,
    /// Local edit time (ms since epoch).
    pub local_modified_at: Option<u64>,
    /// Attribute values, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, serde_json::Value>>,
    /// Relationship targets, as local row ids.
    pub relationships: BTreeMap<String, Vec<u64>>,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    entity: Option<&str>,
    change_type: Option<ChangeType>,
    show_attributes: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(path, entity, change_type, show_attributes)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Reads the store and builds the result.
pub fn collect(
    path: &Path,
    entity: Option<&str>,
    change_type: Option<ChangeType>,
    show_attributes: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let store = FileBackingStore::open_read_only(path)?;
    let all = store.query(&ShadowQuery::all())?;
    let count = |kind: ChangeType| all.iter().filter(|(_, r)| r.change_type == kind).count();

    let mut query = match entity {
        Some(entity) => ShadowQuery::entities(vec![entity.to_string()]),
        None => ShadowQuery::all(),
    };
    if let Some(kind) = change_type {
        query = query.with_predicate(Predicate::ChangeType(kind));
    }
    let records = store
        .query(&query)?
        .into_iter()
        .map(|(id, record)| row(id.as_u64(), &record, show_attributes))
        .collect();
    tracing::debug!(path = %path.display(), total = all.len(), "store inspected");

    Ok(InspectResult {
        path: path.display().to_string(),
        total_records: all.len(),
        updated_count: count(ChangeType::Updated),
        deleted_count: count(ChangeType::Deleted),
        records,
    })
}

fn row(backing_id: u64, record: &ShadowRecord, show_attributes: bool) -> RecordRow {
    // Undecodable system fields show as unknown rather than failing the listing.
    let system = record.system_fields().unwrap_or_default();
    RecordRow {
        backing_id,
        entity: record.entity.clone(),
        record_id: record.record_id.as_str().to_string(),
        change_type: change_type_name(record.change_type),
        version: system.version.map(|v| v.as_str().to_string()),
        modified_at: system.modified_at,
        local_modified_at: system.local_modified_at,
        attributes: show_attributes.then(|| {
            record
                .attributes
                .iter()
                .map(|(name, value)| (name.clone(), json_value(value)))
                .collect()
        }),
        relationships: record
            .relationships
            .iter()
            .map(|(name, edge)| {
                (
                    name.clone(),
                    edge.targets().iter().map(|t| t.as_u64()).collect(),
                )
            })
            .collect(),
    }
}

fn change_type_name(change_type: ChangeType) -> &'static str {
    match change_type {
        ChangeType::NoChange => "no-change",
        ChangeType::Updated => "updated",
        ChangeType::Deleted => "deleted",
    }
}

fn json_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::from(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Double(d) => serde_json::Value::from(*d),
        Value::Text(s) => serde_json::Value::from(s.as_str()),
        Value::Bytes(bytes) => serde_json::Value::from(hex(bytes)),
        Value::Timestamp(ms) => serde_json::Value::from(*ms),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn print_text_output(result: &InspectResult) {
    println!("ZoneSync Store: {}", result.path);
    println!();
    println!("Records:");
    println!("  Total:   {}", result.total_records);
    println!("  Updated: {}", result.updated_count);
    println!("  Deleted: {}", result.deleted_count);
    println!();

    if result.records.is_empty() {
        println!("No matching records.");
        return;
    }

    println!(
        "  {:<8} {:<16} {:<38} {:<10} Version",
        "Row", "Entity", "Record ID", "Change"
    );
    for row in &result.records {
        println!(
            "  {:<8} {:<16} {:<38} {:<10} {}",
            row.backing_id,
            row.entity,
            row.record_id,
            row.change_type,
            row.version.as_deref().unwrap_or("-")
        );
        if let Some(attributes) = &row.attributes {
            for (name, value) in attributes {
                println!("      {name} = {value}");
            }
        }
        for (name, targets) in &row.relationships {
            println!("      {name} -> {targets:?}");
        }
    }
}
