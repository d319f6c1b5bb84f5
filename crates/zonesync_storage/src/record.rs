//! Shadow records.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use zonesync_protocol::{ChangeType, CodecResult, RecordId, SystemFields, Value};

/// Identity of a shadow record inside the backing store.
///
/// Assigned by the store on insert and never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackingId(u64);

impl BackingId {
    /// Creates a backing identity from its raw value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BackingId({})", self.0)
    }
}

impl fmt::Display for BackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// A relationship edge between shadow records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edge {
    /// To-one edge.
    One(Option<BackingId>),
    /// To-many edge.
    Many(BTreeSet<BackingId>),
}

impl Edge {
    /// Returns every target of the edge.
    pub fn targets(&self) -> Vec<BackingId> {
        match self {
            Edge::One(target) => target.iter().copied().collect(),
            Edge::Many(targets) => targets.iter().copied().collect(),
        }
    }

    /// Removes `target` from the edge. Returns true if it was present.
    pub fn remove(&mut self, target: BackingId) -> bool {
        match self {
            Edge::One(current) if *current == Some(target) => {
                *current = None;
                true
            }
            Edge::One(_) => false,
            Edge::Many(targets) => targets.remove(&target),
        }
    }
}

/// The sync-side mirror of one application object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowRecord {
    /// Entity name of the mirrored object.
    pub entity: String,
    /// Identity shared with the remote record. Unique across the store.
    pub record_id: RecordId,
    /// Application attribute values.
    pub attributes: BTreeMap<String, Value>,
    /// Relationship edges, by relationship name.
    pub relationships: BTreeMap<String, Edge>,
    /// Opaque encoded system fields from the last remote contact.
    pub encoded_values: Option<Vec<u8>>,
    /// Pending-sync marker.
    pub change_type: ChangeType,
}

impl ShadowRecord {
    /// Creates a shadow record with no values, marked [`ChangeType::NoChange`].
    pub fn new(entity: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            entity: entity.into(),
            record_id,
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            encoded_values: None,
            change_type: ChangeType::NoChange,
        }
    }

    /// Returns an attribute value, treating absent as null.
    pub fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&Value::Null)
    }

    /// Returns true if the record is a local tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.change_type == ChangeType::Deleted
    }

    /// Decodes the stored system fields. A record that never reached the
    /// server has none.
    pub fn system_fields(&self) -> CodecResult<SystemFields> {
        match &self.encoded_values {
            Some(bytes) => SystemFields::decode(bytes),
            None => Ok(SystemFields::default()),
        }
    }

    /// Encodes and stores system fields.
    pub fn set_system_fields(&mut self, system: &SystemFields) -> CodecResult<()> {
        self.encoded_values = Some(system.encode()?);
        Ok(())
    }

    /// Returns every backing identity this record points at.
    pub fn edge_targets(&self) -> Vec<BackingId> {
        self.relationships.values().flat_map(Edge::targets).collect()
    }
}
