//! Remote records.

use crate::codec::{from_cbor, to_cbor};
use crate::error::CodecResult;
use crate::ids::{RecordId, VersionTag};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A relationship carried by a remote record, expressed in record IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reference {
    /// To-one relationship. `None` clears the edge.
    One(Option<RecordId>),
    /// To-many relationship; the full member set.
    Many(Vec<RecordId>),
}

/// Bookkeeping carried alongside record content.
///
/// The server stamps `version` and `modified_at` on every accepted save.
/// `local_modified_at` is set by the local side when the object is edited
/// and is what the latest-modification policy compares against the
/// server's `modified_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFields {
    /// Server version token of the last known remote state.
    pub version: Option<VersionTag>,
    /// Server modification time (ms since epoch).
    pub modified_at: Option<u64>,
    /// Local edit time (ms since epoch).
    pub local_modified_at: Option<u64>,
}

impl SystemFields {
    /// Encodes to the opaque bytes kept in a shadow's `encoded_values`.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from a shadow's `encoded_values`.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

/// A record in the remote zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Identity shared with the local shadow record.
    pub record_id: RecordId,
    /// Entity name of the application object this record mirrors.
    pub entity: String,
    /// Attribute values.
    pub fields: BTreeMap<String, Value>,
    /// Relationships, by relationship name.
    pub references: BTreeMap<String, Reference>,
    /// Version and timestamps.
    pub system: SystemFields,
}

impl RemoteRecord {
    /// Creates an empty record.
    pub fn new(record_id: RecordId, entity: impl Into<String>) -> Self {
        Self {
            record_id,
            entity: entity.into(),
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
            system: SystemFields::default(),
        }
    }

    /// Sets a field value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets a relationship reference.
    pub fn with_reference(mut self, name: impl Into<String>, reference: Reference) -> Self {
        self.references.insert(name.into(), reference);
        self
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Server version token, if this record was ever saved remotely.
    pub fn version(&self) -> Option<&VersionTag> {
        self.system.version.as_ref()
    }

    /// Returns true if both records carry the same entity, fields and references.
    ///
    /// System fields are ignored, so a record re-fetched after a save compares
    /// equal to the copy that was pushed.
    pub fn same_content(&self, other: &RemoteRecord) -> bool {
        self.entity == other.entity
            && self.fields == other.fields
            && normalized(&self.references) == normalized(&other.references)
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

fn normalized(references: &BTreeMap<String, Reference>) -> BTreeMap<&str, Reference> {
    references
        .iter()
        .map(|(name, reference)| {
            let reference = match reference {
                Reference::Many(ids) => {
                    let mut ids = ids.clone();
                    ids.sort();
                    ids.dedup();
                    Reference::Many(ids)
                }
                other => other.clone(),
            };
            (name.as_str(), reference)
        })
        .collect()
}
