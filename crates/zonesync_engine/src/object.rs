//! The host-facing object model.
//!
//! The host persistence framework talks to the store in terms of object
//! identities and value maps; these types are that vocabulary.

use std::collections::BTreeMap;
use std::fmt;
use zonesync_protocol::{RecordId, Value};
use zonesync_storage::{Predicate, SortKey};

/// Identity of an object, either host-assigned or backed by a record id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identity {
    /// Assigned by the host before the object has been saved.
    Temporary(u64),
    /// Backed by a record id.
    Permanent(RecordId),
}

/// Identity of an object together with its entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    /// Entity name.
    pub entity: String,
    /// Identity.
    pub identity: Identity,
}

impl ObjectId {
    /// Creates a temporary identity.
    pub fn temporary(entity: impl Into<String>, tag: u64) -> Self {
        Self {
            entity: entity.into(),
            identity: Identity::Temporary(tag),
        }
    }

    /// Creates a permanent identity.
    pub fn permanent(entity: impl Into<String>, record_id: RecordId) -> Self {
        Self {
            entity: entity.into(),
            identity: Identity::Permanent(record_id),
        }
    }

    /// Returns the record id, if the identity is permanent.
    pub fn record_id(&self) -> Option<&RecordId> {
        match &self.identity {
            Identity::Permanent(id) => Some(id),
            Identity::Temporary(_) => None,
        }
    }

    /// Returns true if the identity is temporary.
    pub fn is_temporary(&self) -> bool {
        matches!(self.identity, Identity::Temporary(_))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Identity::Temporary(tag) => write!(f, "{}/t{}", self.entity, tag),
            Identity::Permanent(id) => write!(f, "{}/{}", self.entity, id),
        }
    }
}

/// Value of one relationship on a managed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipValue {
    /// Not loaded; the relationship is left as it is.
    Fault,
    /// To-one target.
    ToOne(Option<ObjectId>),
    /// To-many members.
    ToMany(Vec<ObjectId>),
}

/// An application object as handed over by the host.
///
/// The host keeps inverse relationships consistent; the store writes
/// exactly the edges it is given.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedObject {
    /// Identity.
    pub id: ObjectId,
    /// Attribute values.
    pub attributes: BTreeMap<String, Value>,
    /// Relationship values. Missing entries count as [`RelationshipValue::Fault`].
    pub relationships: BTreeMap<String, RelationshipValue>,
}

impl ManagedObject {
    /// Creates an object with no values.
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    /// Sets an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Sets a to-one relationship.
    pub fn with_to_one(mut self, name: impl Into<String>, target: Option<ObjectId>) -> Self {
        self.relationships
            .insert(name.into(), RelationshipValue::ToOne(target));
        self
    }

    /// Sets a to-many relationship.
    pub fn with_to_many(mut self, name: impl Into<String>, members: Vec<ObjectId>) -> Self {
        self.relationships
            .insert(name.into(), RelationshipValue::ToMany(members));
        self
    }

    /// Returns the relationship value, faulted when absent.
    pub fn relationship(&self, name: &str) -> &RelationshipValue {
        self.relationships
            .get(name)
            .unwrap_or(&RelationshipValue::Fault)
    }
}

/// The changes of one host save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveRequest {
    /// Newly created objects.
    pub inserted: Vec<ManagedObject>,
    /// Modified objects.
    pub updated: Vec<ManagedObject>,
    /// Deleted objects, carrying their final state.
    pub deleted: Vec<ManagedObject>,
}

impl SaveRequest {
    /// Creates an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an inserted object.
    pub fn insert(mut self, object: ManagedObject) -> Self {
        self.inserted.push(object);
        self
    }

    /// Adds an updated object.
    pub fn update(mut self, object: ManagedObject) -> Self {
        self.updated.push(object);
        self
    }

    /// Adds a deleted object.
    pub fn delete(mut self, object: ManagedObject) -> Self {
        self.deleted.push(object);
        self
    }

    /// Returns true if the request changes nothing.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// What a fetch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchResultType {
    /// Object identities.
    #[default]
    ObjectIds,
    /// Only the number of matches.
    Count,
}

/// A host fetch request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    /// Entity to fetch.
    pub entity: String,
    /// Whether sub-entities are included.
    pub include_subentities: bool,
    /// Attribute filter.
    pub predicate: Predicate,
    /// Optional ordering.
    pub sort_by: Option<SortKey>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// What to return.
    pub result_type: FetchResultType,
}

impl FetchRequest {
    /// Fetches every live object of the entity and its sub-entities.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            include_subentities: true,
            predicate: Predicate::All,
            sort_by: None,
            limit: None,
            result_type: FetchResultType::ObjectIds,
        }
    }

    /// Adds an attribute filter.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Sorts by an attribute.
    pub fn sorted_by(mut self, attribute: impl Into<String>, ascending: bool) -> Self {
        self.sort_by = Some(SortKey {
            attribute: attribute.into(),
            ascending,
        });
        self
    }

    /// Limits the number of results.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Excludes sub-entities.
    pub fn exact_entity(mut self) -> Self {
        self.include_subentities = false;
        self
    }

    /// Returns only the count.
    pub fn count_only(mut self) -> Self {
        self.result_type = FetchResultType::Count;
        self
    }
}

/// Result of a host fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// Matching object identities.
    Objects(Vec<ObjectId>),
    /// Number of matches.
    Count(usize),
}

impl FetchResult {
    /// Returns the identities, or an empty list for counts.
    pub fn into_objects(self) -> Vec<ObjectId> {
        match self {
            FetchResult::Objects(ids) => ids,
            FetchResult::Count(_) => Vec::new(),
        }
    }

    /// Number of matches.
    pub fn len(&self) -> usize {
        match self {
            FetchResult::Objects(ids) => ids.len(),
            FetchResult::Count(count) => *count,
        }
    }

    /// Returns true if nothing matched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Faulted values of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    /// Identity.
    pub id: ObjectId,
    /// Attribute values.
    pub attributes: BTreeMap<String, Value>,
    /// To-one relationship targets.
    pub to_one: BTreeMap<String, Option<ObjectId>>,
    /// Value version, for the host's optimistic locking.
    pub version: u64,
}

/// Metadata returned when the store loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Unique identifier of the store instance.
    pub store_uuid: String,
    /// Store type name.
    pub store_type: String,
}
