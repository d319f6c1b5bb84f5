//! Entity model and the shadow schema derived from it.
//!
//! The shadow schema is the application's entity model with three sync
//! metadata columns appended to every root entity:
//!
//! ```text
//! Note (root)            ChecklistNote : Note
//! ├─ title               ├─ (inherits Note's columns)
//! ├─ body                └─ items
//! ├─ record_id       ◄── metadata, root only
//! ├─ encoded_values  ◄── metadata, root only
//! └─ change_type     ◄── metadata, root only
//! ```
//!
//! Building the schema also produces one [`FieldMap`] per entity: the
//! attribute and relationship table used by every component that copies
//! values between application objects, shadow records and remote records.

use crate::error::{StorageError, StorageResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use zonesync_protocol::{ChangeType, Value};

/// Column holding the record identity.
pub const RECORD_ID_ATTRIBUTE: &str = "record_id";
/// Column holding opaque encoded system values.
pub const ENCODED_VALUES_ATTRIBUTE: &str = "encoded_values";
/// Column holding the pending-sync marker.
pub const CHANGE_TYPE_ATTRIBUTE: &str = "change_type";

const METADATA_ATTRIBUTES: [&str; 3] = [
    RECORD_ID_ATTRIBUTE,
    ENCODED_VALUES_ATTRIBUTE,
    CHANGE_TYPE_ATTRIBUTE,
];

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// Boolean.
    Bool,
    /// Signed 64-bit integer (also used for 16/32-bit columns).
    Integer,
    /// Floating point.
    Double,
    /// UTF-8 text.
    Text,
    /// Binary data.
    Bytes,
    /// Milliseconds since the Unix epoch.
    Timestamp,
}

impl AttributeType {
    /// Returns true if `value` can be stored in a column of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (AttributeType::Bool, Value::Bool(_))
                | (AttributeType::Integer, Value::Integer(_))
                | (AttributeType::Double, Value::Double(_))
                | (AttributeType::Double, Value::Integer(_))
                | (AttributeType::Text, Value::Text(_))
                | (AttributeType::Bytes, Value::Bytes(_))
                | (AttributeType::Timestamp, Value::Timestamp(_))
        )
    }

    fn name(&self) -> &'static str {
        match self {
            AttributeType::Bool => "bool",
            AttributeType::Integer => "integer",
            AttributeType::Double => "double",
            AttributeType::Text => "text",
            AttributeType::Bytes => "bytes",
            AttributeType::Timestamp => "timestamp",
        }
    }
}

/// An attribute of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescription {
    /// Attribute name.
    pub name: String,
    /// Declared type.
    pub attribute_type: AttributeType,
    /// Whether the value may be null.
    pub optional: bool,
    /// Whether the backing store should index the column.
    pub indexed: bool,
    /// Value used when an object does not supply one.
    pub default: Option<Value>,
}

impl AttributeDescription {
    /// Creates a required, unindexed attribute.
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
            optional: false,
            indexed: false,
            default: None,
        }
    }

    /// Marks the attribute optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Marks the attribute indexed.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Sets the default value.
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A relationship of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescription {
    /// Relationship name.
    pub name: String,
    /// Destination entity name.
    pub destination: String,
    /// Whether this is a to-many relationship.
    pub to_many: bool,
    /// Name of the inverse relationship on the destination, if any.
    pub inverse: Option<String>,
}

impl RelationshipDescription {
    /// Creates a to-one relationship.
    pub fn to_one(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            to_many: false,
            inverse: None,
        }
    }

    /// Creates a to-many relationship.
    pub fn to_many(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            to_many: true,
            inverse: None,
        }
    }

    /// Sets the inverse relationship name.
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }
}

/// An application entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescription {
    /// Entity name.
    pub name: String,
    /// Parent entity, for inheritance.
    pub parent: Option<String>,
    /// Attributes declared on this entity (not inherited ones).
    pub attributes: Vec<AttributeDescription>,
    /// Relationships declared on this entity (not inherited ones).
    pub relationships: Vec<RelationshipDescription>,
}

impl EntityDescription {
    /// Creates a root entity.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Sets the parent entity.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, attribute: AttributeDescription) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds a relationship.
    pub fn with_relationship(mut self, relationship: RelationshipDescription) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Returns true if this entity has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// The application's entity model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityModel {
    entities: Vec<EntityDescription>,
}

impl EntityModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity.
    pub fn with_entity(mut self, entity: EntityDescription) -> Self {
        self.entities.push(entity);
        self
    }

    /// Returns all entities.
    pub fn entities(&self) -> &[EntityDescription] {
        &self.entities
    }

    /// Looks up an entity by name.
    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|e| e.name == name)
    }
}

/// Attribute and relationship table of one entity, including inherited ones.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap {
    entity: String,
    root: String,
    attributes: BTreeMap<String, AttributeDescription>,
    relationships: BTreeMap<String, RelationshipDescription>,
}

impl FieldMap {
    /// Entity the table describes.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Root of the entity's inheritance chain.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// All attributes, inherited ones included.
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDescription> {
        self.attributes.values()
    }

    /// All relationships, inherited ones included.
    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipDescription> {
        self.relationships.values()
    }

    /// Looks up an attribute.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.get(name)
    }

    /// Looks up a relationship.
    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescription> {
        self.relationships.get(name)
    }

    /// Copies the declared attributes out of `values`.
    ///
    /// Keys that are not attributes of the entity are dropped. Missing
    /// attributes take their default, or null. Values of the wrong type are
    /// rejected.
    pub fn copy_attributes(
        &self,
        values: &BTreeMap<String, Value>,
    ) -> StorageResult<BTreeMap<String, Value>> {
        let mut copied = BTreeMap::new();
        for (name, attribute) in &self.attributes {
            let value = match values.get(name) {
                Some(value) => value.clone(),
                None => attribute.default.clone().unwrap_or(Value::Null),
            };
            if !attribute.attribute_type.accepts(&value) {
                return Err(StorageError::TypeMismatch {
                    entity: self.entity.clone(),
                    attribute: name.clone(),
                    expected: attribute.attribute_type.name().to_string(),
                    found: value.type_name().to_string(),
                });
            }
            let value = match (attribute.attribute_type, value) {
                (AttributeType::Double, Value::Integer(i)) => Value::Double(i as f64),
                (_, value) => value,
            };
            copied.insert(name.clone(), value);
        }
        Ok(copied)
    }
}

/// The application model augmented with sync metadata.
#[derive(Debug, Clone)]
pub struct ShadowSchema {
    backing_model: EntityModel,
    field_maps: HashMap<String, FieldMap>,
    children: HashMap<String, Vec<String>>,
}

impl ShadowSchema {
    /// Builds the shadow schema for an application model.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Schema`] if:
    /// - An entity name is empty or declared twice
    /// - A parent or relationship destination does not exist
    /// - The inheritance graph has a cycle
    /// - An application attribute or relationship uses a metadata column name
    /// - A sub-entity redeclares an inherited attribute or relationship
    pub fn build(model: &EntityModel) -> StorageResult<Self> {
        let mut names = HashSet::new();
        for entity in model.entities() {
            if entity.name.is_empty() {
                return Err(StorageError::schema("entity with empty name"));
            }
            if !names.insert(entity.name.as_str()) {
                return Err(StorageError::schema(format!(
                    "entity {} declared twice",
                    entity.name
                )));
            }
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for entity in model.entities() {
            if let Some(parent) = &entity.parent {
                if !names.contains(parent.as_str()) {
                    return Err(StorageError::schema(format!(
                        "entity {} has unknown parent {}",
                        entity.name, parent
                    )));
                }
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(entity.name.clone());
            }
            for relationship in &entity.relationships {
                if !names.contains(relationship.destination.as_str()) {
                    return Err(StorageError::schema(format!(
                        "relationship {}.{} points at unknown entity {}",
                        entity.name, relationship.name, relationship.destination
                    )));
                }
            }
            for name in entity
                .attributes
                .iter()
                .map(|a| a.name.as_str())
                .chain(entity.relationships.iter().map(|r| r.name.as_str()))
            {
                if METADATA_ATTRIBUTES.contains(&name) {
                    return Err(StorageError::schema(format!(
                        "{}.{} collides with a sync metadata column",
                        entity.name, name
                    )));
                }
            }
        }

        let mut field_maps = HashMap::new();
        for entity in model.entities() {
            let chain = inheritance_chain(model, &entity.name)?;
            let root = chain.last().cloned().unwrap_or_else(|| entity.name.clone());

            let mut attributes = BTreeMap::new();
            let mut relationships = BTreeMap::new();
            // Root first so sub-entities extend their ancestors.
            for name in chain.iter().rev() {
                let Some(description) = model.entity(name) else {
                    continue;
                };
                for attribute in &description.attributes {
                    if attributes
                        .insert(attribute.name.clone(), attribute.clone())
                        .is_some()
                    {
                        return Err(StorageError::schema(format!(
                            "{}.{} redeclares an inherited attribute",
                            name, attribute.name
                        )));
                    }
                }
                for relationship in &description.relationships {
                    if relationships
                        .insert(relationship.name.clone(), relationship.clone())
                        .is_some()
                    {
                        return Err(StorageError::schema(format!(
                            "{}.{} redeclares an inherited relationship",
                            name, relationship.name
                        )));
                    }
                }
            }

            field_maps.insert(
                entity.name.clone(),
                FieldMap {
                    entity: entity.name.clone(),
                    root,
                    attributes,
                    relationships,
                },
            );
        }

        let mut backing_model = model.clone();
        for entity in &mut backing_model.entities {
            if entity.is_root() {
                entity.attributes.extend(Self::metadata_attributes());
            }
        }

        tracing::debug!(
            entities = field_maps.len(),
            "built shadow schema"
        );

        Ok(Self {
            backing_model,
            field_maps,
            children,
        })
    }

    /// The three metadata columns appended to every root entity.
    pub fn metadata_attributes() -> [AttributeDescription; 3] {
        [
            AttributeDescription::new(RECORD_ID_ATTRIBUTE, AttributeType::Text).indexed(),
            AttributeDescription::new(ENCODED_VALUES_ATTRIBUTE, AttributeType::Bytes)
                .optional()
                .indexed(),
            AttributeDescription::new(CHANGE_TYPE_ATTRIBUTE, AttributeType::Integer)
                .indexed()
                .with_default(Value::Integer(i64::from(ChangeType::NoChange.to_code()))),
        ]
    }

    /// The augmented model the backing store is opened with.
    pub fn backing_model(&self) -> &EntityModel {
        &self.backing_model
    }

    /// Field table for an entity.
    pub fn field_map(&self, entity: &str) -> StorageResult<&FieldMap> {
        self.field_maps
            .get(entity)
            .ok_or_else(|| StorageError::UnknownEntity(entity.to_string()))
    }

    /// Returns true if the entity is part of the schema.
    pub fn contains(&self, entity: &str) -> bool {
        self.field_maps.contains_key(entity)
    }

    /// Root of the entity's inheritance chain.
    pub fn root_of(&self, entity: &str) -> StorageResult<&str> {
        self.field_map(entity).map(FieldMap::root)
    }

    /// The entity and all entities inheriting from it.
    pub fn with_descendants(&self, entity: &str) -> StorageResult<Vec<String>> {
        if !self.contains(entity) {
            return Err(StorageError::UnknownEntity(entity.to_string()));
        }
        let mut result = vec![entity.to_string()];
        let mut index = 0;
        while index < result.len() {
            if let Some(children) = self.children.get(&result[index]) {
                result.extend(children.iter().cloned());
            }
            index += 1;
        }
        Ok(result)
    }

    /// Returns true if `entity` is `ancestor` or inherits from it.
    pub fn is_kind_of(&self, entity: &str, ancestor: &str) -> bool {
        self.with_descendants(ancestor)
            .map(|names| names.iter().any(|n| n == entity))
            .unwrap_or(false)
    }
}

/// Returns the entity followed by its ancestors, root last.
fn inheritance_chain(model: &EntityModel, entity: &str) -> StorageResult<Vec<String>> {
    let mut chain = vec![entity.to_string()];
    let mut current = model.entity(entity);
    while let Some(parent) = current.and_then(|e| e.parent.as_ref()) {
        if chain.contains(parent) {
            return Err(StorageError::schema(format!(
                "inheritance cycle through {parent}"
            )));
        }
        chain.push(parent.clone());
        current = model.entity(parent);
    }
    Ok(chain)
}
