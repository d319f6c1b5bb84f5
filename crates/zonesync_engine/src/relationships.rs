//! Materializing object-graph edges between shadow records.

use crate::error::SyncResult;
use crate::identity::IdentityMapper;
use crate::object::{ManagedObject, ObjectId, RelationshipValue};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use zonesync_protocol::{RecordId, Reference};
use zonesync_storage::{
    BackingId, BackingStore, Edge, FieldMap, RelationshipDescription, ShadowRecord, ShadowSchema,
};

/// Why an edge was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The target has no permanent identity yet.
    TemporaryTarget,
    /// No live shadow record exists for the target.
    MissingTarget,
    /// The target's entity does not match the relationship destination.
    WrongEntity,
}

/// An edge that was not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEdge {
    /// Object owning the relationship.
    pub source: ObjectId,
    /// Relationship name.
    pub relationship: String,
    /// Target that could not be linked.
    pub target: ObjectId,
    /// Why.
    pub reason: SkipReason,
}

/// Shadow records that are part of an uncommitted batch: record id to
/// backing identity and entity.
pub type PendingIds = HashMap<RecordId, (BackingId, String)>;

/// Resolves relationship targets to backing identities.
pub struct RelationshipResolver {
    schema: Arc<ShadowSchema>,
    backing: Arc<dyn BackingStore>,
    identities: Arc<IdentityMapper>,
}

impl RelationshipResolver {
    /// Creates a resolver.
    pub fn new(
        schema: Arc<ShadowSchema>,
        backing: Arc<dyn BackingStore>,
        identities: Arc<IdentityMapper>,
    ) -> Self {
        Self {
            schema,
            backing,
            identities,
        }
    }

    fn lookup(
        &self,
        record_id: &RecordId,
        pending: &PendingIds,
    ) -> SyncResult<Option<(BackingId, String)>> {
        if let Some(found) = pending.get(record_id) {
            return Ok(Some(found.clone()));
        }
        Ok(self
            .backing
            .find_by_record_id(record_id)?
            .filter(|(_, shadow)| !shadow.is_tombstone())
            .map(|(id, shadow)| (id, shadow.entity)))
    }

    /// Writes the edges of a host object into its shadow record.
    ///
    /// Faulted relationships are left as they are. To-one relationships get
    /// their single edge set; to-many relationships get their whole member
    /// set replaced. Targets are looked up in `pending` first, then in the
    /// store. Targets without a permanent identity, or without a live or
    /// pending shadow record, are left out and returned.
    pub fn apply_object_edges(
        &self,
        field_map: &FieldMap,
        object: &ManagedObject,
        shadow: &mut ShadowRecord,
        pending: &PendingIds,
    ) -> SyncResult<Vec<SkippedEdge>> {
        let mut skipped = Vec::new();

        for description in field_map.relationships() {
            let targets: Vec<&ObjectId> = match object.relationship(&description.name) {
                RelationshipValue::Fault => continue,
                RelationshipValue::ToOne(target) => target.iter().collect(),
                RelationshipValue::ToMany(members) => members.iter().collect(),
            };

            let mut resolved = BTreeSet::new();
            for target in targets {
                let reason = match self.identities.resolve(target) {
                    None => Some(SkipReason::TemporaryTarget),
                    Some(record_id) => match self.lookup(&record_id, pending)? {
                        None => Some(SkipReason::MissingTarget),
                        Some((id, entity)) => {
                            if self.accepts(description, &entity) {
                                resolved.insert(id);
                                None
                            } else {
                                Some(SkipReason::WrongEntity)
                            }
                        }
                    },
                };
                if let Some(reason) = reason {
                    tracing::debug!(
                        source = %object.id,
                        relationship = %description.name,
                        target = %target,
                        ?reason,
                        "edge left out"
                    );
                    skipped.push(SkippedEdge {
                        source: object.id.clone(),
                        relationship: description.name.clone(),
                        target: target.clone(),
                        reason,
                    });
                }
            }

            shadow
                .relationships
                .insert(description.name.clone(), edge_for(description, resolved));
        }

        Ok(skipped)
    }

    /// Writes the edges carried by a remote record into a shadow record.
    ///
    /// References to records that are neither stored nor part of the
    /// pending batch are left out and returned.
    pub fn apply_references(
        &self,
        field_map: &FieldMap,
        references: &BTreeMap<String, Reference>,
        shadow: &mut ShadowRecord,
        pending: &PendingIds,
    ) -> SyncResult<Vec<RecordId>> {
        let mut unresolved = Vec::new();

        for description in field_map.relationships() {
            let ids: Vec<&RecordId> = match references.get(&description.name) {
                None => Vec::new(),
                Some(Reference::One(target)) => target.iter().collect(),
                Some(Reference::Many(members)) => members.iter().collect(),
            };

            let mut resolved = BTreeSet::new();
            for record_id in ids {
                match self.lookup(record_id, pending)? {
                    Some((id, _)) => {
                        resolved.insert(id);
                    }
                    None => unresolved.push(record_id.clone()),
                }
            }
            shadow
                .relationships
                .insert(description.name.clone(), edge_for(description, resolved));
        }

        Ok(unresolved)
    }

    /// Converts the edges of a shadow record into record-id references.
    ///
    /// Targets that are tombstones are left out.
    pub fn references_of(
        &self,
        field_map: &FieldMap,
        shadow: &ShadowRecord,
    ) -> SyncResult<BTreeMap<String, Reference>> {
        let mut references = BTreeMap::new();
        for description in field_map.relationships() {
            let mut ids = Vec::new();
            if let Some(edge) = shadow.relationships.get(&description.name) {
                for target in edge.targets() {
                    if let Some(target) = self.backing.get(target)? {
                        if !target.is_tombstone() {
                            ids.push(target.record_id);
                        }
                    }
                }
            }
            let reference = if description.to_many {
                ids.sort();
                Reference::Many(ids)
            } else {
                Reference::One(ids.into_iter().next())
            };
            references.insert(description.name.clone(), reference);
        }
        Ok(references)
    }

    /// Live targets of one relationship, as object identities.
    pub fn targets_of(
        &self,
        shadow: &ShadowRecord,
        relationship: &str,
    ) -> SyncResult<Vec<ObjectId>> {
        let mut targets = Vec::new();
        if let Some(edge) = shadow.relationships.get(relationship) {
            for id in edge.targets() {
                if let Some(target) = self.backing.get(id)? {
                    if !target.is_tombstone() {
                        targets.push(ObjectId::permanent(target.entity, target.record_id));
                    }
                }
            }
        }
        Ok(targets)
    }

    fn accepts(&self, description: &RelationshipDescription, entity: &str) -> bool {
        self.schema.is_kind_of(entity, &description.destination)
    }
}

fn edge_for(description: &RelationshipDescription, targets: BTreeSet<BackingId>) -> Edge {
    if description.to_many {
        Edge::Many(targets)
    } else {
        Edge::One(targets.into_iter().next())
    }
}

impl std::fmt::Debug for RelationshipResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipResolver").finish_non_exhaustive()
    }
}
