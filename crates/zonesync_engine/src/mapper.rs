//! Copying values between shadow records and remote records.

use crate::error::SyncResult;
use crate::relationships::RelationshipResolver;
use std::sync::Arc;
use zonesync_protocol::RemoteRecord;
use zonesync_storage::{ShadowRecord, ShadowSchema};

/// Builds remote records from shadow records and applies remote values to
/// shadow records, driven by the schema's field tables.
pub struct RecordMapper {
    schema: Arc<ShadowSchema>,
    relationships: Arc<RelationshipResolver>,
}

impl RecordMapper {
    /// Creates a mapper.
    pub fn new(schema: Arc<ShadowSchema>, relationships: Arc<RelationshipResolver>) -> Self {
        Self {
            schema,
            relationships,
        }
    }

    /// Builds the remote record for a shadow record.
    ///
    /// The record carries the shadow's stored system fields, so a save sends
    /// the version tag of the last known remote state.
    pub fn to_remote(&self, shadow: &ShadowRecord) -> SyncResult<RemoteRecord> {
        let field_map = self.schema.field_map(&shadow.entity)?;
        let mut record = RemoteRecord::new(shadow.record_id.clone(), shadow.entity.clone());
        record.fields = field_map.copy_attributes(&shadow.attributes)?;
        record.references = self.relationships.references_of(field_map, shadow)?;
        record.system = shadow.system_fields()?;
        Ok(record)
    }

    /// Overwrites a shadow's attributes with the remote record's fields.
    ///
    /// Edges and system fields are left to the caller.
    pub fn apply_fields(&self, remote: &RemoteRecord, shadow: &mut ShadowRecord) -> SyncResult<()> {
        let field_map = self.schema.field_map(&remote.entity)?;
        shadow.attributes = field_map.copy_attributes(&remote.fields)?;
        shadow.entity = remote.entity.clone();
        Ok(())
    }

    /// Returns true if the shadow already holds exactly this remote state.
    pub fn is_current(&self, shadow: &ShadowRecord, remote: &RemoteRecord) -> SyncResult<bool> {
        let local = self.to_remote(shadow)?;
        Ok(local.system.version == remote.system.version && local.same_content(remote))
    }
}

impl std::fmt::Debug for RecordMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordMapper").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use zonesync_protocol::{RecordId, Reference, SystemFields, Value, VersionTag};
    use zonesync_storage::{BackingStore, Edge, WriteBatch};

    #[test]
    fn to_remote_resolves_edges_to_record_ids() {
        let fixture = Fixture::new();
        let folder_id = fixture.backing.allocate_id().unwrap();
        let note_id = fixture.backing.allocate_id().unwrap();

        let folder = ShadowRecord::new("Folder", RecordId::from("f1"));
        let mut note = ShadowRecord::new("Note", RecordId::from("n1"));
        note.attributes.insert("title".into(), Value::from("hello"));
        note.relationships
            .insert("folder".into(), Edge::One(Some(folder_id)));
        note.set_system_fields(&SystemFields {
            version: Some(VersionTag::new("v4")),
            ..SystemFields::default()
        })
        .unwrap();

        let mut batch = WriteBatch::new();
        batch.insert(folder_id, folder);
        batch.insert(note_id, note.clone());
        fixture.backing.commit(batch).unwrap();

        let record = fixture.mapper.to_remote(&note).unwrap();
        assert_eq!(record.field("title"), Some(&Value::from("hello")));
        assert_eq!(record.field("pinned"), Some(&Value::Bool(false)));
        assert_eq!(
            record.references.get("folder"),
            Some(&Reference::One(Some(RecordId::from("f1"))))
        );
        assert_eq!(record.version(), Some(&VersionTag::new("v4")));
    }

    #[test]
    fn apply_fields_drops_unknown_fields() {
        let fixture = Fixture::new();
        let remote = RemoteRecord::new(RecordId::from("n1"), "Note")
            .with_field("title", "remote")
            .with_field("legacy", 1i64);
        let mut shadow = ShadowRecord::new("Note", RecordId::from("n1"));
        fixture.mapper.apply_fields(&remote, &mut shadow).unwrap();

        assert_eq!(shadow.attribute("title"), &Value::from("remote"));
        assert!(!shadow.attributes.contains_key("legacy"));
    }

    #[test]
    fn is_current_compares_version_and_content() {
        let fixture = Fixture::new();
        let mut remote = RemoteRecord::new(RecordId::from("n1"), "Note").with_field("title", "a");
        remote.system.version = Some(VersionTag::new("v1"));

        let mut shadow = ShadowRecord::new("Note", RecordId::from("n1"));
        fixture.mapper.apply_fields(&remote, &mut shadow).unwrap();
        shadow.set_system_fields(&remote.system).unwrap();
        let mut expected = fixture.mapper.to_remote(&shadow).unwrap();
        expected.system = remote.system.clone();
        assert!(fixture.mapper.is_current(&shadow, &expected).unwrap());

        expected.system.version = Some(VersionTag::new("v2"));
        assert!(!fixture.mapper.is_current(&shadow, &expected).unwrap());
    }
}
