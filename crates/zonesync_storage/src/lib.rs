//! # ZoneSync Storage
//!
//! The local side of synchronization: the shadow schema and the narrow
//! interface through which the sync engine reaches durable storage.
//!
//! ## Design Principles
//!
//! - Every application object has exactly one [`ShadowRecord`]
//! - Shadow records carry three metadata columns: `record_id`,
//!   `encoded_values` and `change_type`
//! - Backing stores provide atomic batches and predicate queries, nothing more
//! - Sync cursor and bootstrap flags live outside the backing store
//!
//! ## Available Backends
//!
//! - [`InMemoryBackingStore`] - For testing and ephemeral stores
//! - [`FileBackingStore`] - CBOR snapshot in a locked store directory
//!
//! ## Example
//!
//! ```rust
//! use zonesync_protocol::{ChangeType, RecordId};
//! use zonesync_storage::{BackingStore, InMemoryBackingStore, ShadowRecord, WriteBatch};
//!
//! let store = InMemoryBackingStore::new();
//! let mut record = ShadowRecord::new("Note", RecordId::from("n1"));
//! record.change_type = ChangeType::Updated;
//!
//! let id = store.allocate_id().unwrap();
//! let mut batch = WriteBatch::new();
//! batch.insert(id, record);
//! store.commit(batch).unwrap();
//! assert!(store.get(id).unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod query;
mod record;
mod schema;
mod state;

pub use backend::{BackingStore, WriteBatch, WriteOp};
pub use error::{StorageError, StorageResult};
pub use file::FileBackingStore;
pub use memory::InMemoryBackingStore;
pub use query::{Predicate, ShadowQuery, SortKey};
pub use record::{BackingId, Edge, ShadowRecord};
pub use schema::{
    AttributeDescription, AttributeType, EntityDescription, EntityModel, FieldMap,
    RelationshipDescription, ShadowSchema, CHANGE_TYPE_ATTRIBUTE, ENCODED_VALUES_ATTRIBUTE,
    RECORD_ID_ATTRIBUTE,
};
pub use state::{FileStateStore, MemoryStateStore, SyncStateSnapshot, SyncStateStore};
