//! File-backed store.
//!
//! Layout of a store directory:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ shadow.cbor       # Snapshot of every shadow record
//! └─ sync_state.cbor   # Sync cursor and bootstrap flags (see FileStateStore)
//! ```
//!
//! Every commit rewrites the snapshot through a temporary file and a rename,
//! so a crash leaves either the old or the new snapshot on disk.

use crate::backend::{BackingStore, WriteBatch};
use crate::error::{StorageError, StorageResult};
use crate::memory::ShadowTable;
use crate::query::ShadowQuery;
use crate::record::{BackingId, ShadowRecord};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use zonesync_protocol::{from_cbor, to_cbor, RecordId};

const LOCK_FILE: &str = "LOCK";
const SHADOW_FILE: &str = "shadow.cbor";

/// A backing store persisted as a CBOR snapshot in a locked directory.
///
/// # Example
///
/// ```rust,ignore
/// use zonesync_storage::FileBackingStore;
///
/// let store = FileBackingStore::open("notes.store", true)?;
/// println!("{} records", store.count()?);
/// ```
#[derive(Debug)]
pub struct FileBackingStore {
    path: PathBuf,
    table: RwLock<ShadowTable>,
    read_only: bool,
    _lock_file: File,
}

impl FileBackingStore {
    /// Opens or creates a store directory with exclusive access.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns [`StorageError::Locked`])
    /// - The snapshot cannot be decoded
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> StorageResult<Self> {
        Self::open_with(path.as_ref(), create_if_missing, false)
    }

    /// Opens an existing store directory for reading only.
    ///
    /// Takes a shared lock, so it can run next to other readers but not
    /// next to a writer.
    ///
    /// # Errors
    ///
    /// Same as [`FileBackingStore::open`].
    pub fn open_read_only(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(path.as_ref(), false, true)
    }

    fn open_with(path: &Path, create_if_missing: bool, read_only: bool) -> StorageResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::corrupted(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(StorageError::corrupted(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        let locked = if read_only {
            FileExt::try_lock_shared(&lock_file)
        } else {
            FileExt::try_lock_exclusive(&lock_file)
        };
        if locked.is_err() {
            return Err(StorageError::Locked);
        }

        let table = load_table(&path.join(SHADOW_FILE))?;
        tracing::debug!(
            path = %path.display(),
            records = table.len(),
            read_only,
            "opened file backing store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            table: RwLock::new(table),
            read_only,
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the store was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

fn load_table(path: &Path) -> StorageResult<ShadowTable> {
    if !path.exists() {
        return Ok(ShadowTable::default());
    }
    let data = fs::read(path)?;
    if data.is_empty() {
        return Ok(ShadowTable::default());
    }
    let mut table: ShadowTable = from_cbor(&data)?;
    table.reindex()?;
    Ok(table)
}

/// Writes `data` to `dir/name` through a temporary file and a rename.
pub(crate) fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> StorageResult<()> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    sync_directory(dir)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

impl BackingStore for FileBackingStore {
    fn allocate_id(&self) -> StorageResult<BackingId> {
        Ok(self.table.write().allocate())
    }

    fn get(&self, id: BackingId) -> StorageResult<Option<ShadowRecord>> {
        Ok(self.table.read().get(id).cloned())
    }

    fn find_by_record_id(
        &self,
        record_id: &RecordId,
    ) -> StorageResult<Option<(BackingId, ShadowRecord)>> {
        Ok(self.table.read().find(record_id))
    }

    fn query(&self, query: &ShadowQuery) -> StorageResult<Vec<(BackingId, ShadowRecord)>> {
        Ok(self.table.read().query(query))
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::CommitFailed("store opened read-only".into()));
        }
        let mut table = self.table.write();
        let next = table.apply(batch)?;
        write_atomic(&self.path, SHADOW_FILE, &to_cbor(&next)?)?;
        *table = next;
        Ok(())
    }

    fn count(&self) -> StorageResult<usize> {
        Ok(self.table.read().len())
    }
}
