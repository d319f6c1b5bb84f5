//! A single record zone and its change feed.

use crate::token::TokenBody;
use std::collections::BTreeMap;
use zonesync_protocol::{
    DeleteResult, RecordId, RemoteRecord, SaveResult, VersionTag,
};

#[derive(Debug, Clone)]
struct Entry {
    record: RemoteRecord,
    seq: u64,
}

/// One page of changes.
#[derive(Debug, Default)]
pub(crate) struct ChangePage {
    pub changed: Vec<RemoteRecord>,
    pub deleted: Vec<RecordId>,
    pub position: u64,
    pub more_coming: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Zone {
    epoch: u64,
    seq: u64,
    records: BTreeMap<RecordId, Entry>,
    tombstones: BTreeMap<RecordId, u64>,
}

enum Change<'a> {
    Saved(&'a RemoteRecord),
    Deleted(&'a RecordId),
}

impl Zone {
    pub(crate) fn position(&self) -> TokenBody {
        TokenBody {
            epoch: self.epoch,
            seq: self.seq,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Invalidates every token issued so far.
    pub(crate) fn expire_tokens(&mut self) {
        self.epoch += 1;
    }

    pub(crate) fn record(&self, record_id: &RecordId) -> Option<&RemoteRecord> {
        self.records.get(record_id).map(|entry| &entry.record)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &RemoteRecord> {
        self.records.values().map(|entry| &entry.record)
    }

    /// Latest state of everything changed after `since`, in sequence order.
    pub(crate) fn changes_since(&self, since: u64, limit: usize) -> ChangePage {
        let mut changes: Vec<(u64, Change<'_>)> = self
            .records
            .values()
            .filter(|entry| entry.seq > since)
            .map(|entry| (entry.seq, Change::Saved(&entry.record)))
            .chain(
                self.tombstones
                    .iter()
                    .filter(|(_, seq)| **seq > since)
                    .map(|(id, seq)| (*seq, Change::Deleted(id))),
            )
            .collect();
        changes.sort_by_key(|(seq, _)| *seq);

        let more_coming = changes.len() > limit;
        changes.truncate(limit);

        let mut page = ChangePage {
            position: self.seq,
            more_coming,
            ..ChangePage::default()
        };
        if more_coming {
            if let Some((seq, _)) = changes.last() {
                page.position = *seq;
            }
        }
        for (_, change) in changes {
            match change {
                Change::Saved(record) => page.changed.push(record.clone()),
                Change::Deleted(id) => page.deleted.push(id.clone()),
            }
        }
        page
    }

    /// Stores a record unless its version tag is stale.
    pub(crate) fn save(&mut self, mut record: RemoteRecord, now: u64) -> SaveResult {
        if let Some(entry) = self.records.get(&record.record_id) {
            if record.system.version != entry.record.system.version {
                return SaveResult::VersionConflict {
                    server: entry.record.clone(),
                };
            }
        }

        self.seq += 1;
        record.system.version = Some(VersionTag::new(format!("v{}", self.seq)));
        record.system.modified_at = Some(now);
        self.tombstones.remove(&record.record_id);
        self.records.insert(
            record.record_id.clone(),
            Entry {
                record: record.clone(),
                seq: self.seq,
            },
        );
        SaveResult::Saved(record)
    }

    /// Deletes a record. Deleting an unknown record succeeds.
    pub(crate) fn delete(&mut self, record_id: &RecordId) -> DeleteResult {
        if self.records.remove(record_id).is_some() {
            self.seq += 1;
            self.tombstones.insert(record_id.clone(), self.seq);
        }
        DeleteResult::Deleted
    }
}
