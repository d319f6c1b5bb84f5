//! Property-based test generators using proptest.
//!
//! Edit sequences address notes by position among the notes the sequence
//! has created so far, so every generated sequence is valid for any store.

use crate::fixtures::TestStore;
use proptest::prelude::*;
use zonesync_engine::ObjectId;

/// One local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    /// Insert a note with this title.
    Insert(String),
    /// Retitle the live note at this position (modulo the live count).
    Rename(usize, String),
    /// Delete the live note at this position (modulo the live count).
    Delete(usize),
}

/// Strategy for generating note titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9 ]{0,15}").expect("Invalid regex")
}

/// Strategy for generating a single edit.
pub fn edit_op_strategy() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        3 => title_strategy().prop_map(EditOp::Insert),
        2 => (any::<usize>(), title_strategy()).prop_map(|(at, title)| EditOp::Rename(at, title)),
        1 => any::<usize>().prop_map(EditOp::Delete),
    ]
}

/// Strategy for generating edit sequences of up to `max_len` edits.
pub fn edit_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<EditOp>> {
    prop::collection::vec(edit_op_strategy(), 1..=max_len)
}

/// Applies edits to a store and returns the notes still alive.
///
/// Renames and deletes with no live note are skipped.
pub fn apply_edits(store: &TestStore, ops: &[EditOp]) -> Vec<ObjectId> {
    let mut live: Vec<ObjectId> = Vec::new();
    for op in ops {
        match op {
            EditOp::Insert(title) => live.push(store.insert_note(title)),
            EditOp::Rename(at, title) if !live.is_empty() => {
                let id = &live[at % live.len()];
                store.update_title(id, title);
            }
            EditOp::Delete(at) if !live.is_empty() => {
                let id = live.remove(at % live.len());
                store.delete(&id);
            }
            _ => {}
        }
    }
    live
}
