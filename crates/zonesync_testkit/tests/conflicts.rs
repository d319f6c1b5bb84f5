//! Concurrent edits of one record under each conflict policy.

use std::collections::BTreeSet;
use std::sync::Arc;
use zonesync_engine::ObjectId;
use zonesync_protocol::{ConflictPolicy, ManualClock, Value};
use zonesync_server::ZoneServer;
use zonesync_testkit::prelude::*;

/// Alice creates a note both stores know about; returns its identity.
fn shared_note(alice: &TestStore, bob: &TestStore) -> ObjectId {
    let id = alice.insert_note("original");
    alice.sync();
    bob.sync();
    id
}

/// Alice edits and pushes first, then Bob edits the same note.
fn diverge(alice: &TestStore, bob: &TestStore, id: &ObjectId) {
    alice.update_title(id, "from alice");
    alice.sync();
    bob.update_title(id, "from bob");
    bob.sync();
}

fn remote_title(zone: &SharedZone, id: &ObjectId) -> Option<String> {
    zone.record(ZONE, id.record_id().unwrap())
        .and_then(|record| record.field("title").and_then(Value::as_text).map(String::from))
}

#[test]
fn server_wins_takes_the_remote_edit() {
    let zone = SharedZone::new();
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options().with_conflict_policy(ConflictPolicy::ServerWins),
    );
    let id = shared_note(&alice, &bob);

    diverge(&alice, &bob, &id);

    assert_eq!(bob.stats().conflicts_resolved, 1);
    assert_eq!(bob.title_of(&id).as_deref(), Some("from alice"));
    assert_eq!(bob.pending(), 0);
    assert_eq!(remote_title(&zone, &id).as_deref(), Some("from alice"));
}

#[test]
fn client_wins_pushes_the_local_edit() {
    let zone = SharedZone::new();
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options().with_conflict_policy(ConflictPolicy::ClientWins),
    );
    let id = shared_note(&alice, &bob);

    diverge(&alice, &bob, &id);
    alice.sync();

    assert_eq!(bob.title_of(&id).as_deref(), Some("from bob"));
    assert_eq!(alice.title_of(&id).as_deref(), Some("from bob"));
    assert_eq!(remote_title(&zone, &id).as_deref(), Some("from bob"));
}

#[test]
fn later_local_edit_wins() {
    let zone = SharedZone::with_server(
        ZoneServer::new().with_clock(Arc::new(ManualClock::new(1_000))),
    );
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options().with_clock(Arc::new(ManualClock::new(5_000))),
    );
    let id = shared_note(&alice, &bob);

    diverge(&alice, &bob, &id);

    assert_eq!(bob.title_of(&id).as_deref(), Some("from bob"));
    assert_eq!(remote_title(&zone, &id).as_deref(), Some("from bob"));
}

#[test]
fn later_remote_edit_wins() {
    let zone = SharedZone::with_server(
        ZoneServer::new().with_clock(Arc::new(ManualClock::new(1_000))),
    );
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options().with_clock(Arc::new(ManualClock::new(500))),
    );
    let id = shared_note(&alice, &bob);

    diverge(&alice, &bob, &id);

    assert_eq!(bob.title_of(&id).as_deref(), Some("from alice"));
    assert_eq!(bob.pending(), 0);
}

#[test]
fn keep_both_forks_the_local_edit() {
    let zone = SharedZone::new();
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options().with_conflict_policy(ConflictPolicy::KeepBoth),
    );
    let id = shared_note(&alice, &bob);

    diverge(&alice, &bob, &id);
    alice.sync();

    let expected = vec!["from alice".to_string(), "from bob".to_string()];
    assert_eq!(bob.titles(), expected);
    assert_eq!(alice.titles(), expected);

    let record_ids: BTreeSet<_> = bob
        .notes()
        .iter()
        .map(|note| note.record_id().unwrap().clone())
        .collect();
    assert_eq!(record_ids.len(), 2);
    for note in bob.notes() {
        assert!(alice.title_of(&note).is_some());
    }
    assert_eq!(zone.records(ZONE).len(), 2);
}

#[test]
fn ask_caller_merges_both_titles() {
    let zone = SharedZone::new();
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options()
            .with_conflict_policy(ConflictPolicy::AskCaller)
            .with_resolver(|local, remote| {
                let title = |record: &zonesync_protocol::RemoteRecord| {
                    record
                        .field("title")
                        .and_then(Value::as_text)
                        .unwrap_or_default()
                        .to_string()
                };
                let merged = format!("{} + {}", title(local), title(remote));
                Ok(local.clone().with_field("title", merged))
            }),
    );
    let id = shared_note(&alice, &bob);

    diverge(&alice, &bob, &id);
    alice.sync();

    let merged = Some("from bob + from alice".to_string());
    assert_eq!(bob.title_of(&id), merged);
    assert_eq!(alice.title_of(&id), merged);
    assert_eq!(bob.pending(), 0);
}

#[test]
fn failing_callback_keeps_local_change_pending() {
    let zone = SharedZone::new();
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options()
            .with_conflict_policy(ConflictPolicy::AskCaller)
            .with_resolver(|_, _| Err("undecided".to_string())),
    );
    let id = shared_note(&alice, &bob);

    diverge(&alice, &bob, &id);
    let report = bob.sync();

    assert!(!report.is_clean());
    assert!(!report.cursor_advanced);
    assert_eq!(bob.title_of(&id).as_deref(), Some("from bob"));
    assert_eq!(bob.pending(), 1);
    assert_eq!(remote_title(&zone, &id).as_deref(), Some("from alice"));
}

#[test]
fn remote_delete_beats_local_edit_under_server_wins() {
    let zone = SharedZone::new();
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options().with_conflict_policy(ConflictPolicy::ServerWins),
    );
    let id = shared_note(&alice, &bob);

    alice.delete(&id);
    alice.sync();
    bob.update_title(&id, "too late");
    bob.sync();

    assert!(bob.titles().is_empty());
    assert_eq!(bob.pending(), 0);
    assert!(zone.records(ZONE).is_empty());
}

#[test]
fn remote_edit_of_a_local_tombstone_under_client_wins_deletes_it() {
    let zone = SharedZone::new();
    let alice = TestStore::memory(&zone);
    let bob = TestStore::memory_with(
        &zone,
        test_options().with_conflict_policy(ConflictPolicy::ClientWins),
    );
    let id = shared_note(&alice, &bob);

    alice.update_title(&id, "edited");
    alice.sync();
    bob.delete(&id);
    bob.sync();
    alice.sync();

    assert!(bob.titles().is_empty());
    assert!(alice.titles().is_empty());
    assert!(zone.records(ZONE).is_empty());
}
