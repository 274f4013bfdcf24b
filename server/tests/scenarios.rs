// End-to-end document scenarios through the session hub, without sockets.
// Edits are queued; a snapshot from the same session observes everything
// queued before it, so tests use it as a barrier.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cosheet_config::Role;
use cosheet_engine::{Coord, ErrorKind, Extent, Value};
use cosheet_io::{MemoryStore, SqliteStore};
use cosheet_server::session_server::{
    CoordinatorError, DocumentOptions, DocumentRegistry, Identity, Lifecycle, OutboundEvent,
    RecordingSink, SessionHub,
};

struct Fixture {
    hub: Arc<SessionHub>,
    sink: Arc<RecordingSink>,
    store: Arc<MemoryStore>,
}

fn options() -> DocumentOptions {
    DocumentOptions {
        default_extent: Extent::new(50, 20),
        limits: Extent::new(1000, 100),
        idle_grace: Duration::from_millis(50),
        load_timeout: Duration::from_secs(2),
    }
}

fn fixture_with(store: MemoryStore, options: DocumentOptions) -> Fixture {
    let store = Arc::new(store);
    let sink = Arc::new(RecordingSink::new());
    let registry = DocumentRegistry::new(store.clone(), sink.clone(), options);
    Fixture {
        hub: Arc::new(SessionHub::new(registry)),
        sink,
        store,
    }
}

fn fixture() -> Fixture {
    fixture_with(MemoryStore::new(), options())
}

fn a1(s: &str) -> Coord {
    Coord::parse_a1(s).unwrap()
}

fn open(hub: &SessionHub, user: &str, role: Role) -> String {
    hub.open_session(&Identity {
        user_id: user.to_string(),
        role,
    })
}

fn value_in(hub: &SessionHub, session: &str, doc: &str, cell: &str) -> Value {
    let outcome = hub.snapshot(session, doc).unwrap();
    outcome
        .snapshot
        .cell(a1(cell))
        .map(|u| u.value.clone())
        .unwrap_or(Value::Empty)
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_unseen_document_starts_empty_at_default_extent() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);

    let outcome = f.hub.join(&alice, "fresh").unwrap();
    assert_eq!(outcome.snapshot.version, 0);
    assert_eq!(outcome.snapshot.extent, Extent::new(50, 20));
    assert!(outcome.snapshot.cells.is_empty());
    assert_eq!(outcome.presence.len(), 1);
    assert!(wait_for(Duration::from_secs(1), || {
        f.hub.lifecycle("fresh") == Lifecycle::Active
    }));
}

#[test]
fn test_chain_recalculates_in_dependency_order() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    let bob = open(&f.hub, "bob", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.join(&bob, "doc").unwrap();

    f.hub.edit(&alice, "doc", a1("A1"), "5").unwrap();
    f.hub.edit(&alice, "doc", a1("B1"), "=A1*2").unwrap();
    f.hub.edit(&alice, "doc", a1("C1"), "=B1+1").unwrap();
    f.hub.edit(&alice, "doc", a1("A1"), "10").unwrap();
    assert_eq!(value_in(&f.hub, &alice, "doc", "C1"), Value::Number(21.0));

    let seen_by_bob = f.sink.change_sets_for(&bob);
    assert_eq!(seen_by_bob.len(), 4);
    let last = seen_by_bob.last().unwrap();
    assert_eq!(last.version, 4);
    assert_eq!(last.coords(), vec![a1("A1"), a1("B1"), a1("C1")]);
    let values: Vec<Value> = last.cells.iter().map(|c| c.value.clone()).collect();
    assert_eq!(
        values,
        vec![Value::Number(10.0), Value::Number(20.0), Value::Number(21.0)]
    );
    assert_eq!(f.sink.change_sets_for(&alice), seen_by_bob);
}

#[test]
fn test_cycle_marks_only_the_closing_cell() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();

    f.hub.edit(&alice, "doc", a1("A1"), "=B1").unwrap();
    f.hub.edit(&alice, "doc", a1("B1"), "=A1").unwrap();
    assert_eq!(
        value_in(&f.hub, &alice, "doc", "B1"),
        Value::Error(ErrorKind::Cycle)
    );

    let last = f.sink.change_sets_for(&alice).pop().unwrap();
    assert_eq!(last.coords(), vec![a1("B1")]);
    assert_eq!(last.version, 2);
}

#[test]
fn test_out_of_bounds_edit_is_rejected_to_submitter() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    let bob = open(&f.hub, "bob", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.join(&bob, "doc").unwrap();
    f.sink.clear();

    f.hub.edit(&alice, "doc", Coord::new(50, 0), "1").unwrap();
    let outcome = f.hub.snapshot(&alice, "doc").unwrap();
    assert_eq!(outcome.snapshot.version, 0);

    assert!(matches!(
        f.sink.events_for(&alice).as_slice(),
        [OutboundEvent::Rejected { error: CoordinatorError::OutOfBounds { .. }, .. }]
    ));
    assert!(f.sink.events_for(&bob).is_empty());
}

#[test]
fn test_resize_then_edit_in_new_area() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();

    f.hub.edit(&alice, "doc", a1("A1"), "=A60*2").unwrap();
    assert_eq!(value_in(&f.hub, &alice, "doc", "A1"), Value::Error(ErrorKind::Ref));

    f.hub.resize(&alice, "doc", Extent::new(100, 20)).unwrap();
    f.hub.edit(&alice, "doc", a1("A60"), "4").unwrap();
    assert_eq!(value_in(&f.hub, &alice, "doc", "A1"), Value::Number(8.0));

    f.hub.resize(&alice, "doc", Extent::new(10, 20)).unwrap();
    let outcome = f.hub.snapshot(&alice, "doc").unwrap();
    assert_eq!(outcome.snapshot.extent, Extent::new(100, 20));
    assert!(f.sink.events_for(&alice).iter().any(|e| matches!(
        e,
        OutboundEvent::Rejected { error: CoordinatorError::InvalidResize { .. }, .. }
    )));
}

#[test]
fn test_viewer_cannot_edit() {
    let f = fixture();
    let viewer = open(&f.hub, "vera", Role::Viewer);
    f.hub.join(&viewer, "doc").unwrap();

    assert_eq!(
        f.hub.edit(&viewer, "doc", a1("A1"), "1"),
        Err(CoordinatorError::ReadOnly)
    );
    assert_eq!(
        f.hub.resize(&viewer, "doc", Extent::new(60, 20)),
        Err(CoordinatorError::ReadOnly)
    );
    assert!(f.hub.snapshot(&viewer, "doc").is_ok());
}

#[test]
fn test_edit_requires_attachment_to_that_document() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    assert_eq!(
        f.hub.edit(&alice, "doc", a1("A1"), "1"),
        Err(CoordinatorError::NotAttached)
    );

    f.hub.join(&alice, "doc").unwrap();
    assert_eq!(
        f.hub.edit(&alice, "other", a1("A1"), "1"),
        Err(CoordinatorError::NotAttached)
    );
    assert_eq!(f.hub.leave(&alice, "other"), Err(CoordinatorError::NotAttached));
}

#[test]
fn test_join_moves_session_between_documents() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    let bob = open(&f.hub, "bob", Role::Editor);
    f.hub.join(&alice, "first").unwrap();
    f.hub.join(&bob, "first").unwrap();

    f.hub.join(&alice, "second").unwrap();
    assert_eq!(f.hub.sessions().current_document(&alice).as_deref(), Some("second"));
    assert_eq!(f.hub.presence("first").len(), 1);

    let outcome = f.hub.snapshot(&bob, "first").unwrap();
    assert_eq!(outcome.presence.len(), 1);
    assert_eq!(outcome.presence[0].user_id, "bob");
    assert_eq!(
        f.hub.snapshot(&alice, "first").unwrap_err(),
        CoordinatorError::NotAttached
    );
}

#[test]
fn test_idle_document_persists_and_reloads() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.edit(&alice, "doc", a1("A1"), "2").unwrap();
    f.hub.edit(&alice, "doc", a1("A2"), "=A1^10").unwrap();
    f.hub.edit(&alice, "doc", a1("B1"), "note").unwrap();
    f.hub.leave(&alice, "doc").unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
        f.hub.lifecycle("doc") == Lifecycle::Inactive
    }));
    assert!(f.store.contains("doc"));
    assert_eq!(f.store.save_count(), 1);

    let outcome = f.hub.join(&alice, "doc").unwrap();
    assert_eq!(outcome.snapshot.version, 3);
    assert_eq!(
        outcome.snapshot.cell(a1("A2")).unwrap().value,
        Value::Number(1024.0)
    );
    assert_eq!(outcome.snapshot.cell(a1("B1")).unwrap().raw_input, "note");
}

#[test]
fn test_rejoin_while_draining_keeps_document_resident() {
    let f = fixture_with(
        MemoryStore::new(),
        DocumentOptions {
            idle_grace: Duration::from_secs(5),
            ..options()
        },
    );
    let alice = open(&f.hub, "alice", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.edit(&alice, "doc", a1("A1"), "7").unwrap();
    f.hub.leave(&alice, "doc").unwrap();

    assert!(wait_for(Duration::from_secs(1), || {
        f.hub.lifecycle("doc") == Lifecycle::Draining
    }));
    let outcome = f.hub.join(&alice, "doc").unwrap();
    assert_eq!(outcome.snapshot.version, 1);
    assert!(wait_for(Duration::from_secs(1), || {
        f.hub.lifecycle("doc") == Lifecycle::Active
    }));
    assert_eq!(f.store.save_count(), 0);
}

#[test]
fn test_failed_save_keeps_document_resident() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.edit(&alice, "doc", a1("A1"), "1").unwrap();
    f.store.set_fail_saves(true);
    f.hub.leave(&alice, "doc").unwrap();

    thread::sleep(Duration::from_millis(300));
    assert_eq!(f.hub.lifecycle("doc"), Lifecycle::Draining);
    assert!(!f.store.contains("doc"));

    f.store.set_fail_saves(false);
    assert!(wait_for(Duration::from_secs(2), || {
        f.hub.lifecycle("doc") == Lifecycle::Inactive
    }));
    assert!(f.store.contains("doc"));
}

#[test]
fn test_slow_load_times_out_then_recovers() {
    let f = fixture_with(
        MemoryStore::new().with_load_delay(Duration::from_millis(400)),
        DocumentOptions {
            load_timeout: Duration::from_millis(50),
            ..options()
        },
    );
    let alice = open(&f.hub, "alice", Role::Editor);

    let err = f.hub.join(&alice, "doc").unwrap_err();
    assert_eq!(err.code(), "load_timeout");
    assert_eq!(f.hub.lifecycle("doc"), Lifecycle::Inactive);
    assert_eq!(f.hub.sessions().current_document(&alice), None);

    f.store.set_load_delay(None);
    let outcome = f.hub.join(&alice, "doc").unwrap();
    assert_eq!(outcome.snapshot.version, 0);
}

#[test]
fn test_unavailable_store_fails_join() {
    let f = fixture();
    f.store.set_fail_loads(true);
    let alice = open(&f.hub, "alice", Role::Editor);

    assert!(matches!(
        f.hub.join(&alice, "doc"),
        Err(CoordinatorError::PersistenceUnavailable(_))
    ));
    assert_eq!(f.hub.lifecycle("doc"), Lifecycle::Inactive);
}

#[test]
fn test_concurrent_editors_converge() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    let bob = open(&f.hub, "bob", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.join(&bob, "doc").unwrap();
    f.hub.edit(&alice, "doc", a1("C1"), "=SUM(A1:B50)").unwrap();

    let writers: Vec<_> = [(alice.clone(), 0usize), (bob.clone(), 1usize)]
        .into_iter()
        .map(|(session, col)| {
            let hub = Arc::clone(&f.hub);
            thread::spawn(move || {
                for row in 0..50 {
                    hub.edit(&session, "doc", Coord::new(row, col), "1").unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let from_alice = f.hub.snapshot(&alice, "doc").unwrap().snapshot;
    let from_bob = f.hub.snapshot(&bob, "doc").unwrap().snapshot;
    assert_eq!(from_alice, from_bob);
    assert_eq!(from_alice.version, 101);
    assert_eq!(from_alice.cell(a1("C1")).unwrap().value, Value::Number(100.0));

    let alice_sets = f.sink.change_sets_for(&alice);
    let versions: Vec<u64> = alice_sets.iter().map(|cs| cs.version).collect();
    assert_eq!(versions, (1..=101).collect::<Vec<_>>());
    assert_eq!(alice_sets, f.sink.change_sets_for(&bob));
}

#[test]
fn test_shutdown_persists_and_refuses() {
    let f = fixture_with(
        MemoryStore::new(),
        DocumentOptions {
            idle_grace: Duration::from_secs(60),
            ..options()
        },
    );
    let alice = open(&f.hub, "alice", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.edit(&alice, "doc", a1("A1"), "42").unwrap();

    assert_eq!(f.hub.shutdown(), 0);
    assert!(f.store.contains("doc"));
    assert_eq!(f.hub.lifecycle("doc"), Lifecycle::Inactive);
    assert_eq!(
        f.hub.join(&alice, "doc").unwrap_err(),
        CoordinatorError::ShuttingDown
    );
}

#[test]
fn test_close_session_leaves_document() {
    let f = fixture();
    let alice = open(&f.hub, "alice", Role::Editor);
    let bob = open(&f.hub, "bob", Role::Editor);
    f.hub.join(&alice, "doc").unwrap();
    f.hub.join(&bob, "doc").unwrap();
    f.sink.clear();

    f.hub.close_session(&bob);
    let outcome = f.hub.snapshot(&alice, "doc").unwrap();
    assert_eq!(outcome.presence.len(), 1);
    assert!(matches!(
        f.sink.events_for(&alice).as_slice(),
        [OutboundEvent::Presence { presence, .. }] if presence.len() == 1
    ));
    assert!(f.hub.sessions().get(&bob).is_none());
}

#[test]
fn test_sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("documents.sqlite");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let hub = SessionHub::new(DocumentRegistry::new(
            store,
            Arc::new(RecordingSink::new()),
            options(),
        ));
        let alice = open(&hub, "alice", Role::Editor);
        hub.join(&alice, "doc").unwrap();
        hub.edit(&alice, "doc", a1("A1"), "3").unwrap();
        hub.edit(&alice, "doc", a1("B1"), "=A1*A1").unwrap();
        hub.edit(&alice, "doc", a1("C1"), "2024-02-29").unwrap();
        assert_eq!(hub.shutdown(), 0);
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let hub = SessionHub::new(DocumentRegistry::new(
        store,
        Arc::new(RecordingSink::new()),
        options(),
    ));
    let bob = open(&hub, "bob", Role::Viewer);
    let outcome = hub.join(&bob, "doc").unwrap();
    assert_eq!(outcome.snapshot.version, 3);
    assert_eq!(outcome.snapshot.cell(a1("B1")).unwrap().value, Value::Number(9.0));
    assert_eq!(outcome.snapshot.cell(a1("C1")).unwrap().value.display(), "2024-02-29");
}
