//! Persistence behaviour of the SessionStore across process restarts.

use std::sync::Arc;

use duet_core::config::SessionConfig;
use duet_core::session_store::{SessionStore, SessionStoreError};
use duet_core::types::*;

fn config(max_chars: usize) -> SessionConfig {
    SessionConfig {
        summary_window: 4,
        summary_max_chars: max_chars,
    }
}

fn sid(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}

fn record_task(store: &SessionStore, id: &SessionId, i: usize) -> TaskRecord {
    let task = Task::new(TaskAction::CreateFile, format!("create file {i}"))
        .unwrap()
        .with_target(format!("src/file_{i}.rs"));
    let result = TaskResult::succeeded(format!("wrote file {i} {}", "y".repeat(200)), 1);
    store.append(id, &format!("please create file {i}"), task, result).unwrap()
}

#[test]
fn reload_reproduces_ordered_history() {
    let dir = tempfile::tempdir().unwrap();
    let id = sid("roundtrip");

    let written: Vec<TaskRecord> = {
        let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
        (0..12).map(|i| record_task(&store, &id, i)).collect()
    };

    // A fresh store simulates a process restart.
    let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
    let session = store.resolve(&id).unwrap();

    assert_eq!(session.records(), written.as_slice());
    assert!(session.context_summary().chars().count() <= 300);
    assert!(session.context_summary().contains("file 11"));
}

#[test]
fn summary_stays_bounded_over_long_sessions() {
    let store = SessionStore::in_memory(&config(500));
    let id = sid("long-lived");
    for i in 0..200 {
        record_task(&store, &id, i);
        let summary = store.context_summary(&id).unwrap();
        assert!(summary.chars().count() <= 500);
    }
}

#[test]
fn corrupt_document_surfaces_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();

    let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
    let err = store.resolve(&sid("broken")).unwrap_err();
    assert!(matches!(err, SessionStoreError::Corrupt { .. }));
    assert!(err.to_string().contains("broken"));

    // The corrupt file is left in place for inspection, not replaced.
    let data = std::fs::read_to_string(dir.path().join("broken.json")).unwrap();
    assert_eq!(data, "{ not json");
}

#[test]
fn list_skips_corrupt_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
    store.resolve(&sid("good")).unwrap();
    std::fs::write(dir.path().join("bad.json"), "[]").unwrap();

    let sessions = store.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, sid("good"));
}

#[test]
fn delivery_state_persists() {
    let dir = tempfile::tempdir().unwrap();
    let id = sid("deliveries");
    {
        let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
        record_task(&store, &id, 0);
        record_task(&store, &id, 1);
        store.mark_delivery(&id, 0, DeliveryState::Delivered).unwrap();
    }

    let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
    let pending = store.pending_deliveries().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].0, id);
    assert_eq!(pending[0].1.seq, 1);
}

#[test]
fn concurrent_resolve_never_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(dir.path().to_path_buf(), &config(300)));
    let id = sid("shared");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let id = id.clone();
            std::thread::spawn(move || store.resolve(&id).unwrap().created_at)
        })
        .collect();
    let created: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(created.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(store.list_sessions().unwrap().len(), 1);
}

#[test]
fn concurrent_appends_keep_dense_sequence() {
    let store = Arc::new(SessionStore::in_memory(&config(300)));
    let id = sid("busy");

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = Arc::clone(&store);
            let id = id.clone();
            std::thread::spawn(move || {
                record_task(&store, &id, i);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let session = store.resolve(&id).unwrap();
    let seqs: Vec<u64> = session.records().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (0..16).collect::<Vec<u64>>());
}

#[test]
fn reload_with_smaller_bound_reapplies_it() {
    let dir = tempfile::tempdir().unwrap();
    let id = sid("shrinking");
    {
        let store = SessionStore::new(dir.path().to_path_buf(), &config(2000));
        for i in 0..3 {
            record_task(&store, &id, i);
        }
        assert!(store.context_summary(&id).unwrap().chars().count() > 50);
    }

    let store = SessionStore::new(dir.path().to_path_buf(), &config(50));
    let summary = store.context_summary(&id).unwrap();
    assert!(!summary.is_empty());
    assert!(summary.chars().count() <= 50, "summary has {} chars", summary.chars().count());

    let listed = store.list_sessions().unwrap();
    assert!(listed[0].context_summary().chars().count() <= 50);
}

#[test]
fn failed_delivery_persist_keeps_delivered_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
    let id = sid("flaky-disk");
    record_task(&store, &id, 0);

    // A directory where the document should be makes the rename fail.
    let doc = dir.path().join("flaky-disk.json");
    std::fs::remove_file(&doc).unwrap();
    std::fs::create_dir(&doc).unwrap();

    assert!(store.mark_delivery(&id, 0, DeliveryState::Delivered).is_err());
    let session = store.resolve(&id).unwrap();
    assert_eq!(session.records()[0].delivery, DeliveryState::Delivered);
    assert!(store.pending_deliveries().unwrap().is_empty());
}

#[test]
fn get_does_not_create_unknown_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().to_path_buf(), &config(300));

    assert!(store.get(&sid("typo")).unwrap().is_none());
    assert!(!dir.path().join("typo.json").exists());
    assert_eq!(store.cached_sessions(), 0);

    record_task(&store, &sid("real"), 0);
    assert_eq!(store.get(&sid("real")).unwrap().unwrap().task_count(), 1);
}

#[test]
fn evicted_session_reloads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().to_path_buf(), &config(300));
    let id = sid("evictable");
    record_task(&store, &id, 0);
    assert_eq!(store.cached_sessions(), 1);

    assert!(store.evict(&id));
    assert_eq!(store.cached_sessions(), 0);
    assert_eq!(store.list_sessions().unwrap().len(), 1);
    assert_eq!(store.cached_sessions(), 0);

    assert_eq!(store.resolve(&id).unwrap().task_count(), 1);
}

#[test]
fn in_memory_sessions_are_never_evicted() {
    let store = SessionStore::in_memory(&config(300));
    let id = sid("ephemeral");
    record_task(&store, &id, 0);
    assert!(!store.evict(&id));
    assert_eq!(store.resolve(&id).unwrap().task_count(), 1);
}
