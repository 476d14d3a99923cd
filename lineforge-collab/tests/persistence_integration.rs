//! Persistence tests: the shared snapshot survives a store restart.

use std::sync::Arc;

use lineforge_collab::snapshot::{DiffOperation, KeyFilter, ReconcileStatus, SnapshotHandle, StateStore};
use lineforge_collab::storage::{SnapshotDb, StoreConfig};
use tempfile::TempDir;
use tokio::time::{sleep, Duration};

/// Open the database, retrying while a previous actor is still releasing it.
async fn open_db(dir: &TempDir) -> SnapshotDb {
    for _ in 0..100 {
        if let Ok(db) = SnapshotDb::open(StoreConfig::for_testing(dir.path())) {
            return db;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("database still locked");
}

async fn open_store(dir: &TempDir) -> SnapshotHandle {
    let db = open_db(dir).await;
    SnapshotHandle::spawn_persistent(KeyFilter::default(), Arc::new(db)).unwrap()
}

#[tokio::test]
async fn test_applied_operations_survive_restart() {
    let dir = TempDir::new().unwrap();

    let store = open_store(&dir).await;
    let base = store.get_state().await.unwrap().checksum;
    store
        .apply_operations(
            base,
            vec![
                DiffOperation::set("project:line:1", r#"{"points":[1,2]}"#),
                DiffOperation::set("settings:units", "feet"),
            ],
        )
        .await
        .unwrap();
    let before = store.get_state().await.unwrap();
    drop(store);

    let reopened = open_store(&dir).await;
    let after = reopened.get_state().await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.snapshot, before.snapshot);
    assert_eq!(after.checksum, before.checksum);
}

#[tokio::test]
async fn test_reconcile_result_is_persisted() {
    let dir = TempDir::new().unwrap();

    let store = open_store(&dir).await;
    let outcome = store
        .reconcile(
            7,
            [("alpha".to_string(), "1".to_string())].into_iter().collect(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, ReconcileStatus::ServerUpdated);
    drop(store);

    let reopened = open_store(&dir).await;
    let state = reopened.get_state().await.unwrap();
    assert_eq!(state.version, 7);
    assert_eq!(state.snapshot.get("alpha").map(String::as_str), Some("1"));
    assert!(state.updated_at.is_some());

    let stale = reopened.reconcile(3, Default::default()).await.unwrap();
    assert_eq!(stale.status, ReconcileStatus::ClientStale);
}
