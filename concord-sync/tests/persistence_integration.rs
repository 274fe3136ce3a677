//! Persistence integration tests.
//!
//! Verifies:
//! - Canonical state survives a handler restart on RocksDB
//! - Version history survives a restart and numbering continues
//! - Multi-document isolation under persistence
//! - Version races reconcile to a single row on RocksDB

use std::sync::Arc;

use concord_sync::{
    CrdtSubstrate, EngineConfig, RetryPolicy, RocksStore, StoreConfig, SyncHandler, SyncStore,
    VersionDraft, VersionManager, YrsSubstrate, YrsWriter,
};
use futures_util::future::join_all;
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_handler(path: &std::path::Path) -> (Arc<RocksStore>, SyncHandler) {
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap());
    let handler = SyncHandler::new(
        Arc::new(YrsSubstrate::new()),
        store.clone(),
        EngineConfig::for_testing(),
    );
    (store, handler)
}

async fn content(handler: &SyncHandler, doc: Uuid) -> String {
    let state = handler.get_state(doc).await.unwrap();
    handler.substrate().project(&state.payload).unwrap().content
}

// ─── Restart ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_and_versions_survive_restart() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    let writer = YrsWriter::new(42);

    let state_before = {
        let (store, handler) = open_handler(dir.path());
        for word in ["alpha ", "beta ", "gamma"] {
            handler
                .push_update(doc, &writer.append_text(word), None, "writer")
                .await
                .unwrap();
        }
        store.sync().unwrap();
        handler.get_state(doc).await.unwrap()
    };

    let (_store, handler) = open_handler(dir.path());
    let state_after = handler.get_state(doc).await.unwrap();
    assert_eq!(state_after, state_before);
    assert_eq!(content(&handler, doc).await, "alpha beta gamma");
    assert_eq!(handler.documents().await.unwrap(), vec![doc]);

    let versions = handler.list_versions(doc).await.unwrap();
    assert_eq!(versions.len(), 1);
    let v1 = handler.get_version(doc, 1).await.unwrap().unwrap();
    assert_eq!(v1.content, "alpha beta gamma");
    assert_eq!(v1.created_by, "writer");
}

#[tokio::test]
async fn test_version_numbering_continues_after_restart() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    let writer = YrsWriter::new(7);

    {
        let (_store, handler) = open_handler(dir.path());
        let updates: Vec<Vec<u8>> = (0..3).map(|i| writer.append_text(&i.to_string())).collect();
        let out = handler.push_batch(doc, &updates, "batch").await.unwrap();
        assert_eq!(out.version, Some(1));
    }

    let (_store, handler) = open_handler(dir.path());
    let updates: Vec<Vec<u8>> = (3..6).map(|i| writer.append_text(&i.to_string())).collect();
    let out = handler.push_batch(doc, &updates, "batch").await.unwrap();
    assert_eq!(out.version, Some(2));

    let latest = handler.latest_version(doc).await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.content, "012345");
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let dir = tempdir().unwrap();
    let (_store, handler) = open_handler(dir.path());
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    handler
        .push_update(doc_a, &YrsWriter::new(1).append_text("only in a"), None, "a")
        .await
        .unwrap();
    handler
        .push_update(doc_b, &YrsWriter::new(2).append_text("only in b"), None, "b")
        .await
        .unwrap();

    assert_eq!(content(&handler, doc_a).await, "only in a");
    assert_eq!(content(&handler, doc_b).await, "only in b");

    let mut docs = handler.documents().await.unwrap();
    docs.sort();
    let mut expected = vec![doc_a, doc_b];
    expected.sort();
    assert_eq!(docs, expected);
}

// ─── Version races ───────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rocks_version_race_leaves_one_row() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let versions = Arc::new(VersionManager::new(store.clone(), RetryPolicy::for_testing()));
    let doc = Uuid::new_v4();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let versions = versions.clone();
            tokio::spawn(async move {
                let draft = VersionDraft {
                    content: format!("draft {i}"),
                    snapshot: vec![i as u8; 16],
                    created_by: format!("writer-{i}"),
                };
                versions.create_version(doc, draft).await.unwrap()
            })
        })
        .collect();
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    // Every row that survives is the unique holder of its number.
    let rows = store.list_versions(doc).unwrap();
    let mut numbers: Vec<u64> = rows.iter().map(|r| r.version).collect();
    let total = numbers.len();
    numbers.dedup();
    assert_eq!(numbers.len(), total);
    assert!(numbers.contains(&1));

    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().any(|o| o.is_created()));
    for row in &rows {
        assert!(outcomes.iter().any(|o| o.winner().id == row.id));
    }
}
