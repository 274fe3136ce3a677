//! End-to-end engine scenarios.
//!
//! Verifies:
//! - Merge commutativity and idempotence through the handler
//! - Version uniqueness under 10 concurrent writers
//! - Conflict symmetry (lag is never a conflict)
//! - Offline queue bound and eviction order
//! - Evicted yrs edits still converge after reconnect
//! - Count-triggered versioning with out-of-order arrival
//! - Offline divergence escalating to `Conflict`

use std::sync::{Arc, Mutex};

use concord_sync::{
    Classification, CrdtSubstrate, DocumentVersion, EngineConfig, MemoryStore, OfflineConfig,
    OfflineReconciler, OperationKind, ReconcileEvent, ReconcileState, ResolutionStrategy,
    RetryPolicy, StoreError, SyncHandler, SyncStore, UnionCrdt, UnionWriter, VersionDraft,
    VersionManager, YrsSubstrate, YrsWriter,
};
use futures_util::future::join_all;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn union_handler(config: EngineConfig) -> Arc<SyncHandler> {
    Arc::new(SyncHandler::new(
        Arc::new(UnionCrdt::new()),
        Arc::new(MemoryStore::new()),
        config,
    ))
}

fn yrs_handler() -> Arc<SyncHandler> {
    Arc::new(SyncHandler::new(
        Arc::new(YrsSubstrate::new()),
        Arc::new(MemoryStore::new()),
        EngineConfig::for_testing(),
    ))
}

async fn content(handler: &SyncHandler, doc: Uuid) -> String {
    let state = handler.get_state(doc).await.unwrap();
    handler.substrate().project(&state.payload).unwrap().content
}

/// Store wrapper that remembers every version row ever inserted.
struct RecordingStore {
    inner: MemoryStore,
    inserted: Mutex<Vec<DocumentVersion>>,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            inserted: Mutex::new(Vec::new()),
        }
    }
}

impl SyncStore for RecordingStore {
    fn load_state(&self, doc_id: Uuid) -> Result<Option<concord_sync::ReplicaState>, StoreError> {
        self.inner.load_state(doc_id)
    }
    fn save_state(&self, doc_id: Uuid, state: &concord_sync::ReplicaState) -> Result<(), StoreError> {
        self.inner.save_state(doc_id, state)
    }
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.list_documents()
    }
    fn insert_version(&self, version: &DocumentVersion) -> Result<(), StoreError> {
        self.inner.insert_version(version)?;
        self.inserted.lock().unwrap().push(version.clone());
        Ok(())
    }
    fn highest_version(&self, doc_id: Uuid) -> Result<Option<u64>, StoreError> {
        self.inner.highest_version(doc_id)
    }
    fn versions_at(&self, doc_id: Uuid, version: u64) -> Result<Vec<DocumentVersion>, StoreError> {
        self.inner.versions_at(doc_id, version)
    }
    fn delete_version(&self, row: &DocumentVersion) -> Result<(), StoreError> {
        self.inner.delete_version(row)
    }
    fn list_versions(&self, doc_id: Uuid) -> Result<Vec<DocumentVersion>, StoreError> {
        self.inner.list_versions(doc_id)
    }
}

// ─── Merge properties ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_commutativity_through_handler() {
    let handler = yrs_handler();
    let a = YrsWriter::new(1);
    let b = YrsWriter::new(2);
    let u1 = a.append_text("first writer ");
    let u2 = b.append_text("second writer");

    let doc_x = Uuid::new_v4();
    let doc_y = Uuid::new_v4();
    handler.push_update(doc_x, &u1, None, "a").await.unwrap();
    handler.push_update(doc_x, &u2, None, "b").await.unwrap();
    handler.push_update(doc_y, &u2, None, "b").await.unwrap();
    handler.push_update(doc_y, &u1, None, "a").await.unwrap();

    assert_eq!(content(&handler, doc_x).await, content(&handler, doc_y).await);
}

#[tokio::test]
async fn test_idempotence_through_handler() {
    let handler = yrs_handler();
    let doc = Uuid::new_v4();
    let update = YrsWriter::new(7).append_text("exactly once");

    assert!(handler.push_update(doc, &update, None, "a").await.unwrap().merged);
    let before = content(&handler, doc).await;
    assert!(!handler.push_update(doc, &update, None, "a").await.unwrap().merged);
    assert_eq!(content(&handler, doc).await, before);
}

#[tokio::test]
async fn test_concurrent_pushes_lose_nothing() {
    let handler = union_handler(EngineConfig::for_testing());
    let doc = Uuid::new_v4();

    let tasks: Vec<_> = (1..=20u64)
        .map(|client| {
            let handler = handler.clone();
            tokio::spawn(async move {
                let update = UnionWriter::new(client).insert_text("x");
                handler.push_update(doc, &update, None, "w").await.unwrap();
            })
        })
        .collect();
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(content(&handler, doc).await.len(), 20);
}

// ─── Version uniqueness ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_writers_race_for_version_seven() {
    let store = Arc::new(RecordingStore::new());
    let versions = Arc::new(VersionManager::new(store.clone(), RetryPolicy::for_testing()));
    let doc = Uuid::new_v4();

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let versions = versions.clone();
            tokio::spawn(async move {
                let draft = VersionDraft {
                    content: format!("writer {i}"),
                    snapshot: vec![i as u8],
                    created_by: format!("writer-{i}"),
                };
                versions.claim_version(doc, 7, draft).await.unwrap()
            })
        })
        .collect();
    let outcomes: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let rows = store.versions_at(doc, 7).unwrap();
    assert_eq!(rows.len(), 1);

    let inserted = store.inserted.lock().unwrap().clone();
    assert_eq!(inserted.len(), 10);
    let earliest = inserted.iter().min_by_key(|r| r.race_key()).unwrap();
    assert_eq!(rows[0].id, earliest.id);
    assert!(outcomes.iter().any(|o| o.winner().id == earliest.id));
}

#[tokio::test]
async fn test_versions_stay_gapless() {
    let store = Arc::new(MemoryStore::new());
    let versions = VersionManager::new(store.clone(), RetryPolicy::for_testing());
    let doc = Uuid::new_v4();

    for i in 0..5 {
        let draft = VersionDraft {
            content: i.to_string(),
            snapshot: vec![],
            created_by: "w".into(),
        };
        versions.create_version(doc, draft).await.unwrap();
    }
    let numbers: Vec<u64> = store
        .list_versions(doc)
        .unwrap()
        .iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

// ─── Conflict symmetry ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_lag_is_never_reported_as_conflict() {
    let handler = yrs_handler();
    let doc = Uuid::new_v4();
    let writer = YrsWriter::new(3);
    handler
        .push_update(doc, &writer.append_text("shared base"), None, "w")
        .await
        .unwrap();
    let behind = handler.get_state(doc).await.unwrap().payload;

    handler
        .push_update(doc, &writer.append_text(" and more"), None, "w")
        .await
        .unwrap();
    let ahead = handler.get_state(doc).await.unwrap().payload;

    // Stale replica against canonical, and canonical against stale replica.
    assert!(handler.detect_conflict(doc, &behind).await.unwrap().is_empty());
    assert!(handler.classifier().classify(&ahead, &behind).is_empty());
}

// ─── Queue bound ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_queue_keeps_newest_max_size_entries() {
    let handler = union_handler(EngineConfig::for_testing());
    let config = OfflineConfig {
        max_queue_size: 5,
        ..OfflineConfig::for_testing()
    };
    let client = OfflineReconciler::new(Uuid::new_v4(), handler, config, "c").unwrap();
    let mut w = UnionWriter::new(1);

    client.go_offline().await.unwrap();
    let mut ids = Vec::new();
    for i in 0..8 {
        client
            .record_local_edit(OperationKind::ContentEdit, w.insert_text(&i.to_string()))
            .await
            .unwrap();
        ids.push(client.queued_operations().await.last().unwrap().id);
    }

    let queued: Vec<Uuid> = client.queued_operations().await.iter().map(|op| op.id).collect();
    assert_eq!(queued.len(), 5);
    assert_eq!(queued, ids[3..].to_vec());
    assert_eq!(client.queue_stats().await.evicted, 3);
}

#[tokio::test]
async fn test_yrs_overflow_still_converges_after_reconnect() {
    let handler = yrs_handler();
    let doc = Uuid::new_v4();
    let config = OfflineConfig {
        max_queue_size: 2,
        ..OfflineConfig::for_testing()
    };
    let client = OfflineReconciler::new(doc, handler.clone(), config, "c").unwrap();
    let writer = YrsWriter::new(9);

    client.go_offline().await.unwrap();
    for text in ["aaa", "bbb", "ccc"] {
        client
            .record_local_edit(OperationKind::ContentEdit, writer.append_text(text))
            .await
            .unwrap();
    }
    assert_eq!(client.queue_stats().await.evicted, 1);

    // Surviving entries depend on the evicted one; the catch-up diff
    // delivers it so they can integrate.
    assert_eq!(client.reconnect().await.unwrap(), ReconcileState::Online);
    assert_eq!(content(&handler, doc).await, "aaabbbccc");
    assert_eq!(client.local_projection().await.unwrap().content, "aaabbbccc");

    client
        .record_local_edit(OperationKind::ContentEdit, writer.append_text("ddd"))
        .await
        .unwrap();
    assert_eq!(content(&handler, doc).await, "aaabbbcccddd");
}

// ─── Snapshot trigger scenario ───────────────────────────────────────────────

#[tokio::test]
async fn test_threshold_three_creates_one_version_after_third_update() {
    let handler = union_handler(EngineConfig::for_testing());
    let doc = Uuid::new_v4();
    let mut r1 = UnionWriter::new(1);
    let mut r2 = UnionWriter::new(2);
    let mut r3 = UnionWriter::new(3);
    let u1 = r1.insert_text("one ");
    let u2 = r2.insert_text("two ");
    let u3 = r3.insert_text("three ");
    let u4 = r1.insert_text("four ");
    let u5 = r2.insert_text("five");

    let mut created = Vec::new();
    for update in [&u2, &u1, &u3, &u5, &u4] {
        let out = handler.push_update(doc, update, None, "sync").await.unwrap();
        created.push(out.version);
    }
    assert_eq!(created, vec![None, None, Some(1), None, None]);

    let versions = handler.list_versions(doc).await.unwrap();
    assert_eq!(versions.len(), 1);

    let substrate = UnionCrdt::new();
    let expected = substrate
        .project(&substrate.merge_updates(&[u1, u2, u3]).unwrap())
        .unwrap()
        .content;
    let v1 = handler.get_version(doc, 1).await.unwrap().unwrap();
    assert_eq!(v1.content, expected);
}

// ─── Offline reconciliation ──────────────────────────────────────────────────

#[tokio::test]
async fn test_divergent_offline_edit_escalates_to_conflict() {
    let handler = yrs_handler();
    let doc = Uuid::new_v4();

    // Shared baseline: metadata only.
    let alice = YrsWriter::new(10);
    let bob = YrsWriter::new(20);
    let baseline = alice.set_meta("title", "Notes");
    handler.push_update(doc, &baseline, None, "alice").await.unwrap();
    bob.apply(&baseline).unwrap();

    let mut client = OfflineReconciler::new(doc, handler.clone(), OfflineConfig::for_testing(), "alice")
        .unwrap();
    let mut events = client.take_event_rx().unwrap();
    client.pull().await.unwrap();

    client.go_offline().await.unwrap();
    client
        .record_local_edit(OperationKind::ContentEdit, alice.append_text("abcdefghij"))
        .await
        .unwrap();
    handler
        .push_update(doc, &bob.append_text("abklmnopqr"), None, "bob")
        .await
        .unwrap();

    assert_eq!(client.reconnect().await.unwrap(), ReconcileState::Conflict);
    let reports = client.pending_reports().await;
    let content_report = reports.iter().find(|r| r.path == "content").unwrap();
    assert_eq!(content_report.classification, Classification::MajorContentConflict);
    assert!(!content_report.auto_resolvable);
    assert!((content_report.similarity.unwrap() - 0.2).abs() < 1e-9);

    // Nothing was replayed while the conflict is pending.
    assert_eq!(client.queue_len().await, 1);
    assert_eq!(content(&handler, doc).await, "abklmnopqr");

    assert_eq!(
        client.resolve(ResolutionStrategy::Merge).await.unwrap(),
        ReconcileState::Online
    );
    let merged = content(&handler, doc).await;
    assert!(merged.contains("abcdefghij") && merged.contains("abklmnopqr"));

    let mut saw_conflict = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ReconcileEvent::ConflictDetected { .. }) {
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);
}

#[tokio::test]
async fn test_auto_resolve_merges_minor_conflict() {
    let handler = union_handler(EngineConfig::for_testing());
    let doc = Uuid::new_v4();
    handler
        .push_update(doc, &UnionWriter::new(100).insert_text("The quick brown fox"), None, "base")
        .await
        .unwrap();

    let config = OfflineConfig {
        auto_resolve: true,
        ..OfflineConfig::for_testing()
    };
    let client = OfflineReconciler::new(doc, handler.clone(), config, "me").unwrap();
    client.pull().await.unwrap();
    client.go_offline().await.unwrap();
    client
        .record_local_edit(OperationKind::ContentEdit, UnionWriter::new(101).insert_text("!"))
        .await
        .unwrap();
    handler
        .push_update(doc, &UnionWriter::new(102).insert_text("?"), None, "other")
        .await
        .unwrap();

    assert_eq!(client.reconnect().await.unwrap(), ReconcileState::Online);
    let merged = content(&handler, doc).await;
    assert!(merged.contains('!') && merged.contains('?'));
    assert_eq!(client.local_projection().await.unwrap().content, merged);
}

#[tokio::test]
async fn test_remote_wins_discards_offline_edits() {
    let handler = union_handler(EngineConfig::for_testing());
    let doc = Uuid::new_v4();
    let client = OfflineReconciler::new(doc, handler.clone(), OfflineConfig::for_testing(), "me")
        .unwrap();

    client.go_offline().await.unwrap();
    client
        .record_local_edit(OperationKind::ContentEdit, UnionWriter::new(1).insert_text("abcdefghij"))
        .await
        .unwrap();
    handler
        .push_update(doc, &UnionWriter::new(2).insert_text("0123456789"), None, "other")
        .await
        .unwrap();

    assert_eq!(client.reconnect().await.unwrap(), ReconcileState::Conflict);
    client.resolve(ResolutionStrategy::RemoteWins).await.unwrap();

    assert_eq!(content(&handler, doc).await, "0123456789");
    assert_eq!(client.local_projection().await.unwrap().content, "0123456789");
    assert_eq!(client.queue_len().await, 0);
    assert_eq!(client.state().await, ReconcileState::Online);
}
