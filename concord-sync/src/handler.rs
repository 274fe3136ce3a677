//! Server-side sync handler: the only write path into canonical state.
//!
//! Architecture:
//! ```text
//! push_update ──┐
//! push_batch  ──┼── slot(doc_id) ── Mutex ── load ─► merge ─► save
//! resolve     ──┘                                       │
//!                                                       ▼
//!                                              SnapshotTrigger ─► VersionManager
//! ```
//!
//! Each document owns a slot guarded by an async mutex, so the read-merge-
//! write of one document is linearized while different documents proceed
//! in parallel. Version capture runs inside the same critical section; its
//! failures are logged and counted but never fail the push that caused them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::conflict::{self, ConflictClassifier, ConflictReport, ResolutionStrategy};
use crate::crdt::{CrdtSubstrate, ReplicaContainer, ReplicaState};
use crate::diagnostics::{self, DiagnosticHook, VersionPreview};
use crate::error::{SyncError, SyncResult};
use crate::storage::{DocumentVersion, SyncStore, VersionSummary};
use crate::version::{SnapshotTrigger, VersionDraft, VersionManager, VersionOutcome};

/// Handler statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub pushes: u64,
    pub batches: u64,
    pub merged_updates: u64,
    pub rejected_updates: u64,
    pub versions_created: u64,
    pub races_lost: u64,
    pub version_failures: u64,
    pub persistence_failures: u64,
    /// Documents currently holding a write slot
    pub tracked_documents: usize,
}

/// Result of a single push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Whether the update changed canonical state
    pub merged: bool,
    pub state_vector: Vec<u8>,
    /// Version captured by this push, if any
    pub version: Option<u64>,
}

/// Result of a batch push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied_count: usize,
    pub merged: bool,
    pub state_vector: Vec<u8>,
    pub version: Option<u64>,
}

/// Result of resolving a conflict against canonical state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// Strategy that took effect
    pub applied: ResolutionStrategy,
    /// Canonical state after resolution
    pub state: ReplicaState,
    pub version: Option<u64>,
}

/// Per-document critical section state.
struct DocumentSlot {
    trigger: SnapshotTrigger,
}

/// Accepts inbound updates and owns canonical per-document state.
pub struct SyncHandler {
    config: EngineConfig,
    substrate: Arc<dyn CrdtSubstrate>,
    store: Arc<dyn SyncStore>,
    versions: VersionManager,
    classifier: ConflictClassifier,
    diagnostics: Option<Arc<dyn DiagnosticHook>>,
    /// Document slots: doc_id → serialized write state
    slots: RwLock<HashMap<Uuid, Arc<Mutex<DocumentSlot>>>>,
    stats: RwLock<HandlerStats>,
}

impl SyncHandler {
    pub fn new(
        substrate: Arc<dyn CrdtSubstrate>,
        store: Arc<dyn SyncStore>,
        config: EngineConfig,
    ) -> Self {
        let versions = VersionManager::new(store.clone(), config.retry.clone());
        let classifier = ConflictClassifier::new(substrate.clone());
        let diagnostics = diagnostics::hook_for(&config.diagnostics);
        Self {
            config,
            substrate,
            store,
            versions,
            classifier,
            diagnostics,
            slots: RwLock::new(HashMap::new()),
            stats: RwLock::new(HandlerStats::default()),
        }
    }

    /// Install a diagnostic hook regardless of the diagnostics config.
    pub fn with_diagnostics(mut self, hook: Arc<dyn DiagnosticHook>) -> Self {
        self.diagnostics = Some(hook);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn substrate(&self) -> &Arc<dyn CrdtSubstrate> {
        &self.substrate
    }

    pub fn classifier(&self) -> &ConflictClassifier {
        &self.classifier
    }

    /// Merge one update into canonical state.
    ///
    /// `state_vector` is stored as given when supplied; otherwise it is
    /// recomputed from the merged payload.
    pub async fn push_update(
        &self,
        doc_id: Uuid,
        update: &[u8],
        state_vector: Option<&[u8]>,
        author: &str,
    ) -> SyncResult<PushOutcome> {
        let slot = self.slot(doc_id).await;
        let mut slot = slot.lock().await;

        let mut replica = self.load_replica(doc_id)?;
        let merged = match replica.apply_update_with_vector(update, state_vector) {
            Ok(merged) => merged,
            Err(e) => {
                self.stats.write().await.rejected_updates += 1;
                log::warn!("Rejected update for {doc_id}: {e}");
                return Err(e);
            }
        };

        {
            let mut s = self.stats.write().await;
            s.pushes += 1;
            s.merged_updates += u64::from(merged);
        }

        let mut version = None;
        if merged {
            self.persist(doc_id, replica.state()).await?;
            log::debug!(
                "Merged {} byte update into {doc_id} ({} bytes)",
                update.len(),
                replica.state().size()
            );
            if slot.trigger.record_updates(1) {
                version = self.capture(doc_id, &replica, author, &mut slot).await;
            }
        } else {
            log::trace!("Update for {doc_id} was already known");
        }

        Ok(PushOutcome {
            merged,
            state_vector: replica.state_vector().to_vec(),
            version,
        })
    }

    /// Merge a list of updates as one pre-merged update.
    ///
    /// Either every update is merged or none is. A batch at or above the
    /// snapshot threshold captures a version regardless of elapsed time.
    pub async fn push_batch(
        &self,
        doc_id: Uuid,
        updates: &[Vec<u8>],
        author: &str,
    ) -> SyncResult<BatchOutcome> {
        if updates.is_empty() {
            let state = self.get_state(doc_id).await?;
            return Ok(BatchOutcome {
                applied_count: 0,
                merged: false,
                state_vector: state.state_vector,
                version: None,
            });
        }

        let combined = match self.substrate.merge_updates(updates) {
            Ok(combined) => combined,
            Err(e) => {
                self.stats.write().await.rejected_updates += 1;
                log::warn!("Rejected batch of {} for {doc_id}: {e}", updates.len());
                return Err(e);
            }
        };

        let slot = self.slot(doc_id).await;
        let mut slot = slot.lock().await;

        let mut replica = self.load_replica(doc_id)?;
        let merged = replica.apply_update(&combined)?;

        {
            let mut s = self.stats.write().await;
            s.batches += 1;
            s.merged_updates += u64::from(merged) * updates.len() as u64;
        }

        let mut version = None;
        if merged {
            self.persist(doc_id, replica.state()).await?;
            log::debug!("Merged batch of {} into {doc_id}", updates.len());
            if slot.trigger.record_batch(updates.len()) {
                version = self.capture(doc_id, &replica, author, &mut slot).await;
            }
        }

        Ok(BatchOutcome {
            applied_count: updates.len(),
            merged,
            state_vector: replica.state_vector().to_vec(),
            version,
        })
    }

    /// Canonical state of a document (empty if never written).
    pub async fn get_state(&self, doc_id: Uuid) -> SyncResult<ReplicaState> {
        Ok(self.load_replica(doc_id)?.state().clone())
    }

    /// Everything in canonical state unknown to a peer at `peer_state_vector`.
    pub async fn get_diff(&self, doc_id: Uuid, peer_state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        self.load_replica(doc_id)?.diff(peer_state_vector)
    }

    /// Version history of a document in ascending order.
    pub async fn list_versions(&self, doc_id: Uuid) -> SyncResult<Vec<VersionSummary>> {
        Ok(self
            .store
            .list_versions(doc_id)?
            .iter()
            .map(VersionSummary::from)
            .collect())
    }

    /// The surviving row at `(doc_id, version)`.
    pub async fn get_version(&self, doc_id: Uuid, version: u64) -> SyncResult<Option<DocumentVersion>> {
        let rows = self.store.versions_at(doc_id, version)?;
        Ok(rows.into_iter().min_by_key(|r| r.race_key()))
    }

    /// The highest-numbered version of a document.
    pub async fn latest_version(&self, doc_id: Uuid) -> SyncResult<Option<DocumentVersion>> {
        match self.store.highest_version(doc_id)? {
            Some(v) => self.get_version(doc_id, v).await,
            None => Ok(None),
        }
    }

    /// Documents with canonical state.
    pub async fn documents(&self) -> SyncResult<Vec<Uuid>> {
        Ok(self.store.list_documents()?)
    }

    /// Conflict reports between a local replica and canonical state.
    ///
    /// Empty when the local replica is merely behind or ahead.
    pub async fn detect_conflict(
        &self,
        doc_id: Uuid,
        local_payload: &[u8],
    ) -> SyncResult<Vec<ConflictReport>> {
        let canonical = self.load_replica(doc_id)?;
        Ok(self
            .classifier
            .classify(local_payload, &canonical.state().payload))
    }

    /// Settle a local replica against canonical state with `strategy`.
    ///
    /// `Manual` changes nothing and returns [`SyncError::SyncConflict`].
    pub async fn resolve_conflict(
        &self,
        doc_id: Uuid,
        local_payload: &[u8],
        strategy: ResolutionStrategy,
        author: &str,
    ) -> SyncResult<ResolveOutcome> {
        let slot = self.slot(doc_id).await;
        let mut slot = slot.lock().await;

        let mut replica = self.load_replica(doc_id)?;
        let canonical = replica.state().payload.clone();
        let reports = match strategy {
            ResolutionStrategy::Manual => self.classifier.classify(local_payload, &canonical),
            _ => Vec::new(),
        };
        let resolved = conflict::resolve(
            self.substrate.as_ref(),
            doc_id,
            local_payload,
            &canonical,
            strategy,
            reports,
        )?;

        let mut version = None;
        if resolved.changed {
            replica.replace(ReplicaState::from_payload(
                self.substrate.as_ref(),
                resolved.payload,
            )?);
            self.persist(doc_id, replica.state()).await?;
            log::info!("Resolved conflict on {doc_id} with {:?}", resolved.applied);
            if slot.trigger.record_updates(1) {
                version = self.capture(doc_id, &replica, author, &mut slot).await;
            }
        }

        Ok(ResolveOutcome {
            applied: resolved.applied,
            state: replica.state().clone(),
            version,
        })
    }

    /// Current handler statistics.
    pub async fn stats(&self) -> HandlerStats {
        let mut stats = self.stats.read().await.clone();
        stats.tracked_documents = self.slots.read().await.len();
        stats
    }

    /// Drop the write slot of a document nobody is writing to.
    ///
    /// Returns `true` if the slot was removed. The snapshot trigger for that
    /// document starts over on its next write.
    pub async fn release_document(&self, doc_id: Uuid) -> bool {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(&doc_id) {
            // Holding the write lock, no new handle can be taken.
            if Arc::strong_count(slot) == 1 {
                slots.remove(&doc_id);
                log::debug!("Released idle slot for {doc_id}");
                return true;
            }
        }
        false
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn slot(&self, doc_id: Uuid) -> Arc<Mutex<DocumentSlot>> {
        if let Some(slot) = self.slots.read().await.get(&doc_id) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(doc_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(DocumentSlot {
                    trigger: SnapshotTrigger::new(self.config.snapshot.clone()),
                }))
            })
            .clone()
    }

    fn load_replica(&self, doc_id: Uuid) -> SyncResult<ReplicaContainer> {
        let substrate = self.substrate.clone();
        match self.store.load_state(doc_id)? {
            Some(state) => Ok(ReplicaContainer::from_state(substrate, state)),
            None => ReplicaContainer::new(substrate),
        }
    }

    async fn persist(&self, doc_id: Uuid, state: &ReplicaState) -> SyncResult<()> {
        if let Err(e) = self.store.save_state(doc_id, state) {
            self.stats.write().await.persistence_failures += 1;
            log::error!("Failed to persist state for {doc_id}: {e}");
            return Err(SyncError::Persistence(e));
        }
        Ok(())
    }

    /// Capture a version of `replica`. Failures are logged, never returned.
    async fn capture(
        &self,
        doc_id: Uuid,
        replica: &ReplicaContainer,
        author: &str,
        slot: &mut DocumentSlot,
    ) -> Option<u64> {
        slot.trigger.reset();

        let projection = match replica.project() {
            Ok(p) => p,
            Err(e) => {
                self.stats.write().await.version_failures += 1;
                log::error!("Cannot project {doc_id} for versioning: {e}");
                return None;
            }
        };
        let draft = VersionDraft {
            content: projection.content.clone(),
            snapshot: replica.state().payload.clone(),
            created_by: author.to_string(),
        };

        match self.versions.create_version(doc_id, draft).await {
            Ok(VersionOutcome::Created(row)) => {
                self.stats.write().await.versions_created += 1;
                if let Some(hook) = &self.diagnostics {
                    let preview = VersionPreview::new(
                        doc_id,
                        row.version,
                        &projection,
                        self.config.diagnostics.preview_chars,
                    );
                    hook.on_version_captured(&preview);
                }
                Some(row.version)
            }
            Ok(VersionOutcome::Superseded(_)) => {
                self.stats.write().await.races_lost += 1;
                None
            }
            Err(e) => {
                self.stats.write().await.version_failures += 1;
                log::error!("Version capture for {doc_id} failed: {e}");
                None
            }
        }
    }
}
