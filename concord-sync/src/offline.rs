//! Client-side offline reconciliation.
//!
//! State machine:
//! ```text
//!            go_offline             reconnect
//!  Online ─────────────► Offline ─────────────► Syncing ──► Online
//!    ▲                      ▲                      │
//!    │                      └── replay failure ────┤
//!    │          resolve(strategy)                  ▼
//!    └──────────────────────────────────────── Conflict
//! ```
//!
//! Local edits always land in the local replica first. While not `Online`
//! they are also captured in a bounded FIFO and replayed through the
//! [`SyncHandler`] in enqueue order on reconnect. Edits arriving during
//! `Syncing` are queued behind the replay, which drains until the queue is
//! empty before going `Online`.
//!
//! Eviction bounds the queue, not the local replica. Once the queue is
//! drained, anything the replica still holds that canonical state lacks is
//! pushed as one catch-up diff, so evicted edits and the ops that depend on
//! them still reach the server. An online push that fails transiently is
//! queued the same way and the reconciler drops to `Offline`.
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::config::OfflineConfig;
use crate::conflict::{all_auto_resolvable, ConflictReport, ResolutionStrategy};
use crate::crdt::{Projection, ReplicaContainer, ReplicaState};
use crate::error::{SyncError, SyncResult};
use crate::handler::SyncHandler;

/// Reconciliation state of one client replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconcileState {
    Online,
    Offline,
    Syncing,
    Conflict,
}

/// What a queued operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    ContentEdit,
    MetadataEdit,
    AuxiliaryEdit,
}

/// A local mutation captured while disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub timestamp: DateTime<Utc>,
    /// Substrate update bytes
    pub payload: Vec<u8>,
    /// Set once the handler has merged the payload
    pub applied: bool,
}

impl OfflineOperation {
    pub fn new(kind: OperationKind, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            payload,
            applied: false,
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub total_bytes: usize,
    pub evicted: u64,
}

/// Bounded FIFO of offline operations.
///
/// When full, the oldest entry is evicted to make room.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<OfflineOperation>,
    max_size: usize,
    evicted: u64,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size: max_size.max(1),
            evicted: 0,
        }
    }

    /// Queue an operation. Returns the evicted oldest entry, if any.
    pub fn enqueue(&mut self, op: OfflineOperation) -> Option<OfflineOperation> {
        let evicted = if self.queue.len() >= self.max_size {
            self.evicted += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(op);
        evicted
    }

    /// Oldest queued operation.
    pub fn front(&self) -> Option<&OfflineOperation> {
        self.queue.front()
    }

    /// Mark the oldest operation applied and remove it.
    pub fn complete_front(&mut self) -> Option<OfflineOperation> {
        let mut op = self.queue.pop_front()?;
        op.applied = true;
        Some(op)
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Clear all queued operations.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total payload bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|op| op.payload.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OfflineOperation> {
        self.queue.iter()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.queue.len(),
            total_bytes: self.total_bytes(),
            evicted: self.evicted,
        }
    }
}

/// Events emitted by the reconciler.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    StateChanged {
        from: ReconcileState,
        to: ReconcileState,
    },
    /// The queue bound was hit and the oldest operation dropped
    QueueOverflow { evicted: Uuid, queued: usize },
    ConflictDetected { reports: Vec<ConflictReport> },
    /// Queued operations merged on reconnect
    Replayed { count: usize },
    Resolved { strategy: ResolutionStrategy },
}

/// What happened to a local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditDisposition {
    /// Pushed straight to the handler
    Pushed,
    /// Captured in the offline queue
    Queued,
}

/// Client-side replica with offline capture and reconnect replay.
pub struct OfflineReconciler {
    doc_id: Uuid,
    author: String,
    config: OfflineConfig,
    handler: Arc<SyncHandler>,

    /// Reconciliation state
    state: Arc<RwLock<ReconcileState>>,

    /// Offline queue for disconnected edits
    queue: Arc<Mutex<OfflineQueue>>,

    /// Local replica: canonical state as last seen plus local edits
    replica: Arc<Mutex<ReplicaContainer>>,

    /// Local state when the client went offline
    baseline: Arc<Mutex<Option<ReplicaState>>>,

    /// Reports awaiting a manual decision
    reports: Arc<Mutex<Vec<ConflictReport>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ReconcileEvent>>,

    event_tx: mpsc::Sender<ReconcileEvent>,
}

impl OfflineReconciler {
    /// Create an online reconciler with an empty local replica.
    pub fn new(
        doc_id: Uuid,
        handler: Arc<SyncHandler>,
        config: OfflineConfig,
        author: impl Into<String>,
    ) -> SyncResult<Self> {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let replica = ReplicaContainer::new(handler.substrate().clone())?;
        Ok(Self {
            doc_id,
            author: author.into(),
            queue: Arc::new(Mutex::new(OfflineQueue::new(config.max_queue_size))),
            config,
            handler,
            state: Arc::new(RwLock::new(ReconcileState::Online)),
            replica: Arc::new(Mutex::new(replica)),
            baseline: Arc::new(Mutex::new(None)),
            reports: Arc::new(Mutex::new(Vec::new())),
            event_rx: Some(event_rx),
            event_tx,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ReconcileEvent>> {
        self.event_rx.take()
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub async fn state(&self) -> ReconcileState {
        *self.state.read().await
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.lock().await.stats()
    }

    /// Snapshot of queued operations, oldest first.
    pub async fn queued_operations(&self) -> Vec<OfflineOperation> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Reports awaiting resolution while in `Conflict`.
    pub async fn pending_reports(&self) -> Vec<ConflictReport> {
        self.reports.lock().await.clone()
    }

    pub async fn local_state(&self) -> ReplicaState {
        self.replica.lock().await.state().clone()
    }

    pub async fn local_projection(&self) -> SyncResult<Projection> {
        self.replica.lock().await.project()
    }

    /// Local state captured when the client last went offline.
    pub async fn baseline(&self) -> Option<ReplicaState> {
        self.baseline.lock().await.clone()
    }

    /// Merge canonical state into the local replica. Only valid `Online`.
    pub async fn pull(&self) -> SyncResult<bool> {
        let state = self.state().await;
        if state != ReconcileState::Online {
            return Err(SyncError::InvalidState(format!("cannot pull while {state:?}")));
        }
        self.merge_canonical().await
    }

    /// Stop pushing; capture local edits from now on.
    pub async fn go_offline(&self) -> SyncResult<()> {
        let from = self.state().await;
        match from {
            ReconcileState::Offline => return Ok(()),
            ReconcileState::Conflict => {
                return Err(SyncError::InvalidState(
                    "resolve the pending conflict before going offline".into(),
                ));
            }
            ReconcileState::Online => {
                let snapshot = self.replica.lock().await.state().clone();
                *self.baseline.lock().await = Some(snapshot);
            }
            // Connection dropped mid-replay; keep the original baseline.
            ReconcileState::Syncing => {}
        }
        self.transition(ReconcileState::Offline).await;
        Ok(())
    }

    /// Apply a local edit, then push it or queue it depending on state.
    ///
    /// Malformed updates are rejected before reaching the replica or queue.
    /// A transient failure of an online push queues the edit and drops the
    /// reconciler to `Offline`.
    pub async fn record_local_edit(
        &self,
        kind: OperationKind,
        update: Vec<u8>,
    ) -> SyncResult<EditDisposition> {
        self.replica.lock().await.apply_update(&update)?;

        // Queue lock first, then state: the replay loop takes them in the
        // same order when it decides the queue is drained.
        let mut queue = self.queue.lock().await;
        if *self.state.read().await == ReconcileState::Online {
            drop(queue);
            match self
                .handler
                .push_update(self.doc_id, &update, None, &self.author)
                .await
            {
                Ok(_) => return Ok(EditDisposition::Pushed),
                Err(e) if e.is_transient() => {
                    log::warn!(
                        "Push of local edit to {} failed: {e}; queuing it for reconnect",
                        self.doc_id
                    );
                    queue = self.queue.lock().await;
                    if *self.state.read().await == ReconcileState::Online {
                        let snapshot = self.replica.lock().await.state().clone();
                        self.baseline.lock().await.get_or_insert(snapshot);
                        self.transition_locked(ReconcileState::Offline).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        let op = OfflineOperation::new(kind, update);
        log::trace!("Queued {:?} {} for {}", op.kind, op.id, self.doc_id);
        if let Some(evicted) = queue.enqueue(op) {
            let queued = queue.len();
            log::warn!(
                "Offline queue for {} full ({queued}); evicted operation {}",
                self.doc_id,
                evicted.id
            );
            self.emit(ReconcileEvent::QueueOverflow {
                evicted: evicted.id,
                queued,
            });
        }
        Ok(EditDisposition::Queued)
    }

    /// Reconnect: check for conflicts, then replay queued operations.
    ///
    /// Returns the state reached: `Online`, or `Conflict` when divergence
    /// needs a decision.
    pub async fn reconnect(&self) -> SyncResult<ReconcileState> {
        match self.state().await {
            ReconcileState::Offline => {}
            ReconcileState::Online => return Ok(ReconcileState::Online),
            other => {
                return Err(SyncError::InvalidState(format!("cannot reconnect while {other:?}")));
            }
        }
        self.transition(ReconcileState::Syncing).await;

        let canonical = match self.handler.get_state(self.doc_id).await {
            Ok(state) => state,
            Err(e) => {
                self.transition(ReconcileState::Offline).await;
                return Err(e);
            }
        };
        let local = self.replica.lock().await.state().payload.clone();
        let reports = self
            .handler
            .classifier()
            .classify(&local, &canonical.payload);

        if !reports.is_empty() {
            let auto = self.config.auto_resolve && all_auto_resolvable(&reports);
            if !auto {
                log::info!(
                    "Reconnect of {} found {} conflict report(s); awaiting resolution",
                    self.doc_id,
                    reports.len()
                );
                *self.reports.lock().await = reports.clone();
                self.emit(ReconcileEvent::ConflictDetected { reports });
                self.transition(ReconcileState::Conflict).await;
                return Ok(ReconcileState::Conflict);
            }
            log::info!("Auto-merging {} report(s) for {}", reports.len(), self.doc_id);
        }

        self.replay().await
    }

    /// Settle a pending conflict and return `Online`.
    ///
    /// `Manual` keeps the conflict and returns [`SyncError::SyncConflict`].
    pub async fn resolve(&self, strategy: ResolutionStrategy) -> SyncResult<ReconcileState> {
        let state = self.state().await;
        if state != ReconcileState::Conflict {
            return Err(SyncError::InvalidState(format!("no conflict to resolve while {state:?}")));
        }
        if strategy == ResolutionStrategy::Manual {
            return Err(SyncError::SyncConflict {
                doc_id: self.doc_id,
                reports: self.pending_reports().await,
            });
        }

        // Hold the queue so no edit slips in between resolution and Online.
        let mut queue = self.queue.lock().await;
        let local = self.replica.lock().await.state().payload.clone();
        let outcome = self
            .handler
            .resolve_conflict(self.doc_id, &local, strategy, &self.author)
            .await?;

        // The resolved state already reflects every queued edit, or
        // deliberately discards them.
        queue.clear();
        self.replica.lock().await.replace(outcome.state);
        self.reports.lock().await.clear();
        *self.baseline.lock().await = None;

        log::info!("Resolved {} with {:?}", self.doc_id, outcome.applied);
        self.emit(ReconcileEvent::Resolved {
            strategy: outcome.applied,
        });
        self.transition_locked(ReconcileState::Online).await;
        drop(queue);
        Ok(ReconcileState::Online)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Drain the queue through the handler, oldest first.
    async fn replay(&self) -> SyncResult<ReconcileState> {
        let mut count = 0usize;
        loop {
            let mut queue = self.queue.lock().await;
            let Some(op) = queue.front().cloned() else {
                if let Err(e) = self.push_unseen().await {
                    log::warn!("Catch-up push for {} failed: {e}", self.doc_id);
                    drop(queue);
                    self.transition(ReconcileState::Offline).await;
                    return Err(e);
                }
                // Going Online under the queue lock closes the edit race.
                self.transition_locked(ReconcileState::Online).await;
                break;
            };

            match self
                .handler
                .push_update(self.doc_id, &op.payload, None, &self.author)
                .await
            {
                Ok(_) => {
                    queue.complete_front();
                    count += 1;
                }
                Err(SyncError::MalformedUpdate(reason)) => {
                    log::warn!("Dropping unreplayable operation {}: {reason}", op.id);
                    queue.complete_front();
                }
                Err(e) => {
                    log::warn!(
                        "Replay of {} stopped after {count} operation(s): {e}",
                        self.doc_id
                    );
                    drop(queue);
                    self.transition(ReconcileState::Offline).await;
                    return Err(e);
                }
            }
        }

        *self.baseline.lock().await = None;
        self.emit(ReconcileEvent::Replayed { count });
        log::info!("Replayed {count} offline operation(s) for {}", self.doc_id);

        if let Err(e) = self.merge_canonical().await {
            log::warn!("Post-replay pull for {} failed: {e}", self.doc_id);
        }
        Ok(ReconcileState::Online)
    }

    /// Push everything the local replica holds that canonical state lacks.
    ///
    /// Replaying queued payloads alone is not enough: edits whose entries
    /// were evicted stay in the local replica, and substrates with causal
    /// delivery hold every later op from this client until they arrive.
    async fn push_unseen(&self) -> SyncResult<bool> {
        let canonical = self.handler.get_state(self.doc_id).await?;
        let delta = {
            let replica = self.replica.lock().await;
            let substrate = self.handler.substrate();
            if !substrate.has_unseen(&replica.state().payload, &canonical.payload)? {
                return Ok(false);
            }
            let peer_sv = substrate.encode_state_vector(&canonical.payload)?;
            replica.diff(&peer_sv)?
        };
        let out = self
            .handler
            .push_update(self.doc_id, &delta, None, &self.author)
            .await?;
        log::info!(
            "Pushed {} byte catch-up update for {} (merged: {})",
            delta.len(),
            self.doc_id,
            out.merged
        );
        Ok(out.merged)
    }

    async fn merge_canonical(&self) -> SyncResult<bool> {
        let canonical = self.handler.get_state(self.doc_id).await?;
        self.replica.lock().await.apply_update(&canonical.payload)
    }

    async fn transition(&self, to: ReconcileState) {
        let _queue = self.queue.lock().await;
        self.transition_locked(to).await;
    }

    /// Transition while the caller holds the queue lock.
    async fn transition_locked(&self, to: ReconcileState) {
        let from = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            log::info!("Document {}: {from:?} -> {to:?}", self.doc_id);
            self.emit(ReconcileEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: ReconcileEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::trace!("Reconcile event dropped: {e}");
        }
    }
}
