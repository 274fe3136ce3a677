//! Version snapshots under optimistic concurrency.
//!
//! The store has no conditional insert, so uniqueness of `(document, version)`
//! is reached by insert-then-reconcile:
//!
//! ```text
//! highest ──► next = highest + 1 ──► insert row ──► read all rows at next
//!                                                        │
//!                         ┌──────────────────────────────┤
//!                         ▼                              ▼
//!                    one row: won           several: min (created_at, id) wins,
//!                                           every other row is deleted
//! ```
//!
//! Transient store errors are retried with capped exponential backoff and
//! jitter. Each attempt runs without yielding, so a cancelled caller can only
//! stop between attempts and never leaves a half-written row.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::config::{RetryPolicy, SnapshotPolicy};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::storage::{DocumentVersion, SyncStore};

/// Result of a version creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionOutcome {
    /// This writer's row was the earliest at its version number when it
    /// reconciled.
    ///
    /// A rival that stamped an earlier `created_at` but inserted after this
    /// reconcile still wins on its own reconcile and deletes this row. The
    /// tie-break is total, so the surviving row is always the earliest one
    /// ever inserted; `Created` reports what was true at reconcile time.
    Created(DocumentVersion),
    /// A concurrent writer won the version number; its row is returned
    Superseded(DocumentVersion),
}

impl VersionOutcome {
    /// The surviving row, whoever wrote it.
    pub fn winner(&self) -> &DocumentVersion {
        match self {
            VersionOutcome::Created(v) | VersionOutcome::Superseded(v) => v,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, VersionOutcome::Created(_))
    }
}

/// Contents of a version to be captured.
#[derive(Debug, Clone)]
pub struct VersionDraft {
    pub content: String,
    pub snapshot: Vec<u8>,
    pub created_by: String,
}

/// Creates numbered, immutable document versions.
pub struct VersionManager {
    store: Arc<dyn SyncStore>,
    retry: RetryPolicy,
}

impl VersionManager {
    pub fn new(store: Arc<dyn SyncStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Capture the next version number for `doc_id`.
    pub async fn create_version(
        &self,
        doc_id: Uuid,
        draft: VersionDraft,
    ) -> SyncResult<VersionOutcome> {
        self.run(doc_id, None, draft).await
    }

    /// Race for an explicit version number.
    ///
    /// Used when the caller already observed the highest version, and by
    /// tests that need many writers on one number.
    pub async fn claim_version(
        &self,
        doc_id: Uuid,
        version: u64,
        draft: VersionDraft,
    ) -> SyncResult<VersionOutcome> {
        self.run(doc_id, Some(version), draft).await
    }

    async fn run(
        &self,
        doc_id: Uuid,
        fixed: Option<u64>,
        draft: VersionDraft,
    ) -> SyncResult<VersionOutcome> {
        let attempts = self.retry.max_attempts.max(1);
        // Row already inserted by an earlier attempt whose reconcile failed.
        let mut pending: Option<DocumentVersion> = None;

        for attempt in 0..attempts {
            match self.attempt(doc_id, fixed, &draft, &mut pending) {
                Ok(outcome) => return Ok(outcome),
                Err(SyncError::Persistence(e)) if e.is_transient() => {
                    if attempt + 1 < attempts {
                        let delay = self.retry.delay_for(attempt);
                        log::warn!(
                            "Version attempt {}/{attempts} for {doc_id} failed: {e}; retrying in {delay:?}",
                            attempt + 1
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        log::warn!("Version attempt {attempts}/{attempts} for {doc_id} failed: {e}");
                    }
                }
                Err(e) => return Err(e),
            }
        }

        log::error!("No version created for {doc_id}: {attempts} attempts exhausted");
        Err(SyncError::VersionRaceExhausted { doc_id, attempts })
    }

    /// One synchronous insert-and-reconcile pass.
    fn attempt(
        &self,
        doc_id: Uuid,
        fixed: Option<u64>,
        draft: &VersionDraft,
        pending: &mut Option<DocumentVersion>,
    ) -> SyncResult<VersionOutcome> {
        let row = match pending.take() {
            Some(row) => row,
            None => {
                let version = match fixed {
                    Some(v) => v,
                    None => self.store.highest_version(doc_id)?.map_or(1, |h| h + 1),
                };
                let row = DocumentVersion {
                    id: Uuid::new_v4(),
                    document_id: doc_id,
                    version,
                    content: draft.content.clone(),
                    snapshot: draft.snapshot.clone(),
                    created_by: draft.created_by.clone(),
                    created_at: Utc::now(),
                };
                self.store.insert_version(&row)?;
                row
            }
        };

        match self.reconcile(&row) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                *pending = Some(row);
                Err(e)
            }
        }
    }

    /// Keep the minimum `(created_at, id)` row at `row.version`, delete the rest.
    fn reconcile(&self, row: &DocumentVersion) -> SyncResult<VersionOutcome> {
        let rows = self.store.versions_at(row.document_id, row.version)?;
        let winner = rows
            .iter()
            .min_by_key(|r| r.race_key())
            .cloned()
            .ok_or_else(|| {
                StoreError::Unavailable(format!(
                    "version {} of {} vanished during reconcile",
                    row.version, row.document_id
                ))
            })?;

        for loser in rows.iter().filter(|r| r.id != winner.id) {
            self.store.delete_version(loser)?;
        }

        if winner.id == row.id {
            log::info!(
                "Created version {} for {} ({} bytes)",
                row.version,
                row.document_id,
                row.snapshot.len()
            );
            Ok(VersionOutcome::Created(winner))
        } else {
            log::warn!(
                "Lost race for version {} of {} to row {}",
                row.version,
                row.document_id,
                winner.id
            );
            Ok(VersionOutcome::Superseded(winner))
        }
    }
}

/// Decides when a document's merged state should be captured.
///
/// Fires when the interval since the last capture has elapsed or when the
/// count of merged updates reaches the threshold, whichever comes first.
#[derive(Debug, Clone)]
pub struct SnapshotTrigger {
    policy: SnapshotPolicy,
    last_capture: Instant,
    pending_updates: usize,
}

impl SnapshotTrigger {
    pub fn new(policy: SnapshotPolicy) -> Self {
        Self::with_last_capture(policy, Instant::now())
    }

    pub fn with_last_capture(policy: SnapshotPolicy, last_capture: Instant) -> Self {
        Self {
            policy,
            last_capture,
            pending_updates: 0,
        }
    }

    /// Count `merged` updates from single pushes; true if a capture is due.
    pub fn record_updates(&mut self, merged: usize) -> bool {
        self.pending_updates += merged;
        self.count_due() || self.interval_due()
    }

    /// Count a batch. A batch at or above the threshold is due regardless of
    /// time; a smaller one only feeds the count trigger.
    pub fn record_batch(&mut self, batch_len: usize) -> bool {
        self.pending_updates += batch_len;
        batch_len >= self.policy.update_threshold.max(1) || self.count_due()
    }

    /// Start a new capture window. Called after every capture attempt.
    pub fn reset(&mut self) {
        self.pending_updates = 0;
        self.last_capture = Instant::now();
    }

    pub fn pending_updates(&self) -> usize {
        self.pending_updates
    }

    pub fn since_last_capture(&self) -> Duration {
        self.last_capture.elapsed()
    }

    fn count_due(&self) -> bool {
        self.pending_updates >= self.policy.update_threshold.max(1)
    }

    fn interval_due(&self) -> bool {
        self.pending_updates > 0 && self.last_capture.elapsed() >= self.policy.interval
    }
}
