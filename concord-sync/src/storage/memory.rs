//! In-memory [`SyncStore`] with fault injection.
//!
//! Version rows live in a `BTreeMap` keyed exactly like the RocksDB version
//! column family, so ordering behaves identically in both stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{DocumentVersion, SyncStore};
use crate::crdt::ReplicaState;
use crate::error::StoreError;

type VersionKey = (Uuid, u64, DateTime<Utc>, Uuid);

#[derive(Default)]
struct Tables {
    states: HashMap<Uuid, ReplicaState>,
    versions: BTreeMap<VersionKey, DocumentVersion>,
}

/// Volatile store for tests, benches and single-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Remaining version writes to fail with `Unavailable`
    failing_version_writes: AtomicU32,
    /// Remaining state writes to fail with `Unavailable`
    failing_state_writes: AtomicU32,
    state_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` version inserts fail with a transient error.
    pub fn fail_next_version_writes(&self, n: u32) {
        self.failing_version_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` state saves fail with a transient error.
    pub fn fail_next_state_writes(&self, n: u32) {
        self.failing_state_writes.store(n, Ordering::SeqCst);
    }

    /// Number of successful state saves.
    pub fn state_writes(&self) -> u64 {
        self.state_writes.load(Ordering::SeqCst)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn injected_failure(counter: &AtomicU32, what: &str) -> Result<(), StoreError> {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(StoreError::Unavailable(format!("injected {what} failure")));
        }
        Ok(())
    }

    fn key(row: &DocumentVersion) -> VersionKey {
        (row.document_id, row.version, row.created_at, row.id)
    }
}

impl SyncStore for MemoryStore {
    fn load_state(&self, doc_id: Uuid) -> Result<Option<ReplicaState>, StoreError> {
        Ok(self.tables()?.states.get(&doc_id).cloned())
    }

    fn save_state(&self, doc_id: Uuid, state: &ReplicaState) -> Result<(), StoreError> {
        Self::injected_failure(&self.failing_state_writes, "state write")?;
        self.tables()?.states.insert(doc_id, state.clone());
        self.state_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.tables()?.states.keys().copied().collect())
    }

    fn insert_version(&self, version: &DocumentVersion) -> Result<(), StoreError> {
        Self::injected_failure(&self.failing_version_writes, "version write")?;
        self.tables()?
            .versions
            .insert(Self::key(version), version.clone());
        Ok(())
    }

    fn highest_version(&self, doc_id: Uuid) -> Result<Option<u64>, StoreError> {
        let tables = self.tables()?;
        let upper = (doc_id, u64::MAX, DateTime::<Utc>::MAX_UTC, Uuid::from_u128(u128::MAX));
        let lower = (doc_id, 0, DateTime::<Utc>::MIN_UTC, Uuid::nil());
        Ok(tables
            .versions
            .range(lower..=upper)
            .next_back()
            .map(|((_, version, _, _), _)| *version))
    }

    fn versions_at(&self, doc_id: Uuid, version: u64) -> Result<Vec<DocumentVersion>, StoreError> {
        let tables = self.tables()?;
        let lower = (doc_id, version, DateTime::<Utc>::MIN_UTC, Uuid::nil());
        let upper = (doc_id, version, DateTime::<Utc>::MAX_UTC, Uuid::from_u128(u128::MAX));
        Ok(tables
            .versions
            .range(lower..=upper)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn delete_version(&self, row: &DocumentVersion) -> Result<(), StoreError> {
        self.tables()?.versions.remove(&Self::key(row));
        Ok(())
    }

    fn list_versions(&self, doc_id: Uuid) -> Result<Vec<DocumentVersion>, StoreError> {
        let tables = self.tables()?;
        let lower = (doc_id, 0, DateTime::<Utc>::MIN_UTC, Uuid::nil());
        let upper = (doc_id, u64::MAX, DateTime::<Utc>::MAX_UTC, Uuid::from_u128(u128::MAX));
        Ok(tables
            .versions
            .range(lower..=upper)
            .map(|(_, row)| row.clone())
            .collect())
    }
}
