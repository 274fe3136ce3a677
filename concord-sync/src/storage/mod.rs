//! Persistence collaborator for canonical state and version history.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   get/put state   ┌──────────────────────────────┐
//! │ SyncHandler │ ────────────────► │ SyncStore                    │
//! └──────┬──────┘                   │  ├── MemoryStore (tests)     │
//!        │                          │  └── RocksStore  (RocksDB)   │
//!        ▼                          │        CF "states"           │
//! ┌────────────────┐  insert/scan   │        CF "versions"         │
//! │ VersionManager │ ─────────────► │                              │
//! └────────────────┘                └──────────────────────────────┘
//! ```
//!
//! Version rows are indexed two ways: highest version per document, and all
//! rows at an exact `(document, version)` ordered by `(created_at, id)`. The
//! second ordering is the tie-break contract for concurrent version creation.

pub mod memory;
pub mod rocks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::ReplicaState;
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// An immutable, numbered snapshot of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    /// Row identifier, the second tie-break key
    pub id: Uuid,
    pub document_id: Uuid,
    /// Monotonic, gapless per document under normal operation
    pub version: u64,
    /// Human-readable projection at capture time
    pub content: String,
    /// Raw replica payload at capture time
    pub snapshot: Vec<u8>,
    pub created_by: String,
    /// First tie-break key
    pub created_at: DateTime<Utc>,
}

impl DocumentVersion {
    /// Total order used to pick the surviving row of a version race.
    pub fn race_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Summary row for version listings (no snapshot payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: Uuid,
    pub version: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub snapshot_size: usize,
}

impl From<&DocumentVersion> for VersionSummary {
    fn from(v: &DocumentVersion) -> Self {
        Self {
            id: v.id,
            version: v.version,
            created_by: v.created_by.clone(),
            created_at: v.created_at,
            snapshot_size: v.snapshot.len(),
        }
    }
}

/// Storage backend for replica states and version rows.
///
/// Implementations must store payloads byte-for-byte. There is no
/// conditional insert: concurrent writers at one version are reconciled by
/// the version manager.
pub trait SyncStore: Send + Sync {
    /// Canonical state of a document, if any has been written.
    fn load_state(&self, doc_id: Uuid) -> Result<Option<ReplicaState>, StoreError>;

    /// Replace the canonical state of a document.
    fn save_state(&self, doc_id: Uuid, state: &ReplicaState) -> Result<(), StoreError>;

    /// Documents with a stored state.
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Insert a version row. Never overwrites rows with a different id.
    fn insert_version(&self, version: &DocumentVersion) -> Result<(), StoreError>;

    /// Highest version number stored for a document.
    fn highest_version(&self, doc_id: Uuid) -> Result<Option<u64>, StoreError>;

    /// Every row at `(doc_id, version)`, ordered by `(created_at, id)`.
    fn versions_at(&self, doc_id: Uuid, version: u64) -> Result<Vec<DocumentVersion>, StoreError>;

    /// Delete a single row by its identity.
    fn delete_version(&self, row: &DocumentVersion) -> Result<(), StoreError>;

    /// All rows for a document in ascending version order.
    fn list_versions(&self, doc_id: Uuid) -> Result<Vec<DocumentVersion>, StoreError>;
}
