//! Error types for the sync engine.
//!
//! [`SyncError`] is what callers of the engine see. [`StoreError`] is what a
//! persistence backend reports; it is wrapped into [`SyncError::Persistence`]
//! when it escapes a write path.

use thiserror::Error;
use uuid::Uuid;

use crate::conflict::ConflictReport;

/// Result alias used throughout the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The binary payload could not be decoded or applied by the substrate.
    /// Never retried and never partially applied.
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    /// A storage read or write failed.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// Every version-creation attempt failed. The document merge that
    /// triggered the attempt is unaffected.
    #[error("Version creation for document {doc_id} exhausted after {attempts} attempts")]
    VersionRaceExhausted { doc_id: Uuid, attempts: u32 },

    /// Both replicas contain updates unknown to the other and the chosen
    /// strategy does not resolve them automatically.
    #[error("Sync conflict on document {doc_id}: {} report(s)", reports.len())]
    SyncConflict {
        doc_id: Uuid,
        reports: Vec<ConflictReport>,
    },

    /// A reconciliation call was made in a state that does not permit it.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SyncError {
    /// Shorthand for building a [`SyncError::MalformedUpdate`].
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        SyncError::MalformedUpdate(reason.to_string())
    }

    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Persistence(e) if e.is_transient())
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),
    /// Backend temporarily unavailable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
