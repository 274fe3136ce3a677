//! # concord-sync: CRDT synchronization engine
//!
//! Merges concurrent binary document updates, keeps an append-only version
//! history under contention, classifies and resolves conflicts, and
//! reconciles clients that edited offline.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐   push_update / resolve   ┌──────────────────┐
//! │ OfflineReconciler  │ ────────────────────────► │ SyncHandler      │
//! │ (per client)       │                           │ (canonical state)│
//! │  OfflineQueue      │ ◄──────── get_state ───── │  per-doc Mutex   │
//! └─────────┬──────────┘                           └───┬─────────┬────┘
//!           │ conflicts                                │         │ trigger
//!           ▼                                          ▼         ▼
//! ┌────────────────────┐                    ┌────────────┐ ┌────────────────┐
//! │ ConflictClassifier │                    │ SyncStore  │◄│ VersionManager │
//! └─────────┬──────────┘                    │ Memory /   │ └────────────────┘
//!           │                               │ RocksDB    │
//!           ▼                               └────────────┘
//! ┌────────────────────────────────────┐
//! │ dyn CrdtSubstrate (yrs | union)    │
//! └────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`]: substrate trait, replica container, `yrs` and union substrates
//! - [`conflict`]: divergence classification and resolution strategies
//! - [`version`]: optimistic version creation and the snapshot trigger
//! - [`handler`]: server-side write path
//! - [`offline`]: client-side offline queue and reconnect state machine
//! - [`storage`]: persistence trait with in-memory and RocksDB backends
//! - [`diagnostics`]: optional content previews on version capture

pub mod config;
pub mod conflict;
pub mod crdt;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod offline;
pub mod storage;
pub mod version;

// Re-exports for convenience
pub use config::{DiagnosticsConfig, EngineConfig, OfflineConfig, RetryPolicy, SnapshotPolicy};
pub use conflict::{
    Classification, ConflictClassifier, ConflictReport, ResolutionStrategy, Resolved,
};
pub use crdt::{
    CrdtSubstrate, Projection, ReplicaContainer, ReplicaState, UnionCrdt, UnionWriter,
    YrsSubstrate, YrsWriter, EMBED_PLACEHOLDER,
};
pub use diagnostics::{DiagnosticHook, LogDiagnostics, VersionPreview};
pub use error::{StoreError, SyncError, SyncResult};
pub use handler::{BatchOutcome, HandlerStats, PushOutcome, ResolveOutcome, SyncHandler};
pub use offline::{
    EditDisposition, OfflineOperation, OfflineQueue, OfflineReconciler, OperationKind,
    QueueStats, ReconcileEvent, ReconcileState,
};
pub use storage::{
    DocumentVersion, MemoryStore, RocksStore, StoreConfig, SyncStore, VersionSummary,
};
pub use version::{SnapshotTrigger, VersionDraft, VersionManager, VersionOutcome};
