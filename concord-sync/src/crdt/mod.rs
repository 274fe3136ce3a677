//! Replicated state container and the substrate abstraction beneath it.
//!
//! The engine never interprets update bytes itself. Everything that needs to
//! look inside a payload goes through [`CrdtSubstrate`], which has two
//! implementations:
//!
//! - [`YrsSubstrate`]: production substrate backed by `yrs`
//! - [`UnionCrdt`]: deterministic set-union CRDT used in tests and benches
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ReplicaContainer              │
//! │                                          │
//! │  ReplicaState { payload, state_vector }  │
//! │         │                                │
//! │         ▼                                │
//! │  dyn CrdtSubstrate                       │
//! │    apply_update / merge_updates          │
//! │    encode_state_vector / diff / project  │
//! └──────────────────────────────────────────┘
//! ```

mod union;
mod yrs_substrate;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

pub use union::{UnionCrdt, UnionOp, UnionOpKind, UnionWriter};
pub use yrs_substrate::{YrsSubstrate, YrsWriter};

/// Stand-in for embedded content that has no textual form.
pub const EMBED_PLACEHOLDER: char = '\u{FFFC}';

/// Metadata keys compared field-by-field by the conflict classifier.
pub const META_AUTHOR: &str = "author";
pub const META_TITLE: &str = "title";
pub const META_LAST_MODIFIED: &str = "last_modified";

/// Auxiliary maps compared entry-by-entry by the conflict classifier.
pub const AUX_MAPS: &[&str] = &["settings", "annotations", "comments"];

/// Primitives a commutative replicated data type must provide.
///
/// States and updates share one opaque binary form: a full state is also a
/// valid update. Implementations must be deterministic, commutative and
/// idempotent in `apply_update`, and must reject malformed input without
/// side effects.
pub trait CrdtSubstrate: Send + Sync {
    /// Merge `update` into `state`, returning the new full state.
    /// An empty `state` means a fresh document.
    fn apply_update(&self, state: &[u8], update: &[u8]) -> SyncResult<Vec<u8>>;

    /// Merge several updates into a single update without a base state.
    fn merge_updates(&self, updates: &[Vec<u8>]) -> SyncResult<Vec<u8>>;

    /// Compact per-replica clock summary of `state`.
    fn encode_state_vector(&self, state: &[u8]) -> SyncResult<Vec<u8>>;

    /// Minimal update carrying everything in `state` unknown to a peer that
    /// has seen `peer_state_vector`.
    fn diff(&self, state: &[u8], peer_state_vector: &[u8]) -> SyncResult<Vec<u8>>;

    /// Whether `update` carries no operations.
    fn is_empty_update(&self, update: &[u8]) -> SyncResult<bool>;

    /// Human-readable projection of a state.
    fn project(&self, state: &[u8]) -> SyncResult<Projection>;

    /// Whether `state` contains anything `peer_state` has not seen.
    fn has_unseen(&self, state: &[u8], peer_state: &[u8]) -> SyncResult<bool> {
        let peer_sv = self.encode_state_vector(peer_state)?;
        let delta = self.diff(state, &peer_sv)?;
        Ok(!self.is_empty_update(&delta)?)
    }
}

/// A document's replicated state plus its state vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Opaque substrate payload
    pub payload: Vec<u8>,
    /// Opaque state vector for `payload`
    pub state_vector: Vec<u8>,
}

impl ReplicaState {
    /// Build a state, computing its state vector with `substrate`.
    pub fn from_payload(substrate: &dyn CrdtSubstrate, payload: Vec<u8>) -> SyncResult<Self> {
        let state_vector = substrate.encode_state_vector(&payload)?;
        Ok(Self {
            payload,
            state_vector,
        })
    }

    /// State of a document nobody has written to.
    pub fn empty(substrate: &dyn CrdtSubstrate) -> SyncResult<Self> {
        Self::from_payload(substrate, Vec::new())
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Human-readable view of a replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    /// Text content, with [`EMBED_PLACEHOLDER`] for each embedded item
    pub content: String,
    /// Number of embedded items replaced by the placeholder
    pub embedded_count: usize,
    /// Structured metadata (author, title, last_modified, ...)
    pub metadata: BTreeMap<String, String>,
    /// Nested auxiliary maps keyed by map name
    pub auxiliary: BTreeMap<String, BTreeMap<String, String>>,
}

impl Projection {
    /// Embedded modification timestamp in milliseconds, if present and numeric.
    pub fn last_modified(&self) -> Option<i64> {
        self.metadata
            .get(META_LAST_MODIFIED)
            .and_then(|v| v.trim().parse().ok())
    }
}

/// One logical document's replica, mutated only through whole merges.
pub struct ReplicaContainer {
    substrate: Arc<dyn CrdtSubstrate>,
    state: ReplicaState,
}

impl ReplicaContainer {
    /// Create an empty replica.
    pub fn new(substrate: Arc<dyn CrdtSubstrate>) -> SyncResult<Self> {
        let state = ReplicaState::empty(substrate.as_ref())?;
        Ok(Self { substrate, state })
    }

    /// Wrap an existing state.
    pub fn from_state(substrate: Arc<dyn CrdtSubstrate>, state: ReplicaState) -> Self {
        Self { substrate, state }
    }

    /// Merge an update. On error the current state is left untouched.
    ///
    /// Returns `true` if the merge changed the state.
    pub fn apply_update(&mut self, update: &[u8]) -> SyncResult<bool> {
        self.apply_update_with_vector(update, None)
    }

    /// Merge an update, storing `state_vector` as given instead of
    /// recomputing it when the caller already has it.
    pub fn apply_update_with_vector(
        &mut self,
        update: &[u8],
        state_vector: Option<&[u8]>,
    ) -> SyncResult<bool> {
        let payload = self.substrate.apply_update(&self.state.payload, update)?;
        if payload == self.state.payload {
            return Ok(false);
        }
        let state_vector = match state_vector {
            Some(sv) => sv.to_vec(),
            None => self.substrate.encode_state_vector(&payload)?,
        };
        self.state = ReplicaState {
            payload,
            state_vector,
        };
        Ok(true)
    }

    /// Everything in this replica unknown to a peer at `peer_state_vector`.
    pub fn diff(&self, peer_state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        self.substrate.diff(&self.state.payload, peer_state_vector)
    }

    /// Current state vector.
    pub fn state_vector(&self) -> &[u8] {
        &self.state.state_vector
    }

    /// Current state.
    pub fn state(&self) -> &ReplicaState {
        &self.state
    }

    /// Replace the whole state, e.g. after a `remote_wins` resolution.
    pub fn replace(&mut self, state: ReplicaState) {
        self.state = state;
    }

    /// Human-readable projection of the current state.
    pub fn project(&self) -> SyncResult<Projection> {
        self.substrate.project(&self.state.payload)
    }

    /// The substrate this replica merges with.
    pub fn substrate(&self) -> &Arc<dyn CrdtSubstrate> {
        &self.substrate
    }
}
