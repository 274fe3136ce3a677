//! Set-union CRDT.
//!
//! Every operation is identified by `(client, clock)`. A state is the set of
//! operations seen so far; merging is set union, so it is commutative,
//! associative and idempotent by construction. Text is the concatenation of
//! text operations in `(clock, client)` order; metadata and auxiliary map
//! entries are last-writer-wins under the same order.
//!
//! Wire format (bincode, standard config):
//! ```text
//! update:       "UNU1" ‖ Vec<UnionOp>           (empty set = zero bytes)
//! state vector: "UNV1" ‖ Vec<(client, clock)>   (contiguous clock prefix)
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{CrdtSubstrate, Projection, EMBED_PLACEHOLDER};
use crate::error::{SyncError, SyncResult};

const UPDATE_MAGIC: &[u8; 4] = b"UNU1";
const VECTOR_MAGIC: &[u8; 4] = b"UNV1";

/// Upper bound on a decoded payload, so garbage length prefixes cannot
/// trigger huge allocations.
const DECODE_LIMIT: usize = 64 * 1024 * 1024;

type OpId = (u64, u64);
type OpSet = BTreeMap<OpId, UnionOpKind>;

/// Operation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnionOpKind {
    /// Append text
    Text(String),
    /// Embedded object with no textual form (image, widget, ...)
    Embed(String),
    /// Set a metadata field
    Meta { key: String, value: String },
    /// Set an entry in an auxiliary map
    Aux {
        map: String,
        key: String,
        value: String,
    },
}

/// A single identified operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionOp {
    pub client: u64,
    /// Per-client counter, starting at 1
    pub clock: u64,
    pub kind: UnionOpKind,
}

/// Deterministic in-memory substrate with union semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionCrdt;

impl UnionCrdt {
    pub fn new() -> Self {
        Self
    }

    /// Decode an update or state into its operation set.
    pub fn decode_ops(bytes: &[u8]) -> SyncResult<Vec<UnionOp>> {
        let set = decode_set(bytes)?;
        Ok(set
            .into_iter()
            .map(|((client, clock), kind)| UnionOp {
                client,
                clock,
                kind,
            })
            .collect())
    }

    /// Encode operations as an update.
    pub fn encode_ops(ops: Vec<UnionOp>) -> SyncResult<Vec<u8>> {
        let mut set = OpSet::new();
        for op in ops {
            insert_op(&mut set, op)?;
        }
        encode_set(&set)
    }
}

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<DECODE_LIMIT>()
}

fn insert_op(set: &mut OpSet, op: UnionOp) -> SyncResult<()> {
    if op.clock == 0 {
        return Err(SyncError::malformed(format!(
            "operation from client {} has clock 0",
            op.client
        )));
    }
    match set.get(&(op.client, op.clock)) {
        Some(existing) if *existing != op.kind => Err(SyncError::malformed(format!(
            "conflicting payloads for operation ({}, {})",
            op.client, op.clock
        ))),
        Some(_) => Ok(()),
        None => {
            set.insert((op.client, op.clock), op.kind);
            Ok(())
        }
    }
}

fn decode_set(bytes: &[u8]) -> SyncResult<OpSet> {
    if bytes.is_empty() {
        return Ok(OpSet::new());
    }
    let body = bytes
        .strip_prefix(UPDATE_MAGIC.as_slice())
        .ok_or_else(|| SyncError::malformed("missing union update header"))?;
    let (ops, read): (Vec<UnionOp>, usize) =
        bincode::serde::decode_from_slice(body, wire_config())
            .map_err(|e| SyncError::malformed(format!("union update: {e}")))?;
    if read != body.len() {
        return Err(SyncError::malformed(format!(
            "{} trailing bytes after union update",
            body.len() - read
        )));
    }

    let mut set = OpSet::new();
    for op in ops {
        insert_op(&mut set, op)?;
    }
    Ok(set)
}

fn encode_set(set: &OpSet) -> SyncResult<Vec<u8>> {
    if set.is_empty() {
        return Ok(Vec::new());
    }
    let ops: Vec<UnionOp> = set
        .iter()
        .map(|(&(client, clock), kind)| UnionOp {
            client,
            clock,
            kind: kind.clone(),
        })
        .collect();
    let body = bincode::serde::encode_to_vec(&ops, wire_config())
        .map_err(|e| SyncError::malformed(format!("encode union update: {e}")))?;
    let mut out = Vec::with_capacity(UPDATE_MAGIC.len() + body.len());
    out.extend_from_slice(UPDATE_MAGIC);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Per client, the highest clock `c` such that `1..=c` are all present.
fn contiguous_vector(set: &OpSet) -> BTreeMap<u64, u64> {
    let mut vector = BTreeMap::new();
    for &(client, clock) in set.keys() {
        let seen = vector.entry(client).or_insert(0u64);
        if clock == *seen + 1 {
            *seen = clock;
        }
    }
    vector
}

fn decode_vector(bytes: &[u8]) -> SyncResult<BTreeMap<u64, u64>> {
    if bytes.is_empty() {
        return Ok(BTreeMap::new());
    }
    let body = bytes
        .strip_prefix(VECTOR_MAGIC.as_slice())
        .ok_or_else(|| SyncError::malformed("missing union state vector header"))?;
    let (entries, _): (Vec<(u64, u64)>, usize) =
        bincode::serde::decode_from_slice(body, wire_config())
            .map_err(|e| SyncError::malformed(format!("union state vector: {e}")))?;
    Ok(entries.into_iter().collect())
}

impl CrdtSubstrate for UnionCrdt {
    fn apply_update(&self, state: &[u8], update: &[u8]) -> SyncResult<Vec<u8>> {
        // Decode the update first so a bad update never touches the state.
        let incoming = decode_set(update)?;
        let mut merged = decode_set(state)?;
        for ((client, clock), kind) in incoming {
            insert_op(&mut merged, UnionOp { client, clock, kind })?;
        }
        encode_set(&merged)
    }

    fn merge_updates(&self, updates: &[Vec<u8>]) -> SyncResult<Vec<u8>> {
        let mut merged = OpSet::new();
        for update in updates {
            for ((client, clock), kind) in decode_set(update)? {
                insert_op(&mut merged, UnionOp { client, clock, kind })?;
            }
        }
        encode_set(&merged)
    }

    fn encode_state_vector(&self, state: &[u8]) -> SyncResult<Vec<u8>> {
        let set = decode_set(state)?;
        let entries: Vec<(u64, u64)> = contiguous_vector(&set).into_iter().collect();
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let body = bincode::serde::encode_to_vec(&entries, wire_config())
            .map_err(|e| SyncError::malformed(format!("encode state vector: {e}")))?;
        let mut out = Vec::with_capacity(VECTOR_MAGIC.len() + body.len());
        out.extend_from_slice(VECTOR_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn diff(&self, state: &[u8], peer_state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let set = decode_set(state)?;
        let vector = decode_vector(peer_state_vector)?;
        let missing: OpSet = set
            .into_iter()
            .filter(|((client, clock), _)| *clock > vector.get(client).copied().unwrap_or(0))
            .collect();
        encode_set(&missing)
    }

    fn is_empty_update(&self, update: &[u8]) -> SyncResult<bool> {
        Ok(decode_set(update)?.is_empty())
    }

    fn project(&self, state: &[u8]) -> SyncResult<Projection> {
        let set = decode_set(state)?;
        let mut ordered: Vec<(&OpId, &UnionOpKind)> = set.iter().collect();
        ordered.sort_by_key(|((client, clock), _)| (*clock, *client));

        let mut projection = Projection::default();
        for (_, kind) in ordered {
            match kind {
                UnionOpKind::Text(text) => projection.content.push_str(text),
                UnionOpKind::Embed(_) => {
                    projection.content.push(EMBED_PLACEHOLDER);
                    projection.embedded_count += 1;
                }
                UnionOpKind::Meta { key, value } => {
                    projection.metadata.insert(key.clone(), value.clone());
                }
                UnionOpKind::Aux { map, key, value } => {
                    projection
                        .auxiliary
                        .entry(map.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
            }
        }
        Ok(projection)
    }

    // Exact set difference; the contiguous vector under-reports replicas
    // that received operations out of order.
    fn has_unseen(&self, state: &[u8], peer_state: &[u8]) -> SyncResult<bool> {
        let ours = decode_set(state)?;
        let theirs = decode_set(peer_state)?;
        Ok(ours.keys().any(|id| !theirs.contains_key(id)))
    }
}

/// Produces single-operation updates for one client.
#[derive(Debug, Clone)]
pub struct UnionWriter {
    client: u64,
    clock: u64,
}

impl UnionWriter {
    pub fn new(client: u64) -> Self {
        Self { client, clock: 0 }
    }

    /// Start at `clock` so the next operation gets `clock + 1`.
    pub fn with_clock(client: u64, clock: u64) -> Self {
        Self { client, clock }
    }

    pub fn client(&self) -> u64 {
        self.client
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn insert_text(&mut self, text: &str) -> Vec<u8> {
        self.emit(UnionOpKind::Text(text.to_string()))
    }

    pub fn embed(&mut self, kind: &str) -> Vec<u8> {
        self.emit(UnionOpKind::Embed(kind.to_string()))
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> Vec<u8> {
        self.emit(UnionOpKind::Meta {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn set_aux(&mut self, map: &str, key: &str, value: &str) -> Vec<u8> {
        self.emit(UnionOpKind::Aux {
            map: map.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn emit(&mut self, kind: UnionOpKind) -> Vec<u8> {
        self.clock += 1;
        let mut set = OpSet::new();
        set.insert((self.client, self.clock), kind);
        // A single well-formed op always encodes.
        encode_set(&set).unwrap_or_default()
    }
}
