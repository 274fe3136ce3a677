//! `yrs`-backed substrate.
//!
//! Document layout:
//! - `content`: Y.Text holding the body (embeds become [`EMBED_PLACEHOLDER`])
//! - `meta`: Y.Map with `author`, `title`, `last_modified`
//! - `settings`, `annotations`, `comments`: auxiliary Y.Maps
//!
//! States are full `encode_state_as_update_v1` snapshots, so a stored state
//! can be shipped to a client as an ordinary update.

use yrs::types::text::YChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Map, MapRef, Options, Out, ReadTxn, StateVector, Text, TextRef,
    Transact, Update,
};

use super::{CrdtSubstrate, Projection, AUX_MAPS, EMBED_PLACEHOLDER};
use crate::error::{SyncError, SyncResult};

/// Name of the Y.Text holding document content.
pub const CONTENT_TEXT: &str = "content";

/// Name of the Y.Map holding structured metadata.
pub const META_MAP: &str = "meta";

/// Encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

/// Production substrate over `yrs` documents.
#[derive(Debug, Clone, Copy)]
pub struct YrsSubstrate {
    /// Garbage-collect tombstoned content when loading states
    gc: bool,
}

impl Default for YrsSubstrate {
    fn default() -> Self {
        Self { gc: true }
    }
}

impl YrsSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the tombstone GC policy. Disabling GC keeps deleted content
    /// around so very old updates can still be integrated, at the cost of
    /// larger states.
    pub fn with_gc(gc: bool) -> Self {
        Self { gc }
    }

    pub fn gc_enabled(&self) -> bool {
        self.gc
    }

    fn options(&self) -> Options {
        Options {
            skip_gc: !self.gc,
            ..Options::default()
        }
    }

    fn load(&self, state: &[u8]) -> SyncResult<Doc> {
        let doc = Doc::with_options(self.options());
        if !state.is_empty() {
            let update = Update::decode_v1(state)
                .map_err(|e| SyncError::malformed(format!("stored state: {e}")))?;
            doc.transact_mut()
                .apply_update(update)
                .map_err(|e| SyncError::malformed(format!("stored state: {e}")))?;
        }
        Ok(doc)
    }

    fn encode(doc: &Doc) -> Vec<u8> {
        doc.transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn decode_vector(bytes: &[u8]) -> SyncResult<StateVector> {
        if bytes.is_empty() {
            return Ok(StateVector::default());
        }
        StateVector::decode_v1(bytes)
            .map_err(|e| SyncError::malformed(format!("state vector: {e}")))
    }

    fn read_map<T: ReadTxn>(map: &MapRef, txn: &T) -> std::collections::BTreeMap<String, String> {
        map.iter(txn)
            .map(|(key, value)| (key.to_string(), value.to_string(txn)))
            .collect()
    }
}

impl CrdtSubstrate for YrsSubstrate {
    fn apply_update(&self, state: &[u8], update: &[u8]) -> SyncResult<Vec<u8>> {
        // Decode before loading so malformed input is rejected cheaply.
        let update = Update::decode_v1(update).map_err(SyncError::malformed)?;
        let doc = self.load(state)?;
        doc.transact_mut()
            .apply_update(update)
            .map_err(SyncError::malformed)?;
        Ok(Self::encode(&doc))
    }

    fn merge_updates(&self, updates: &[Vec<u8>]) -> SyncResult<Vec<u8>> {
        let refs: Vec<&[u8]> = updates.iter().map(|u| u.as_slice()).collect();
        yrs::merge_updates_v1(refs.as_slice()).map_err(SyncError::malformed)
    }

    fn encode_state_vector(&self, state: &[u8]) -> SyncResult<Vec<u8>> {
        let doc = self.load(state)?;
        let sv = doc.transact().state_vector().encode_v1();
        Ok(sv)
    }

    fn diff(&self, state: &[u8], peer_state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let sv = Self::decode_vector(peer_state_vector)?;
        let doc = self.load(state)?;
        let diff = doc.transact().encode_diff_v1(&sv);
        Ok(diff)
    }

    fn is_empty_update(&self, update: &[u8]) -> SyncResult<bool> {
        if update.is_empty() || update == EMPTY_UPDATE_V1.as_slice() {
            return Ok(true);
        }
        Update::decode_v1(update).map_err(SyncError::malformed)?;
        Ok(false)
    }

    fn project(&self, state: &[u8]) -> SyncResult<Projection> {
        let doc = self.load(state)?;
        let content = doc.get_or_insert_text(CONTENT_TEXT);
        let meta = doc.get_or_insert_map(META_MAP);
        let aux: Vec<(&str, MapRef)> = AUX_MAPS
            .iter()
            .map(|name| (*name, doc.get_or_insert_map(*name)))
            .collect();

        let txn = doc.transact();
        let mut projection = Projection::default();
        for chunk in content.diff(&txn, YChange::identity) {
            match chunk.insert {
                Out::Any(Any::String(text)) => projection.content.push_str(&text),
                _ => {
                    projection.content.push(EMBED_PLACEHOLDER);
                    projection.embedded_count += 1;
                }
            }
        }
        projection.metadata = Self::read_map(&meta, &txn);
        for (name, map) in &aux {
            let entries = Self::read_map(map, &txn);
            if !entries.is_empty() {
                projection.auxiliary.insert(name.to_string(), entries);
            }
        }
        Ok(projection)
    }

    // Delete sets are always carried in full by `encode_diff_v1`, so "unseen"
    // is judged on the state vectors alone.
    fn has_unseen(&self, state: &[u8], peer_state: &[u8]) -> SyncResult<bool> {
        let ours = self.load(state)?.transact().state_vector();
        let theirs = self.load(peer_state)?.transact().state_vector();
        Ok(ours
            .iter()
            .any(|(client, clock)| *clock > theirs.get(client)))
    }
}

/// A local `yrs` replica that produces updates, for tests and tooling.
pub struct YrsWriter {
    doc: Doc,
    content: TextRef,
    meta: MapRef,
}

impl YrsWriter {
    pub fn new(client_id: u64) -> Self {
        let doc = Doc::with_client_id(client_id);
        let content = doc.get_or_insert_text(CONTENT_TEXT);
        let meta = doc.get_or_insert_map(META_MAP);
        Self { doc, content, meta }
    }

    /// Append text at the end of the content; returns the update.
    pub fn append_text(&self, text: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let len = self.content.len(&txn);
        self.content.insert(&mut txn, len, text);
        txn.encode_update_v1()
    }

    /// Insert text at `index`; returns the update.
    pub fn insert_text(&self, index: u32, text: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.content.insert(&mut txn, index, text);
        txn.encode_update_v1()
    }

    /// Remove `len` characters starting at `index`; returns the update.
    pub fn remove_text(&self, index: u32, len: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.content.remove_range(&mut txn, index, len);
        txn.encode_update_v1()
    }

    /// Set a metadata field; returns the update.
    pub fn set_meta(&self, key: &str, value: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.meta.insert(&mut txn, key.to_string(), value.to_string());
        txn.encode_update_v1()
    }

    /// Set an entry in one of the auxiliary maps; returns the update.
    pub fn set_aux(&self, map: &str, key: &str, value: &str) -> Vec<u8> {
        let aux = self.doc.get_or_insert_map(map);
        let mut txn = self.doc.transact_mut();
        aux.insert(&mut txn, key.to_string(), value.to_string());
        txn.encode_update_v1()
    }

    /// Integrate a remote update into this replica.
    pub fn apply(&self, update: &[u8]) -> SyncResult<()> {
        let update = Update::decode_v1(update).map_err(SyncError::malformed)?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(SyncError::malformed)
    }

    /// Full state of this replica.
    pub fn state(&self) -> Vec<u8> {
        YrsSubstrate::encode(&self.doc)
    }

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }
}
