//! Conflict classification and resolution.
//!
//! Two replicas conflict only when each holds updates the other has not
//! seen. One-sided divergence is plain lag and is never reported.
//!
//! ```text
//! local ──┐                      ┌── content:  similarity → minor / append / moderate / major
//!         ├─ has_unseen both ways┤── metadata: author, title, last_modified
//! remote ─┘                      └── auxiliary: settings.*, annotations.*, comments.*
//! ```
//!
//! Classification never fails. If the substrate cannot read either state,
//! the result is a single `ManualRequired` report.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::{CrdtSubstrate, Projection, AUX_MAPS, META_AUTHOR, META_LAST_MODIFIED, META_TITLE};
use crate::error::{SyncError, SyncResult};

/// Above this similarity, divergent content is a minor edit conflict.
pub const MINOR_THRESHOLD: f64 = 0.8;

/// Below this similarity, divergent content is a major conflict.
pub const MAJOR_THRESHOLD: f64 = 0.3;

/// Path used for the content report.
pub const CONTENT_PATH: &str = "content";

/// Kind of divergence a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    MinorEditConflict,
    AppendConflict,
    ModerateConflict,
    MajorContentConflict,
    MetadataConflict,
    AuxiliaryConflict,
    ManualRequired,
}

impl Classification {
    /// Higher is more severe. Reports are returned in descending severity.
    pub fn severity(self) -> u8 {
        match self {
            Classification::ManualRequired => 6,
            Classification::MajorContentConflict => 5,
            Classification::ModerateConflict => 4,
            Classification::MetadataConflict => 3,
            Classification::AuxiliaryConflict => 2,
            Classification::AppendConflict => 1,
            Classification::MinorEditConflict => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::MinorEditConflict => "minor_edit_conflict",
            Classification::AppendConflict => "append_conflict",
            Classification::ModerateConflict => "moderate_conflict",
            Classification::MajorContentConflict => "major_content_conflict",
            Classification::MetadataConflict => "metadata_conflict",
            Classification::AuxiliaryConflict => "auxiliary_conflict",
            Classification::ManualRequired => "manual_required",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a caller chooses to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Local replica replaces canonical state
    LocalWins,
    /// Canonical state is kept as is
    RemoteWins,
    /// Newer embedded `last_modified` wins; ties keep canonical
    LastWriteWins,
    /// Union of both replicas
    Merge,
    /// Take no action and surface the reports
    Manual,
}

/// One divergence between a local and a remote replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// What diverged: `content`, a metadata key, or `map.key`
    pub path: String,
    pub local_value: Option<String>,
    pub remote_value: Option<String>,
    pub classification: Classification,
    pub auto_resolvable: bool,
    pub suggested_strategy: ResolutionStrategy,
    /// Content similarity in [0, 1], for content reports
    pub similarity: Option<f64>,
}

impl ConflictReport {
    fn manual(reason: impl Into<String>) -> Self {
        Self {
            path: "document".to_string(),
            local_value: Some(reason.into()),
            remote_value: None,
            classification: Classification::ManualRequired,
            auto_resolvable: false,
            suggested_strategy: ResolutionStrategy::Manual,
            similarity: None,
        }
    }
}

/// Whether every report can be settled without a human.
pub fn all_auto_resolvable(reports: &[ConflictReport]) -> bool {
    reports.iter().all(|r| r.auto_resolvable)
}

/// Normalized edit-distance similarity over characters.
///
/// Identical strings score 1.0, fully disjoint strings of equal length 0.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    // Two rolling rows over the shorter string.
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut curr = vec![0usize; short.len() + 1];

    for (i, lc) in long.iter().enumerate() {
        curr[0] = i + 1;
        for (j, sc) in short.iter().enumerate() {
            let substitution = prev[j] + usize::from(lc != sc);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[short.len()]
}

/// Classify divergent content by similarity, then containment.
pub fn classify_content(local: &str, remote: &str) -> (Classification, f64) {
    let score = similarity(local, remote);
    let classification = if score > MINOR_THRESHOLD {
        Classification::MinorEditConflict
    } else if score < MAJOR_THRESHOLD {
        Classification::MajorContentConflict
    } else if local.contains(remote) || remote.contains(local) {
        Classification::AppendConflict
    } else {
        Classification::ModerateConflict
    };
    (classification, score)
}

/// Inspects two replica states and describes how they diverge.
#[derive(Clone)]
pub struct ConflictClassifier {
    substrate: Arc<dyn CrdtSubstrate>,
}

impl ConflictClassifier {
    pub fn new(substrate: Arc<dyn CrdtSubstrate>) -> Self {
        Self { substrate }
    }

    /// True only when both replicas hold updates unknown to the other.
    pub fn is_conflict(&self, local: &[u8], remote: &[u8]) -> SyncResult<bool> {
        Ok(self.substrate.has_unseen(local, remote)? && self.substrate.has_unseen(remote, local)?)
    }

    /// Severity-ranked reports for two replica states.
    ///
    /// Returns an empty list when the states have not genuinely diverged.
    pub fn classify(&self, local: &[u8], remote: &[u8]) -> Vec<ConflictReport> {
        match self.try_classify(local, remote) {
            Ok(reports) => reports,
            Err(e) => {
                log::warn!("Conflict classification fell back to manual: {e}");
                vec![ConflictReport::manual(e.to_string())]
            }
        }
    }

    fn try_classify(&self, local: &[u8], remote: &[u8]) -> SyncResult<Vec<ConflictReport>> {
        if !self.is_conflict(local, remote)? {
            return Ok(Vec::new());
        }
        let local = self.substrate.project(local)?;
        let remote = self.substrate.project(remote)?;

        let mut reports = Vec::new();
        if let Some(report) = content_report(&local, &remote) {
            reports.push(report);
        }
        reports.extend(metadata_reports(&local, &remote));
        reports.extend(auxiliary_reports(&local, &remote));

        // Stable sort keeps path order within one severity.
        reports.sort_by_key(|r| std::cmp::Reverse(r.classification.severity()));
        log::debug!("Classified {} conflict report(s)", reports.len());
        Ok(reports)
    }
}

fn content_report(local: &Projection, remote: &Projection) -> Option<ConflictReport> {
    if local.content == remote.content {
        return None;
    }
    let (classification, score) = classify_content(&local.content, &remote.content);
    let auto_resolvable = matches!(
        classification,
        Classification::MinorEditConflict | Classification::AppendConflict
    );
    Some(ConflictReport {
        path: CONTENT_PATH.to_string(),
        local_value: Some(local.content.clone()),
        remote_value: Some(remote.content.clone()),
        classification,
        auto_resolvable,
        suggested_strategy: if auto_resolvable {
            ResolutionStrategy::Merge
        } else {
            ResolutionStrategy::Manual
        },
        similarity: Some(score),
    })
}

fn metadata_reports(local: &Projection, remote: &Projection) -> Vec<ConflictReport> {
    [META_AUTHOR, META_TITLE, META_LAST_MODIFIED]
        .into_iter()
        .filter_map(|key| {
            let l = local.metadata.get(key);
            let r = remote.metadata.get(key);
            (l != r).then(|| ConflictReport {
                path: key.to_string(),
                local_value: l.cloned(),
                remote_value: r.cloned(),
                classification: Classification::MetadataConflict,
                auto_resolvable: true,
                suggested_strategy: ResolutionStrategy::LastWriteWins,
                similarity: None,
            })
        })
        .collect()
}

fn auxiliary_reports(local: &Projection, remote: &Projection) -> Vec<ConflictReport> {
    let empty = BTreeMap::new();
    let mut reports = Vec::new();
    for map in AUX_MAPS {
        let l = local.auxiliary.get(*map).unwrap_or(&empty);
        let r = remote.auxiliary.get(*map).unwrap_or(&empty);
        let keys: BTreeSet<&String> = l.keys().chain(r.keys()).collect();
        for key in keys {
            let (lv, rv) = (l.get(key), r.get(key));
            if lv == rv {
                continue;
            }
            reports.push(ConflictReport {
                path: format!("{map}.{key}"),
                local_value: lv.cloned(),
                remote_value: rv.cloned(),
                classification: Classification::AuxiliaryConflict,
                auto_resolvable: true,
                suggested_strategy: ResolutionStrategy::Merge,
                similarity: None,
            });
        }
    }
    reports
}

/// Outcome of applying a strategy to a local/remote pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// New canonical payload
    pub payload: Vec<u8>,
    /// Strategy that took effect (`LastWriteWins` resolves to one side)
    pub applied: ResolutionStrategy,
    /// Whether canonical state differs from before
    pub changed: bool,
}

/// Settle a conflict between `local` and canonical `remote` state.
///
/// `Manual` never touches state and returns [`SyncError::SyncConflict`]
/// carrying `reports`.
pub fn resolve(
    substrate: &dyn CrdtSubstrate,
    doc_id: Uuid,
    local: &[u8],
    remote: &[u8],
    strategy: ResolutionStrategy,
    reports: Vec<ConflictReport>,
) -> SyncResult<Resolved> {
    let applied = match strategy {
        ResolutionStrategy::LastWriteWins => last_writer(substrate, local, remote)?,
        other => other,
    };

    let payload = match applied {
        ResolutionStrategy::LocalWins => local.to_vec(),
        ResolutionStrategy::RemoteWins | ResolutionStrategy::LastWriteWins => remote.to_vec(),
        ResolutionStrategy::Merge => substrate.apply_update(remote, local)?,
        ResolutionStrategy::Manual => {
            return Err(SyncError::SyncConflict { doc_id, reports });
        }
    };
    let changed = payload != remote;
    Ok(Resolved {
        payload,
        applied,
        changed,
    })
}

fn last_writer(
    substrate: &dyn CrdtSubstrate,
    local: &[u8],
    remote: &[u8],
) -> SyncResult<ResolutionStrategy> {
    let local_ts = substrate.project(local)?.last_modified();
    let remote_ts = substrate.project(remote)?.last_modified();
    Ok(match (local_ts, remote_ts) {
        (Some(l), Some(r)) if l > r => ResolutionStrategy::LocalWins,
        (Some(_), None) => ResolutionStrategy::LocalWins,
        _ => ResolutionStrategy::RemoteWins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{UnionCrdt, UnionWriter};

    fn classifier() -> (ConflictClassifier, UnionCrdt) {
        (ConflictClassifier::new(Arc::new(UnionCrdt::new())), UnionCrdt::new())
    }

    fn state(substrate: &UnionCrdt, updates: &[Vec<u8>]) -> Vec<u8> {
        updates.iter().fold(Vec::new(), |s, u| substrate.apply_update(&s, u).unwrap())
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("same", "same"), 1.0);
        assert_eq!(similarity("abcd", "wxyz"), 0.0);
        assert!((similarity("kitten", "sitting") - (1.0 - 3.0 / 7.0)).abs() < 1e-9);
        assert_eq!(similarity("", "abc"), 0.0);
    }

    #[test]
    fn test_similarity_counts_chars_not_bytes() {
        assert_eq!(similarity("héllo", "héllo"), 1.0);
        assert!((similarity("héllo", "hello") - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_classify_content_thresholds() {
        let (c, _) = classify_content("The quick brown fox", "The quick brown fix");
        assert_eq!(c, Classification::MinorEditConflict);

        let (c, score) = classify_content("abcdefghij", "0123456789");
        assert_eq!(c, Classification::MajorContentConflict);
        assert!(score < MAJOR_THRESHOLD);

        // 10 of 16 chars shared as a prefix: similarity 0.625, containment holds.
        let (c, _) = classify_content("meeting at", "meeting at noon!");
        assert_eq!(c, Classification::AppendConflict);

        let (c, _) = classify_content("alpha beta", "alpha gamma");
        assert_eq!(c, Classification::ModerateConflict);
    }

    #[test]
    fn test_lag_is_not_a_conflict() {
        let (classifier, substrate) = classifier();
        let mut w = UnionWriter::new(1);
        let base = state(&substrate, &[w.insert_text("base")]);
        let ahead = substrate.apply_update(&base, &w.insert_text(" more")).unwrap();

        assert!(!classifier.is_conflict(&base, &ahead).unwrap());
        assert!(classifier.classify(&base, &ahead).is_empty());
        assert!(classifier.classify(&ahead, &base).is_empty());
    }

    #[test]
    fn test_major_conflict_detected() {
        let (classifier, substrate) = classifier();
        let local = state(&substrate, &[UnionWriter::new(1).insert_text("abcdefghij")]);
        let remote = state(&substrate, &[UnionWriter::new(2).insert_text("0123456789")]);

        let reports = classifier.classify(&local, &remote);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].classification, Classification::MajorContentConflict);
        assert!(!reports[0].auto_resolvable);
        assert_eq!(reports[0].suggested_strategy, ResolutionStrategy::Manual);
    }

    #[test]
    fn test_metadata_and_aux_reports_ranked() {
        let (classifier, substrate) = classifier();
        let mut a = UnionWriter::new(1);
        let mut b = UnionWriter::new(2);
        let local = state(
            &substrate,
            &[a.set_meta("title", "Draft"), a.set_aux("settings", "theme", "dark")],
        );
        let remote = state(
            &substrate,
            &[b.set_meta("title", "Final"), b.set_aux("settings", "theme", "light")],
        );

        let reports = classifier.classify(&local, &remote);
        let paths: Vec<&str> = reports.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["title", "settings.theme"]);
        assert!(all_auto_resolvable(&reports));
        assert_eq!(reports[0].suggested_strategy, ResolutionStrategy::LastWriteWins);
    }

    #[test]
    fn test_unreadable_state_yields_manual_report() {
        let (classifier, _) = classifier();
        let reports = classifier.classify(b"garbage", b"more garbage");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].classification, Classification::ManualRequired);
        assert!(!all_auto_resolvable(&reports));
    }

    #[test]
    fn test_resolve_strategies() {
        let substrate = UnionCrdt::new();
        let doc = Uuid::new_v4();
        let mut a = UnionWriter::new(1);
        let mut b = UnionWriter::new(2);
        let local = state(&substrate, &[a.insert_text("L"), a.set_meta("last_modified", "200")]);
        let remote = state(&substrate, &[b.insert_text("R"), b.set_meta("last_modified", "100")]);

        let r = resolve(&substrate, doc, &local, &remote, ResolutionStrategy::RemoteWins, vec![]).unwrap();
        assert!(!r.changed);
        assert_eq!(r.payload, remote);

        let r = resolve(&substrate, doc, &local, &remote, ResolutionStrategy::LocalWins, vec![]).unwrap();
        assert_eq!(r.payload, local);

        let r = resolve(&substrate, doc, &local, &remote, ResolutionStrategy::LastWriteWins, vec![]).unwrap();
        assert_eq!(r.applied, ResolutionStrategy::LocalWins);

        let r = resolve(&substrate, doc, &remote, &local, ResolutionStrategy::LastWriteWins, vec![]).unwrap();
        assert_eq!(r.applied, ResolutionStrategy::RemoteWins);

        let r = resolve(&substrate, doc, &local, &remote, ResolutionStrategy::Merge, vec![]).unwrap();
        let content = substrate.project(&r.payload).unwrap().content;
        assert!(content.contains('L') && content.contains('R'));

        let err = resolve(&substrate, doc, &local, &remote, ResolutionStrategy::Manual, vec![]).unwrap_err();
        assert!(matches!(err, SyncError::SyncConflict { .. }));
    }
}
