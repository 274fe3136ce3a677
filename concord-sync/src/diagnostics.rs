//! Optional content sampling when versions are captured.
//!
//! Disabled unless [`DiagnosticsConfig::enabled`] is set. Hooks only observe;
//! they cannot influence merging or versioning.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::DiagnosticsConfig;
use crate::crdt::{Projection, EMBED_PLACEHOLDER};

/// What a hook sees for each captured version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPreview {
    pub doc_id: Uuid,
    pub version: u64,
    /// Leading characters of the projected content
    pub preview: String,
    pub content_chars: usize,
    /// Embedded items rendered as the placeholder
    pub embedded_count: usize,
}

impl VersionPreview {
    pub fn new(doc_id: Uuid, version: u64, projection: &Projection, preview_chars: usize) -> Self {
        Self {
            doc_id,
            version,
            preview: projection.content.chars().take(preview_chars).collect(),
            content_chars: projection.content.chars().count(),
            embedded_count: projection.embedded_count,
        }
    }

    /// Offsets (in chars) of embedded placeholders within the preview.
    pub fn embed_offsets(&self) -> Vec<usize> {
        self.preview
            .chars()
            .enumerate()
            .filter(|(_, c)| *c == EMBED_PLACEHOLDER)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Observer for captured versions.
pub trait DiagnosticHook: Send + Sync {
    fn on_version_captured(&self, preview: &VersionPreview);
}

/// Hook that writes previews to the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl DiagnosticHook for LogDiagnostics {
    fn on_version_captured(&self, preview: &VersionPreview) {
        log::debug!(
            "Version {} of {}: {} chars, {} embed(s) at {:?}: {:?}",
            preview.version,
            preview.doc_id,
            preview.content_chars,
            preview.embedded_count,
            preview.embed_offsets(),
            preview.preview
        );
    }
}

/// Hook installed for a config: `LogDiagnostics` when enabled, else none.
pub fn hook_for(config: &DiagnosticsConfig) -> Option<Arc<dyn DiagnosticHook>> {
    config
        .enabled
        .then(|| Arc::new(LogDiagnostics) as Arc<dyn DiagnosticHook>)
}
