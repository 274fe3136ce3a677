//! Engine configuration.
//!
//! Every struct has a production `Default` and a `for_testing()` variant with
//! short delays so suites run quickly.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub snapshot: SnapshotPolicy,
    pub retry: RetryPolicy,
    pub offline: OfflineConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            snapshot: SnapshotPolicy::for_testing(),
            retry: RetryPolicy::for_testing(),
            offline: OfflineConfig::for_testing(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

/// When to capture a new document version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Wall-clock time since the last capture (default: 5 minutes)
    pub interval: Duration,
    /// Updates since the last capture, or batch size (default: 50)
    pub update_threshold: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            update_threshold: 50,
        }
    }
}

impl SnapshotPolicy {
    /// Count-driven policy: the interval is long enough never to fire in a test.
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            update_threshold: 3,
        }
    }
}

/// Capped exponential backoff with jitter for version creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 5)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay: Duration,
    /// Hard cap on a single delay
    pub max_delay: Duration,
    /// Add a random term of up to one base step
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: true,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, enable: bool) -> Self {
        self.jitter = enable;
        self
    }

    /// Delay before retry number `attempt` (0 = first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.jitter && !self.base_delay.is_zero() {
            let step = self.base_delay.as_micros() as u64;
            Duration::from_micros(rand::thread_rng().gen_range(0..=step))
        } else {
            Duration::ZERO
        };
        exp.saturating_add(jitter).min(self.max_delay)
    }
}

/// Client-side offline queue behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Bound on queued operations; the oldest are evicted past it
    pub max_queue_size: usize,
    /// Resolve conflicts by merging when every report is auto-resolvable
    pub auto_resolve: bool,
    /// Capacity of the reconciliation event channel
    pub event_capacity: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            auto_resolve: false,
            event_capacity: 256,
        }
    }
}

impl OfflineConfig {
    pub fn for_testing() -> Self {
        Self {
            max_queue_size: 16,
            auto_resolve: false,
            event_capacity: 64,
        }
    }
}

/// Optional content sampling when versions are captured. Off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    /// Characters of content included in a preview
    pub preview_chars: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            preview_chars: 120,
        }
    }
}
