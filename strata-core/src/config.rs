//! Per-entity write pipeline options.
//!
//! `Options` deserializes with defaults for every field, so hosts can embed
//! it in their own configuration files:
//!
//! ```
//! use strata_core::{config::Options, snapshot::SnapshotPolicy};
//!
//! let options: Options =
//!     serde_json::from_str(r#"{"snapshot":{"type":"periodic","every":100}}"#).unwrap();
//! assert_eq!(options.snapshot, SnapshotPolicy::Periodic { every: 100 });
//! assert_eq!(options.batch_max_size, 1000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::SnapshotPolicy;

/// Largest number of queued concurrent writes committed in one transaction.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Upper bound on the post-transaction snapshot wait.
pub const DEFAULT_SNAPSHOT_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub snapshot: SnapshotPolicy,
    /// Cap on events drained into one batch commit.
    pub batch_max_size: usize,
    /// Bounded wait for snapshots taken after a commit. Exceeding it does not
    /// undo the commit.
    pub snapshot_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            snapshot: SnapshotPolicy::default(),
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            snapshot_timeout_ms: DEFAULT_SNAPSHOT_TIMEOUT_MS,
        }
    }
}

impl Options {
    #[must_use]
    pub const fn with_snapshot(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot = policy;
        self
    }

    /// Zero is treated as one.
    #[must_use]
    pub const fn with_batch_max_size(mut self, size: usize) -> Self {
        self.batch_max_size = if size == 0 { 1 } else { size };
        self
    }

    #[must_use]
    pub const fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let millis = timeout.as_millis() as u64;
        self.snapshot_timeout_ms = millis;
        self
    }

    #[must_use]
    pub const fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub(crate) const fn batch_limit(&self) -> usize {
        if self.batch_max_size == 0 {
            1
        } else {
            self.batch_max_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = Options::default();
        assert_eq!(options.batch_max_size, 1000);
        assert_eq!(options.snapshot_timeout(), Duration::from_secs(10));
        assert_eq!(options.snapshot, SnapshotPolicy::Deactivation);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let options: Options = serde_json::from_str("{}").unwrap();
        assert_eq!(options, Options::default());
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let options = Options::default().with_batch_max_size(0);
        assert_eq!(options.batch_limit(), 1);

        let options: Options = serde_json::from_str(r#"{"batch_max_size":0}"#).unwrap();
        assert_eq!(options.batch_limit(), 1);
    }

    #[test]
    fn snapshot_timeout_roundtrips_through_millis() {
        let options = Options::default().with_snapshot_timeout(Duration::from_millis(250));
        assert_eq!(options.snapshot_timeout_ms, 250);
        assert_eq!(options.snapshot_timeout(), Duration::from_millis(250));
    }
}
