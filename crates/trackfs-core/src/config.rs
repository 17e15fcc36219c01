//! Commit protocol configuration.
//!
//! [`CommitConfig`] captures the retained window, archive batching, the
//! delayed-deletion TTL and the protocol timing knobs. Use
//! [`CommitConfig::list_min`] or [`CommitConfig::two_phase`] for the
//! defaults each protocol ships with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TrackfsError;
use crate::Result;

/// Default retained window: versions kept live behind the newest one.
const DEFAULT_MAX_SAVE_NUM: u64 = 2;

/// Archive backlog above which cleanup switches to batches.
const DEFAULT_MAX_ARCHIVE_SIZE: usize = 100;

/// Largest batch of expired archive markers purged in one sweep.
const DEFAULT_BATCH_CLEAN_MAX: usize = 20;

/// Delayed-deletion TTL for the list-min protocol: 30 seconds.
const LIST_MIN_CLEAN_TTL: Duration = Duration::from_secs(30);

/// Delayed-deletion TTL for the two-phase protocol: 10 minutes.
const TWO_PHASE_CLEAN_TTL: Duration = Duration::from_secs(600);

/// Age after which a finished but unhinted two-phase attempt is repaired.
const DEFAULT_PRE_COMMIT_TTL: Duration = Duration::from_secs(30);

/// Parameters of the archival sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Versions within this distance of the reference version stay live.
    pub max_save_num: u64,

    /// Archive backlog size that enables batch purging.
    pub max_archive_size: usize,

    /// Maximum archive markers purged per sweep when batching.
    pub batch_clean_max: usize,

    /// Delay between archiving a version and deleting its data. Must exceed
    /// any realistic writer's end-to-end latency.
    pub clean_ttl: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_save_num: DEFAULT_MAX_SAVE_NUM,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            batch_clean_max: DEFAULT_BATCH_CLEAN_MAX,
            clean_ttl: LIST_MIN_CLEAN_TTL,
        }
    }
}

/// Configuration shared by both commit protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Archival sweep parameters.
    pub archive: ArchiveConfig,

    /// Overrides the backend's own listing-accuracy bound when set.
    pub listing_accuracy: Option<Duration>,

    /// Two-phase only: age after which another writer's finished attempt
    /// may be hinted on its behalf.
    pub pre_commit_ttl: Duration,

    /// Run the sweep after CommitConflict / CommitTooOld as well, so that
    /// sustained contention cannot starve garbage collection.
    pub sweep_after_conflict: bool,
}

impl CommitConfig {
    /// Defaults for the list-min protocol.
    pub fn list_min() -> Self {
        Self {
            archive: ArchiveConfig::default(),
            listing_accuracy: None,
            pre_commit_ttl: DEFAULT_PRE_COMMIT_TTL,
            sweep_after_conflict: true,
        }
    }

    /// Defaults for the two-phase protocol.
    pub fn two_phase() -> Self {
        Self {
            archive: ArchiveConfig {
                clean_ttl: TWO_PHASE_CLEAN_TTL,
                ..ArchiveConfig::default()
            },
            ..Self::list_min()
        }
    }

    /// Reject settings the protocols cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.archive.clean_ttl.is_zero() {
            return Err(TrackfsError::Config {
                message: "archive clean_ttl must be greater than zero".into(),
            });
        }
        if self.archive.batch_clean_max == 0 {
            return Err(TrackfsError::Config {
                message: "archive batch_clean_max must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self::list_min()
    }
}
