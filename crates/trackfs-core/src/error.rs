//! Unified error types for trackfs.
//!
//! All errors are represented by [`TrackfsError`], using `thiserror` for
//! ergonomic definitions. The enum mixes two families:
//!
//! - storage faults raised by a [`StorageBackend`](crate::StorageBackend)
//!   (`Storage`, `NotFound`, `AlreadyExists`, `Unsupported`, ...)
//! - the commit taxonomy surfaced by the commit protocols
//!   (`CommitConflict`, `CommitTooOld`, `DirtyCommit`,
//!   `CommitStateUnknown`, `StructuralCorruption`)
//!
//! Failures during best-effort cleanup after a durable commit never travel
//! through this type to the caller; see [`CleanupIssue`](crate::CleanupIssue).

use thiserror::Error;

/// The unified error type for all trackfs operations.
#[derive(Error, Debug)]
pub enum TrackfsError {
    /// A storage operation failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The requested object was not found in storage.
    #[error("Not found: {key}")]
    NotFound {
        /// The storage key that was not found.
        key: String,
    },

    /// A create-only write found the object already present.
    #[error("Already exists: {key}")]
    AlreadyExists {
        /// The storage key that already exists.
        key: String,
    },

    /// The backend does not provide this capability.
    #[error("Unsupported operation '{operation}' on {backend} backend")]
    Unsupported {
        /// The contract operation that was attempted.
        operation: &'static str,
        /// The backend that rejected it.
        backend: &'static str,
    },

    /// Invalid configuration was provided.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// A record body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Another writer's record was detected for the same (sub)version.
    #[error("Commit conflict at version {version}: {message}")]
    CommitConflict {
        /// The top-level version the attempt targeted.
        version: u64,
        /// What was detected.
        message: String,
    },

    /// The version already held records when this attempt arrived.
    #[error("Commit too old: version {version} already has candidate records")]
    CommitTooOld {
        /// The version that was already contended.
        version: u64,
    },

    /// The commit succeeded locally but fell outside the retained window.
    #[error("Dirty commit at version {version}: tracker advanced to {max_version}")]
    DirtyCommit {
        /// The version this attempt committed and then rolled back.
        version: u64,
        /// The maximum tracker version observed afterwards.
        max_version: u64,
    },

    /// An I/O fault hit the finalizing write and its outcome is unknown.
    ///
    /// The hint may already be durable. Callers must not clean up.
    #[error("Commit state unknown for {key}")]
    CommitStateUnknown {
        /// The hint key whose write could not be confirmed.
        key: String,
        /// The fault raised by the write.
        #[source]
        source: Box<TrackfsError>,
    },

    /// An expected commit directory vanished between listing and use.
    #[error("Structural corruption: {path} disappeared during commit")]
    StructuralCorruption {
        /// The directory that was expected to hold records.
        path: String,
    },

    /// An internal error (bug).
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl TrackfsError {
    /// Create a storage error from a message and source error.
    pub fn storage(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error from a message only.
    pub fn storage_msg(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a commit conflict for `version`.
    pub fn conflict(version: u64, message: impl Into<String>) -> Self {
        Self::CommitConflict {
            version,
            message: message.into(),
        }
    }

    /// Whether the caller may retry the commit at a new (sub)version.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommitConflict { .. } | Self::CommitTooOld { .. } | Self::DirtyCommit { .. }
        )
    }

    /// Whether the commit may already be durable, forbidding any cleanup.
    pub fn must_not_clean_up(&self) -> bool {
        matches!(self, Self::CommitStateUnknown { .. })
    }

    /// Short stable label, used for tallies and structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage { .. } => "storage",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Unsupported { .. } => "unsupported",
            Self::Config { .. } => "config",
            Self::Serialization(_) => "serialization",
            Self::CommitConflict { .. } => "commit_conflict",
            Self::CommitTooOld { .. } => "commit_too_old",
            Self::DirtyCommit { .. } => "dirty_commit",
            Self::CommitStateUnknown { .. } => "commit_state_unknown",
            Self::StructuralCorruption { .. } => "structural_corruption",
            Self::Internal { .. } => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(TrackfsError::conflict(3, "other writer").is_retryable());
        assert!(TrackfsError::CommitTooOld { version: 1 }.is_retryable());
        assert!(TrackfsError::DirtyCommit {
            version: 1,
            max_version: 9
        }
        .is_retryable());
        assert!(!TrackfsError::StructuralCorruption {
            path: "commit/1/".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_state_unknown_forbids_cleanup() {
        let err = TrackfsError::CommitStateUnknown {
            key: "commit/0/COMMIT-HINT.TXT".into(),
            source: Box::new(TrackfsError::storage_msg("connection reset")),
        };
        assert!(err.must_not_clean_up());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "commit_state_unknown");
    }
}
