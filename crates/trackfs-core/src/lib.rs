//! trackfs core types, traits, configuration, and errors.
//!
//! This crate provides the building blocks shared by the storage backends
//! and the commit protocols: the [`StorageBackend`] capability contract,
//! the versioned [`Layout`](layout::Layout), the process-wide
//! [`IdGenerator`], commit configuration, and the unified error type.

pub mod config;
pub mod error;
pub mod layout;
pub mod storage;
pub mod types;

pub use config::{ArchiveConfig, CommitConfig};
pub use error::TrackfsError;
pub use layout::Layout;
pub use storage::{
    BackendCapabilities, ListingConsistency, RenameSupport, StorageBackend, StorageEntry,
};
pub use types::*;

/// Convenience Result type using [`TrackfsError`].
pub type Result<T> = std::result::Result<T, TrackfsError>;
