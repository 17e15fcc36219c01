//! The StorageBackend trait: the storage capability contract.
//!
//! Both commit protocols reach storage only through this trait. A backend
//! is an interchangeable strategy object: [`LocalBackend`](crate), the
//! S3-compatible backend and the in-memory simulator all implement it.
//!
//! Keys are `/`-separated and relative to the backend root. A key that
//! names a directory ends with `/`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::Result;

/// One child object returned by [`StorageBackend::list`].
///
/// Constructed once at listing time and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    name: String,
    last_modified: DateTime<Utc>,
    absolute_path: String,
}

impl StorageEntry {
    /// Create an entry as observed by a listing.
    pub fn new(
        name: impl Into<String>,
        last_modified: DateTime<Utc>,
        absolute_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            last_modified,
            absolute_path: absolute_path.into(),
        }
    }

    /// The final path segment of the object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The modification time reported by the backend.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// The backend-specific absolute location of the object.
    pub fn absolute_path(&self) -> &str {
        &self.absolute_path
    }
}

/// How soon a write becomes visible to [`StorageBackend::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingConsistency {
    /// Listing reflects every completed write.
    Immediate,
    /// Listing may lag behind writes by a bounded or unbounded delay.
    Eventual,
}

/// What [`StorageBackend::rename`] can do on this backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameSupport {
    /// Rename with and without overwrite, both atomic.
    Atomic,
    /// Only overwriting rename is available.
    OverwriteOnly,
    /// No rename at all.
    None,
}

/// Guarantees a backend documents about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Whether create-without-overwrite is atomic against concurrent writers.
    pub atomic_create: bool,
    /// Listing visibility of recent writes.
    pub listing: ListingConsistency,
    /// Rename support.
    pub rename: RenameSupport,
}

/// The storage capability contract consumed by the commit protocols.
///
/// Implementations must be `Send + Sync` for use across async tasks.
/// There are no default method bodies: a backend lacking a capability
/// returns [`TrackfsError::Unsupported`](crate::TrackfsError::Unsupported)
/// from that method explicitly.
///
/// # Listing
///
/// Callers must treat [`list`](StorageBackend::list) as a recent snapshot,
/// not necessarily including every write made microseconds ago.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Atomicity and consistency guarantees of this backend.
    fn capabilities(&self) -> BackendCapabilities;

    /// Approximate write-to-list visibility delay.
    fn listing_accuracy(&self) -> Duration;

    /// Check whether an object (or directory) exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read a whole object. Returns `NotFound` if it does not exist.
    async fn read(&self, key: &str) -> Result<Bytes>;

    /// Write a whole object.
    ///
    /// With `create_or_overwrite == false` the write fails with
    /// `AlreadyExists` when the object is present.
    async fn write(&self, key: &str, data: Bytes, create_or_overwrite: bool) -> Result<()>;

    /// Best-effort write used for markers. No atomicity or overwrite promise.
    async fn write_no_promise(&self, key: &str, data: Bytes) -> Result<()>;

    /// Create a directory. Succeeds if it already exists.
    async fn mkdir(&self, key: &str) -> Result<()>;

    /// Delete one object, or a whole subtree when `recursive`.
    ///
    /// Deleting something absent is not an error.
    async fn delete(&self, key: &str, recursive: bool) -> Result<()>;

    /// List child objects of a directory, sorted by name.
    ///
    /// Non-recursive listings return direct child objects only, never
    /// subdirectories. A missing directory lists as empty.
    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<StorageEntry>>;

    /// Rename an object.
    async fn rename(&self, src: &str, dst: &str, overwrite: bool) -> Result<()>;
}
