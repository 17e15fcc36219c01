//! Storage backend implementations for trackfs.
//!
//! This crate provides concrete implementations of the
//! [`StorageBackend`](trackfs_core::StorageBackend) contract:
//!
//! - [`LocalBackend`]: filesystem storage with atomic create and rename
//! - [`S3Backend`]: S3-compatible object storage
//! - [`MemoryBackend`]: in-process simulator with listing lag and fault injection

pub mod local;
pub mod memory;
pub mod s3;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use trackfs_core::error::TrackfsError;
use trackfs_core::storage::StorageBackend;
use trackfs_core::Result;

pub use local::LocalBackend;
pub use memory::{MemoryBackend, StorageOp};
pub use s3::S3Backend;

/// Open a backend from a storage URI.
///
/// - `s3://bucket/prefix?region=..` selects [`S3Backend`]
/// - `memory://` selects a fresh [`MemoryBackend`]
/// - `local://<path>` or a bare path selects [`LocalBackend`]; `~/` expands
///   to the home directory
pub async fn open_backend(uri: &str) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = if uri.starts_with("s3://") {
        Arc::new(S3Backend::new(uri)?)
    } else if uri.starts_with("memory://") {
        Arc::new(MemoryBackend::new())
    } else {
        let path = uri.strip_prefix("local://").unwrap_or(uri);

        let expanded = if let Some(rest) = path.strip_prefix("~/") {
            let home = home_dir().ok_or_else(|| TrackfsError::Config {
                message: "Cannot determine home directory".to_string(),
            })?;
            home.join(rest)
        } else {
            PathBuf::from(path)
        };

        Arc::new(LocalBackend::new(expanded).await?)
    };

    info!(
        backend = backend.name(),
        uri,
        listing_accuracy_ms = backend.listing_accuracy().as_millis() as u64,
        "Storage backend opened"
    );
    Ok(backend)
}

/// Best-effort home directory detection.
fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}
