//! Filesystem-backed storage backend.
//!
//! [`LocalBackend`] implements the [`StorageBackend`] contract on the local
//! filesystem. Every write is staged into a hidden directory under the base
//! and then published:
//!
//! - overwriting writes publish with `rename`, which replaces atomically
//! - create-only writes publish with `hard_link`, which fails atomically
//!   with `EEXIST` when the target is present, so readers never observe a
//!   half-written record
//!
//! Listing reflects writes immediately. Names starting with `.` are never
//! listed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, instrument};

use trackfs_core::error::TrackfsError;
use trackfs_core::storage::{
    BackendCapabilities, ListingConsistency, RenameSupport, StorageBackend, StorageEntry,
};
use trackfs_core::Result;

/// Hidden directory holding in-flight writes.
const STAGING_DIR: &str = ".trackfs-staging";

/// Listing accuracy for local disks: listings are immediate, this only
/// absorbs coarse mtime granularity.
const DEFAULT_LISTING_ACCURACY: Duration = Duration::from_millis(100);

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A [`StorageBackend`] backed by the local filesystem.
///
/// All keys are mapped to paths under the configured `base_dir`.
/// Parent directories are created automatically on write.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_dir: PathBuf,
    listing_accuracy: Duration,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join(STAGING_DIR))
            .await
            .map_err(|e| {
                TrackfsError::storage(
                    format!("Failed to create base directory: {}", base_dir.display()),
                    e,
                )
            })?;
        debug!(base_dir = %base_dir.display(), "LocalBackend initialised");
        Ok(Self {
            base_dir,
            listing_accuracy: DEFAULT_LISTING_ACCURACY,
        })
    }

    /// Override the listing-accuracy bound reported to the protocols.
    pub fn with_listing_accuracy(mut self, accuracy: Duration) -> Self {
        self.listing_accuracy = accuracy;
        self
    }

    /// Return the full filesystem path for a storage key.
    fn key_to_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key.trim_matches('/'))
    }

    /// Return the base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write `data` to a fresh staging file and return its path.
    async fn stage(&self, data: &Bytes) -> Result<PathBuf> {
        let seq = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
        let staged = self
            .base_dir
            .join(STAGING_DIR)
            .join(format!("{}-{seq}", std::process::id()));
        fs::write(&staged, data).await.map_err(|e| {
            TrackfsError::storage(format!("Failed to stage {}", staged.display()), e)
        })?;
        Ok(staged)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                TrackfsError::storage(
                    format!("Failed to create parent directories for {}", path.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            atomic_create: true,
            listing: ListingConsistency::Immediate,
            rename: RenameSupport::Atomic,
        }
    }

    fn listing_accuracy(&self) -> Duration {
        self.listing_accuracy
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_to_path(key);
        let exists = fs::try_exists(&path).await.map_err(|e| {
            TrackfsError::storage(format!("Failed to stat {}", path.display()), e)
        })?;
        debug!("exists {} → {}", key, exists);
        Ok(exists)
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key);
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrackfsError::NotFound {
                    key: key.to_string(),
                }
            } else {
                TrackfsError::storage(format!("Failed to read {}", path.display()), e)
            }
        })?;
        debug!("Read {} bytes from {}", data.len(), key);
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn write(&self, key: &str, data: Bytes, create_or_overwrite: bool) -> Result<()> {
        let path = self.key_to_path(key);
        Self::ensure_parent(&path).await?;
        let staged = self.stage(&data).await?;

        if create_or_overwrite {
            fs::rename(&staged, &path).await.map_err(|e| {
                TrackfsError::storage(format!("Failed to write {}", path.display()), e)
            })?;
            debug!("Wrote {} bytes to {}", data.len(), key);
            return Ok(());
        }

        let key_owned = key.to_string();
        tokio::task::spawn_blocking(move || {
            let linked = match std::fs::hard_link(&staged, &path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(TrackfsError::AlreadyExists { key: key_owned })
                }
                Err(e) => Err(TrackfsError::storage(
                    format!("Failed to create {}", path.display()),
                    e,
                )),
            };
            let _ = std::fs::remove_file(&staged);
            linked
        })
        .await
        .map_err(|e| TrackfsError::Internal {
            message: format!("Blocking task panicked: {e}"),
        })??;

        debug!("Created {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn write_no_promise(&self, key: &str, data: Bytes) -> Result<()> {
        self.write(key, data, true).await
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn mkdir(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key);
        fs::create_dir_all(&path).await.map_err(|e| {
            TrackfsError::storage(format!("Failed to create directory {}", path.display()), e)
        })
    }

    #[instrument(skip(self), fields(key = %key, recursive))]
    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let path = self.key_to_path(key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Delete {}: already absent", key);
                return Ok(());
            }
            Err(e) => {
                return Err(TrackfsError::storage(
                    format!("Failed to stat {}", path.display()),
                    e,
                ))
            }
        };

        let result = match (meta.is_dir(), recursive) {
            (true, true) => fs::remove_dir_all(&path).await,
            (true, false) => fs::remove_dir(&path).await,
            (false, _) => fs::remove_file(&path).await,
        };
        match result {
            Ok(()) => {
                debug!("Deleted {}", key);
                Ok(())
            }
            // Lost a race with another deleter.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TrackfsError::storage(
                format!("Failed to delete {}", path.display()),
                e,
            )),
        }
    }

    #[instrument(skip(self), fields(key = %key, recursive))]
    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<StorageEntry>> {
        let dir = self.key_to_path(key);
        let mut results = Vec::new();
        list_dir(&dir, recursive, &mut results).await?;
        results.sort_by(|a, b| a.absolute_path().cmp(b.absolute_path()));
        debug!("Listed {} entries under '{}'", results.len(), key);
        Ok(results)
    }

    #[instrument(skip(self), fields(src = %src, dst = %dst, overwrite))]
    async fn rename(&self, src: &str, dst: &str, overwrite: bool) -> Result<()> {
        let from = self.key_to_path(src);
        let to = self.key_to_path(dst);
        Self::ensure_parent(&to).await?;

        if overwrite {
            return fs::rename(&from, &to).await.map_err(|e| {
                TrackfsError::storage(format!("Failed to rename {}", from.display()), e)
            });
        }

        let dst_owned = dst.to_string();
        tokio::task::spawn_blocking(move || {
            match std::fs::hard_link(&from, &to) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(TrackfsError::AlreadyExists { key: dst_owned });
                }
                Err(e) => {
                    return Err(TrackfsError::storage(
                        format!("Failed to rename {}", from.display()),
                        e,
                    ))
                }
            }
            std::fs::remove_file(&from).map_err(|e| {
                TrackfsError::storage(format!("Failed to unlink {}", from.display()), e)
            })
        })
        .await
        .map_err(|e| TrackfsError::Internal {
            message: format!("Blocking task panicked: {e}"),
        })?
    }
}

/// Collect file entries under `dir`, descending into subdirectories when
/// `recursive`.
async fn list_dir(dir: &Path, recursive: bool, results: &mut Vec<StorageEntry>) -> Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(TrackfsError::storage(
                format!("Failed to read directory {}", dir.display()),
                e,
            ))
        }
    };

    while let Some(entry) = entries.next_entry().await.map_err(|e| {
        TrackfsError::storage(
            format!("Failed to read directory entry in {}", dir.display()),
            e,
        )
    })? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(meta) => meta,
            // Deleted between read_dir and stat.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(TrackfsError::storage(
                    format!("Failed to stat {}", entry.path().display()),
                    e,
                ))
            }
        };
        let path = entry.path();
        if meta.is_dir() {
            if recursive {
                Box::pin(list_dir(&path, recursive, results)).await?;
            }
            continue;
        }
        let modified = meta.modified().map_err(|e| {
            TrackfsError::storage(format!("No mtime for {}", path.display()), e)
        })?;
        results.push(StorageEntry::new(
            name,
            DateTime::<Utc>::from(modified),
            path.to_string_lossy(),
        ));
    }

    Ok(())
}
