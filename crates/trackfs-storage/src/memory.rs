//! In-memory storage simulator with operation tracing.
//!
//! [`MemoryBackend`] keeps objects in a shared map and can imitate the
//! weaker backends the protocols are built for:
//!
//! - a listing lag: new objects stay invisible to `list` for a while, the
//!   way eventually consistent object stores behave
//! - injected failures per operation and key prefix
//! - "ghost" writes that land but still report an error
//!
//! Clones share state, so one clone per simulated writer is the usual setup.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use trackfs_core::error::TrackfsError;
use trackfs_core::storage::{
    BackendCapabilities, ListingConsistency, RenameSupport, StorageBackend, StorageEntry,
};
use trackfs_core::Result;

const DEFAULT_LISTING_ACCURACY: Duration = Duration::from_millis(5);

/// A contract operation, as recorded in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Exists,
    Read,
    Write,
    WriteNoPromise,
    Mkdir,
    Delete,
    List,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Fault {
    /// The operation fails without effect.
    Fail,
    /// The write is applied, then an error is reported anyway.
    Ghost,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    /// When the object becomes visible to listings.
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    dirs: BTreeSet<String>,
    faults: Vec<(StorageOp, String, Fault)>,
    operations: Vec<(StorageOp, String)>,
}

/// In-memory [`StorageBackend`] with listing lag and fault injection.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    listing_lag: Duration,
    listing_accuracy: Duration,
}

impl MemoryBackend {
    /// A strongly consistent store: listings see every completed write.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            listing_lag: Duration::ZERO,
            listing_accuracy: DEFAULT_LISTING_ACCURACY,
        }
    }

    /// A store whose listings miss objects younger than `lag`.
    pub fn with_listing_lag(lag: Duration) -> Self {
        Self {
            listing_lag: lag,
            ..Self::new()
        }
    }

    /// Override the listing-accuracy bound reported to the protocols.
    pub fn with_listing_accuracy(mut self, accuracy: Duration) -> Self {
        self.listing_accuracy = accuracy;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `op` fail for every key starting with `prefix`.
    pub fn inject_failure(&self, op: StorageOp, prefix: impl Into<String>) {
        self.lock().faults.push((op, prefix.into(), Fault::Fail));
    }

    /// Make writes under `prefix` land but report an error.
    pub fn inject_ghost_write(&self, prefix: impl Into<String>) {
        self.lock()
            .faults
            .push((StorageOp::Write, prefix.into(), Fault::Ghost));
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.lock().faults.clear();
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<(StorageOp, String)> {
        self.lock().operations.clone()
    }

    /// Returns all stored object keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Pin the modification time of an object.
    pub fn set_last_modified(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        let object = state
            .objects
            .get_mut(normalize(key))
            .ok_or_else(|| TrackfsError::NotFound {
                key: key.to_string(),
            })?;
        object.last_modified = at;
        Ok(())
    }

    /// Record `op` and return the fault injected for it, if any.
    fn enter(&self, op: StorageOp, key: &str) -> Option<Fault> {
        let mut state = self.lock();
        state.operations.push((op, key.to_string()));
        state
            .faults
            .iter()
            .find(|(o, prefix, _)| *o == op && key.starts_with(prefix.as_str()))
            .map(|(_, _, fault)| fault.clone())
    }

    fn injected(op: StorageOp, key: &str) -> TrackfsError {
        TrackfsError::storage_msg(format!("Injected {op:?} failure for {key}"))
    }

    fn put(&self, state: &mut State, key: &str, data: Bytes) {
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
                visible_at: Instant::now() + self.listing_lag,
            },
        );
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(key: &str) -> &str {
    key.trim_start_matches('/')
}

/// `a/b/` and `a/b` both become the child prefix `a/b/`; the root is empty.
fn dir_prefix(key: &str) -> String {
    let trimmed = key.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            atomic_create: true,
            listing: if self.listing_lag.is_zero() {
                ListingConsistency::Immediate
            } else {
                ListingConsistency::Eventual
            },
            rename: RenameSupport::Atomic,
        }
    }

    fn listing_accuracy(&self) -> Duration {
        self.listing_accuracy
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.enter(StorageOp::Exists, key).is_some() {
            return Err(Self::injected(StorageOp::Exists, key));
        }
        let state = self.lock();
        let prefix = dir_prefix(key);
        let exists = state.objects.contains_key(normalize(key))
            || state.dirs.contains(&prefix)
            || state.objects.keys().any(|k| k.starts_with(&prefix));
        Ok(exists)
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        if self.enter(StorageOp::Read, key).is_some() {
            return Err(Self::injected(StorageOp::Read, key));
        }
        self.lock()
            .objects
            .get(normalize(key))
            .map(|o| o.data.clone())
            .ok_or_else(|| TrackfsError::NotFound {
                key: key.to_string(),
            })
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn write(&self, key: &str, data: Bytes, create_or_overwrite: bool) -> Result<()> {
        let fault = self.enter(StorageOp::Write, key);
        if fault == Some(Fault::Fail) {
            return Err(Self::injected(StorageOp::Write, key));
        }
        {
            let mut state = self.lock();
            let key = normalize(key);
            if !create_or_overwrite && state.objects.contains_key(key) {
                return Err(TrackfsError::AlreadyExists {
                    key: key.to_string(),
                });
            }
            self.put(&mut state, key, data);
        }
        if fault == Some(Fault::Ghost) {
            debug!("Ghost write landed for {}", key);
            return Err(Self::injected(StorageOp::Write, key));
        }
        Ok(())
    }

    async fn write_no_promise(&self, key: &str, data: Bytes) -> Result<()> {
        if self.enter(StorageOp::WriteNoPromise, key).is_some() {
            return Err(Self::injected(StorageOp::WriteNoPromise, key));
        }
        let mut state = self.lock();
        self.put(&mut state, normalize(key), data);
        Ok(())
    }

    async fn mkdir(&self, key: &str) -> Result<()> {
        if self.enter(StorageOp::Mkdir, key).is_some() {
            return Err(Self::injected(StorageOp::Mkdir, key));
        }
        self.lock().dirs.insert(dir_prefix(key));
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        if self.enter(StorageOp::Delete, key).is_some() {
            return Err(Self::injected(StorageOp::Delete, key));
        }
        let mut state = self.lock();
        state.objects.remove(normalize(key));
        if recursive {
            let prefix = dir_prefix(key);
            state.objects.retain(|k, _| !k.starts_with(&prefix));
            state.dirs.retain(|d| !d.starts_with(&prefix));
        }
        Ok(())
    }

    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<StorageEntry>> {
        if self.enter(StorageOp::List, key).is_some() {
            return Err(Self::injected(StorageOp::List, key));
        }
        let prefix = dir_prefix(key);
        let now = Instant::now();
        let state = self.lock();
        // BTreeMap iteration keeps the listing sorted.
        let entries = state
            .objects
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(_, o)| o.visible_at <= now)
            .filter_map(|(k, o)| {
                let rest = &k[prefix.len()..];
                if !recursive && rest.contains('/') {
                    return None;
                }
                let name = rest.rsplit('/').next().unwrap_or(rest);
                Some(StorageEntry::new(name, o.last_modified, format!("memory://{k}")))
            })
            .collect();
        Ok(entries)
    }

    async fn rename(&self, src: &str, dst: &str, overwrite: bool) -> Result<()> {
        if self.enter(StorageOp::Rename, src).is_some() {
            return Err(Self::injected(StorageOp::Rename, src));
        }
        let mut state = self.lock();
        let (src, dst) = (normalize(src), normalize(dst));
        if !overwrite && state.objects.contains_key(dst) {
            return Err(TrackfsError::AlreadyExists {
                key: dst.to_string(),
            });
        }
        let object = state
            .objects
            .remove(src)
            .ok_or_else(|| TrackfsError::NotFound {
                key: src.to_string(),
            })?;
        state.objects.insert(dst.to_string(), object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_only_and_read() {
        let backend = MemoryBackend::new();
        backend.write("a/b", Bytes::from("1"), false).await.unwrap();
        let again = backend.write("a/b", Bytes::from("2"), false).await;
        assert!(matches!(again, Err(TrackfsError::AlreadyExists { .. })));
        assert_eq!(backend.read("a/b").await.unwrap(), Bytes::from("1"));
    }

    #[tokio::test]
    async fn test_list_children_not_prefix_siblings() {
        let backend = MemoryBackend::new();
        backend.write("commit/1/r", Bytes::new(), false).await.unwrap();
        backend.write("commit/15/r", Bytes::new(), false).await.unwrap();
        backend
            .write("commit/1/sub-hint/x", Bytes::new(), false)
            .await
            .unwrap();

        let listed = backend.list("commit/1/", false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].absolute_path(), "memory://commit/1/r");

        let recursive = backend.list("commit/1/", true).await.unwrap();
        assert_eq!(recursive.len(), 2);
    }

    #[tokio::test]
    async fn test_listing_lag_hides_fresh_objects() {
        let backend = MemoryBackend::with_listing_lag(Duration::from_millis(50));
        backend.write("t/0.txt", Bytes::new(), false).await.unwrap();
        assert!(backend.exists("t/0.txt").await.unwrap());
        assert!(backend.list("t/", false).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(backend.list("t/", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_recursive_respects_boundaries() {
        let backend = MemoryBackend::new();
        backend.write("commit/1/a", Bytes::new(), false).await.unwrap();
        backend.write("commit/15/a", Bytes::new(), false).await.unwrap();
        backend.delete("commit/1/", true).await.unwrap();
        assert_eq!(backend.keys(), vec!["commit/15/a".to_string()]);
    }

    #[tokio::test]
    async fn test_ghost_write_lands_and_errors() {
        let backend = MemoryBackend::new();
        backend.inject_ghost_write("commit/0/COMMIT-HINT.TXT");
        let result = backend
            .write("commit/0/COMMIT-HINT.TXT", Bytes::from("r"), false)
            .await;
        assert!(matches!(result, Err(TrackfsError::Storage { .. })));
        assert!(backend.exists("commit/0/COMMIT-HINT.TXT").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failure_and_trace() {
        let backend = MemoryBackend::new();
        backend.inject_failure(StorageOp::List, "tracker/");
        assert!(backend.list("tracker/", false).await.is_err());
        backend.clear_failures();
        assert!(backend.list("tracker/", false).await.is_ok());
        assert_eq!(
            backend.operations(),
            vec![
                (StorageOp::List, "tracker/".to_string()),
                (StorageOp::List, "tracker/".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_mkdir_exists_and_rename() {
        let backend = MemoryBackend::new();
        backend.mkdir("archive/").await.unwrap();
        assert!(backend.exists("archive/").await.unwrap());
        backend.write("x", Bytes::from("x"), true).await.unwrap();
        backend.write("y", Bytes::from("y"), true).await.unwrap();
        assert!(backend.rename("x", "y", false).await.is_err());
        backend.rename("x", "y", true).await.unwrap();
        assert_eq!(backend.read("y").await.unwrap(), Bytes::from("x"));
    }
}
