//! Integration test: Protocol B fails fast under contention and recovers
//! stuck sub-versions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use trackfs_commit::{audit_two_phase, CommitStrategy, TwoPhaseCommit};
use trackfs_core::{
    BackendCapabilities, CommitConfig, CommitOutcome, IdGenerator, Layout, Result,
    StorageBackend, StorageEntry, TrackfsError,
};
use trackfs_storage::{MemoryBackend, StorageOp};

fn fast_config() -> CommitConfig {
    CommitConfig {
        pre_commit_ttl: Duration::from_millis(20),
        ..CommitConfig::two_phase()
    }
}

async fn commit_with_retry(
    strategy: &TwoPhaseCommit,
    storage: &dyn StorageBackend,
    root: &str,
    pause: Duration,
) -> CommitOutcome {
    for _ in 0..500 {
        match strategy.commit(storage, root).await {
            Ok(outcome) => return outcome,
            Err(e) if e.is_retryable() => tokio::time::sleep(pause).await,
            Err(e) => panic!("non-retryable commit failure: {e}"),
        }
    }
    panic!("writer never committed");
}

#[tokio::test]
async fn test_single_writer_empty_root() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("");
    let outcome = TwoPhaseCommit::new(Arc::new(IdGenerator::default()))
        .commit(&storage, "")
        .await
        .unwrap();
    assert_eq!((outcome.version, outcome.sub_version), (0, Some(0)));
    assert!(storage.exists(&layout.tracker_marker(0)).await.unwrap());
    assert!(storage.exists(&layout.sub_tracker_marker(0, 0)).await.unwrap());
}

#[tokio::test]
async fn test_visible_pre_commit_fails_second_writer_immediately() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    let ids = Arc::new(IdGenerator::default());

    // Writer A is between its pre-commit record and its hint.
    storage
        .write_no_promise(&layout.tracker_marker(0), Bytes::from("0"))
        .await
        .unwrap();
    storage
        .write_no_promise(&layout.sub_tracker_marker(0, 0), Bytes::from("0"))
        .await
        .unwrap();
    storage
        .write_no_promise(
            &layout.detail_record(0, 0, "PRE_COMMIT-writer-a.txt"),
            Bytes::new(),
        )
        .await
        .unwrap();

    let b = TwoPhaseCommit::new(ids);
    let result = tokio::time::timeout(Duration::from_secs(1), b.commit(&storage, "t"))
        .await
        .expect("a contended attempt must not wait");
    assert!(matches!(
        result,
        Err(TrackfsError::CommitConflict { version: 0, .. })
    ));

    // B wrote nothing into the contested sub-version.
    let entries = storage.list(&layout.detail_dir(0, 0), false).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!storage.exists(&layout.sub_hint(0)).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_writers_commit_distinct_versions() {
    let storage = MemoryBackend::new();
    let ids = Arc::new(IdGenerator::default());

    let writers: Vec<TwoPhaseCommit> = (0..4)
        .map(|_| TwoPhaseCommit::with_config(fast_config(), ids.clone()).unwrap())
        .collect();
    let outcomes = futures::future::join_all(writers.iter().enumerate().map(|(i, w)| {
        let pause = Duration::from_millis(1 + 3 * i as u64);
        let storage = &storage;
        async move { commit_with_retry(w, storage, "t", pause).await }
    }))
    .await;

    let mut versions: Vec<u64> = outcomes.iter().map(|o| o.version).collect();
    versions.sort_unstable();
    versions.dedup();
    assert_eq!(versions.len(), outcomes.len(), "two writers shared a version");

    let report = audit_two_phase(&storage, "t").await.unwrap();
    assert!(report.is_clean(), "{:?}", report.violations);
    assert_eq!(report.finalized, outcomes.len());
}

#[tokio::test]
async fn test_expired_sub_version_is_skipped() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    storage
        .write_no_promise(&layout.sub_tracker_marker(0, 0), Bytes::from("0"))
        .await
        .unwrap();
    storage
        .write_no_promise(&layout.expired_hint(0, 0), Bytes::from("EXPIRED!"))
        .await
        .unwrap();

    let outcome = TwoPhaseCommit::new(Arc::new(IdGenerator::default()))
        .commit(&storage, "t")
        .await
        .unwrap();
    assert_eq!((outcome.version, outcome.sub_version), (0, Some(1)));
    assert!(storage.exists(&layout.sub_tracker_marker(0, 1)).await.unwrap());
}

#[tokio::test]
async fn test_missing_sub_hint_after_failed_write_is_state_unknown() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    storage.inject_failure(StorageOp::Write, layout.sub_hint(0));

    let err = TwoPhaseCommit::new(Arc::new(IdGenerator::default()))
        .commit(&storage, "t")
        .await
        .unwrap_err();
    assert!(matches!(err, TrackfsError::CommitStateUnknown { .. }));
    assert!(err.must_not_clean_up());
    assert!(!storage
        .operations()
        .iter()
        .any(|(op, _)| *op == StorageOp::Delete));
}

/// Delegates to a [`MemoryBackend`], but another writer with the same record
/// name lands its pre-commit record just before ours.
struct NameCollision {
    inner: MemoryBackend,
}

#[async_trait]
impl StorageBackend for NameCollision {
    fn name(&self) -> &'static str {
        "name-collision"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn listing_accuracy(&self) -> Duration {
        self.inner.listing_accuracy()
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, data: Bytes, create_or_overwrite: bool) -> Result<()> {
        if key.contains("/PRE_COMMIT-") {
            self.inner.write_no_promise(key, data.clone()).await?;
        }
        self.inner.write(key, data, create_or_overwrite).await
    }

    async fn write_no_promise(&self, key: &str, data: Bytes) -> Result<()> {
        if key.contains("/PRE_COMMIT-") {
            self.inner.write_no_promise(key, data.clone()).await?;
        }
        self.inner.write_no_promise(key, data).await
    }

    async fn mkdir(&self, key: &str) -> Result<()> {
        self.inner.mkdir(key).await
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        self.inner.delete(key, recursive).await
    }

    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<StorageEntry>> {
        self.inner.list(key, recursive).await
    }

    async fn rename(&self, src: &str, dst: &str, overwrite: bool) -> Result<()> {
        self.inner.rename(src, dst, overwrite).await
    }
}

#[tokio::test]
async fn test_record_name_collision_fails_before_sub_hint() {
    let inner = MemoryBackend::new();
    let storage = NameCollision {
        inner: inner.clone(),
    };
    let layout = Layout::new("t");

    let err = TwoPhaseCommit::new(Arc::new(IdGenerator::default()))
        .commit(&storage, "t")
        .await
        .unwrap_err();
    assert!(matches!(err, TrackfsError::AlreadyExists { .. }), "{err}");
    assert!(!inner.exists(&layout.sub_hint(0)).await.unwrap());

    // Only the colliding pre-commit record exists; phase two never ran.
    let entries = inner.list(&layout.detail_dir(0, 0), false).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].name().starts_with("PRE_COMMIT-"));
}
