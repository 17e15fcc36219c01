//! Integration test: version archival runs after commits and after
//! conflicts, and never deletes data before its TTL.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use trackfs_commit::{CommitStrategy, ListMinCommit, TwoPhaseCommit};
use trackfs_core::{ArchiveConfig, CommitConfig, IdGenerator, Layout, StorageBackend, TrackfsError};
use trackfs_storage::MemoryBackend;

fn config(clean_ttl: Duration, sweep_after_conflict: bool) -> CommitConfig {
    CommitConfig {
        archive: ArchiveConfig {
            clean_ttl,
            ..ArchiveConfig::default()
        },
        sweep_after_conflict,
        ..CommitConfig::list_min()
    }
}

async fn archive_names(storage: &MemoryBackend, layout: &Layout) -> Vec<String> {
    storage
        .list(&layout.archive_dir(), false)
        .await
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect()
}

#[tokio::test]
async fn test_old_version_archived_then_purged_after_ttl() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    let strategy = ListMinCommit::with_config(
        config(Duration::from_millis(150), true),
        Arc::new(IdGenerator::default()),
    )
    .unwrap();

    for _ in 0..3 {
        strategy.commit(&storage, "t").await.unwrap();
    }
    assert!(archive_names(&storage, &layout).await.is_empty());

    // Version 3 is more than two versions past 0.
    let outcome = strategy.commit(&storage, "t").await.unwrap();
    assert_eq!(outcome.version, 3);
    assert_eq!(outcome.sweep.archived, vec![0]);
    assert!(outcome.sweep.purged.is_empty());
    assert!(!storage.exists(&layout.tracker_marker(0)).await.unwrap());
    let names = archive_names(&storage, &layout).await;
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("0.txt@"));

    // A slow writer still reading version 0 finds its data intact.
    assert!(storage.exists(&layout.commit_hint(0)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let outcome = strategy.commit(&storage, "t").await.unwrap();
    assert_eq!(outcome.sweep.archived, vec![1]);
    assert_eq!(outcome.sweep.purged, vec![0]);
    assert!(storage
        .list(&layout.version_dir(0), true)
        .await
        .unwrap()
        .is_empty());
    let names = archive_names(&storage, &layout).await;
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("1.txt@"));
}

async fn seed_contested_history(storage: &MemoryBackend, layout: &Layout) {
    for v in 0..=5u64 {
        storage
            .write_no_promise(&layout.tracker_marker(v), Bytes::from(v.to_string()))
            .await
            .unwrap();
    }
    storage
        .write(&layout.record(5, "in-flight"), Bytes::new(), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sweep_runs_after_conflict() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    seed_contested_history(&storage, &layout).await;

    let strategy = ListMinCommit::with_config(
        config(Duration::from_secs(60), true),
        Arc::new(IdGenerator::default()),
    )
    .unwrap();
    let err = strategy.commit(&storage, "t").await.unwrap_err();
    assert!(matches!(err, TrackfsError::CommitTooOld { version: 5 }));

    let names = archive_names(&storage, &layout).await;
    assert_eq!(names.len(), 3);
    for v in 0..=2u64 {
        assert!(!storage.exists(&layout.tracker_marker(v)).await.unwrap());
    }
    assert!(storage.exists(&layout.tracker_marker(3)).await.unwrap());
}

#[tokio::test]
async fn test_sweep_after_conflict_can_be_disabled() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    seed_contested_history(&storage, &layout).await;

    let strategy = ListMinCommit::with_config(
        config(Duration::from_secs(60), false),
        Arc::new(IdGenerator::default()),
    )
    .unwrap();
    assert!(strategy.commit(&storage, "t").await.is_err());
    assert!(archive_names(&storage, &layout).await.is_empty());
}

#[tokio::test]
async fn test_two_phase_commits_archive_old_versions() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    let strategy = TwoPhaseCommit::new(Arc::new(IdGenerator::default()));

    let mut last = None;
    for _ in 0..4 {
        last = Some(strategy.commit(&storage, "t").await.unwrap());
    }
    let last = last.unwrap();
    assert_eq!(last.version, 3);
    assert_eq!(last.sweep.archived, vec![0]);
    // Ten minute TTL: nothing is purged yet.
    assert!(storage.exists(&layout.sub_hint(0)).await.unwrap());
}

#[tokio::test]
async fn test_sweep_failure_is_reported_not_fatal() {
    let storage = MemoryBackend::new();
    let layout = Layout::new("t");
    let strategy = ListMinCommit::new(Arc::new(IdGenerator::default()));
    storage.inject_failure(trackfs_storage::StorageOp::List, layout.archive_dir());

    let outcome = strategy.commit(&storage, "t").await.unwrap();
    assert_eq!(outcome.version, 0);
    assert_eq!(outcome.cleanup_issues.len(), 1);
    assert_eq!(outcome.cleanup_issues[0].stage, "sweep");
}
