//! Integration test: every backend honours the same capability contract.
//!
//! Runs one behavioural script against the local and in-memory backends
//! opened through `open_backend`.

use std::sync::Arc;

use bytes::Bytes;

use trackfs_core::{ListingConsistency, StorageBackend, TrackfsError};
use trackfs_storage::open_backend;

async fn exercise_contract(backend: Arc<dyn StorageBackend>) {
    backend.mkdir("root/tracker/").await.unwrap();
    assert!(backend.exists("root/tracker/").await.unwrap());

    backend
        .write("root/tracker/1.txt", Bytes::from("1"), false)
        .await
        .unwrap();
    backend
        .write_no_promise("root/tracker/15.txt", Bytes::from("15"))
        .await
        .unwrap();
    let dup = backend
        .write("root/tracker/1.txt", Bytes::from("again"), false)
        .await;
    assert!(matches!(dup, Err(TrackfsError::AlreadyExists { .. })));

    let names: Vec<String> = backend
        .list("root/tracker/", false)
        .await
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    assert_eq!(names, vec!["1.txt", "15.txt"]);

    backend
        .write("root/commit/1/rec", Bytes::from("r"), false)
        .await
        .unwrap();
    backend
        .write("root/commit/15/rec", Bytes::from("r"), false)
        .await
        .unwrap();
    backend.delete("root/commit/1/", true).await.unwrap();
    assert!(!backend.exists("root/commit/1/rec").await.unwrap());
    assert!(backend.exists("root/commit/15/rec").await.unwrap());

    backend.delete("root/tracker/1.txt", false).await.unwrap();
    backend.delete("root/tracker/1.txt", false).await.unwrap();
    assert!(matches!(
        backend.read("root/tracker/1.txt").await,
        Err(TrackfsError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_local_backend_contract() {
    let tmp = tempfile::TempDir::new().unwrap();
    let backend = open_backend(&format!("local://{}", tmp.path().display()))
        .await
        .unwrap();
    assert_eq!(backend.name(), "local");
    assert!(backend.capabilities().atomic_create);
    exercise_contract(backend).await;
}

#[tokio::test]
async fn test_memory_backend_contract() {
    let backend = open_backend("memory://").await.unwrap();
    assert_eq!(backend.name(), "memory");
    assert_eq!(
        backend.capabilities().listing,
        ListingConsistency::Immediate
    );
    exercise_contract(backend).await;
}

#[tokio::test]
async fn test_raw_path_opens_local() {
    let tmp = tempfile::TempDir::new().unwrap();
    let backend = open_backend(&tmp.path().to_string_lossy()).await.unwrap();
    assert_eq!(backend.name(), "local");
}
