//! The [`CommitStrategy`] trait and the steps both protocols share.
//!
//! Neither protocol takes an in-process lock. Every safety property is
//! mediated by storage, so two strategies in one process race exactly like
//! two processes would.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use trackfs_core::layout::{parse_marker_version, COMMIT_HINT};
use trackfs_core::{
    CleanupIssue, CommitConfig, CommitOutcome, Layout, RecordBody, Result, StorageBackend,
    StorageEntry, SweepReport, TrackfsError, WriterId,
};

use crate::archive::Archiver;

/// Which coordination protocol a strategy runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Earliest listed record in a version wins.
    ListMin,
    /// Nested sub-versions, fail fast on any concurrent attempt.
    TwoPhase,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListMin => write!(f, "list-min"),
            Self::TwoPhase => write!(f, "two-phase"),
        }
    }
}

/// One attempt to append a commit under a root location.
///
/// A call either fully succeeds or fully fails; there is no internal
/// retry. Retrying at a new version is the caller's job, guided by
/// [`TrackfsError::is_retryable`].
#[async_trait]
pub trait CommitStrategy: Send + Sync {
    /// The protocol this strategy implements.
    fn protocol(&self) -> Protocol;

    /// Attempt one commit under `root`.
    async fn commit(&self, storage: &dyn StorageBackend, root: &str) -> Result<CommitOutcome>;
}

/// Create the `tracker/`, `commit/` and `archive/` namespaces.
pub(crate) async fn ensure_namespaces(storage: &dyn StorageBackend, layout: &Layout) -> Result<()> {
    storage.mkdir(&layout.tracker_dir()).await?;
    storage.mkdir(&layout.commit_root()).await?;
    storage.mkdir(&layout.archive_dir()).await
}

/// Largest version among `<version>.txt` markers listed in `dir`.
pub(crate) async fn max_marker_version(
    storage: &dyn StorageBackend,
    dir: &str,
) -> Result<Option<u64>> {
    let entries = storage.list(dir, false).await?;
    Ok(entries
        .iter()
        .filter_map(|e| {
            let version = parse_marker_version(e.name());
            if version.is_none() {
                debug!(name = e.name(), dir, "Ignoring foreign marker");
            }
            version
        })
        .max())
}

/// Write a marker unless it is already present. No atomicity needed: the
/// marker set only has to over-claim, never under-claim.
pub(crate) async fn ensure_marker(
    storage: &dyn StorageBackend,
    key: &str,
    content: String,
) -> Result<()> {
    if !storage.exists(key).await? {
        storage.write_no_promise(key, Bytes::from(content)).await?;
    }
    Ok(())
}

/// The tie-break winner: earliest modification time, then smallest name.
/// The hint object itself never competes.
pub fn earliest_record(entries: &[StorageEntry]) -> Option<&StorageEntry> {
    entries
        .iter()
        .filter(|e| e.name() != COMMIT_HINT)
        .min_by(|a, b| {
            a.last_modified()
                .cmp(&b.last_modified())
                .then_with(|| a.name().cmp(b.name()))
        })
}

/// Resolve the sleep used to let listings catch up.
pub(crate) fn listing_accuracy(config: &CommitConfig, storage: &dyn StorageBackend) -> Duration {
    config
        .listing_accuracy
        .unwrap_or_else(|| storage.listing_accuracy())
}

/// JSON body of a freshly written commit record.
pub(crate) fn record_body(
    version: u64,
    sub_version: Option<u64>,
    record: &str,
    writer: &WriterId,
) -> Result<Bytes> {
    let body = RecordBody {
        version,
        sub_version,
        record: record.to_string(),
        writer: writer.clone(),
        created_at: Utc::now(),
    };
    serde_json::to_vec(&body)
        .map(Bytes::from)
        .map_err(|e| TrackfsError::Serialization(e.to_string()))
}

/// Create the finalizing hint with `content`, create-only.
///
/// - `AlreadyExists` is benign when the present hint holds the same
///   content; a different content means another record won.
/// - Any other fault is resolved by an existence check. If that cannot
///   confirm the hint, the outcome is [`TrackfsError::CommitStateUnknown`].
pub(crate) async fn publish_hint(
    storage: &dyn StorageBackend,
    key: &str,
    version: u64,
    content: &str,
) -> Result<()> {
    let fault = match storage.write(key, Bytes::from(content.to_string()), false).await {
        Ok(()) => return Ok(()),
        Err(TrackfsError::AlreadyExists { .. }) => {
            return match storage.read(key).await {
                Ok(existing) if existing.as_ref() == content.as_bytes() => {
                    debug!(key, "Hint already written with the same winner");
                    Ok(())
                }
                Ok(existing) => Err(TrackfsError::conflict(
                    version,
                    format!(
                        "hint already names {}",
                        String::from_utf8_lossy(&existing)
                    ),
                )),
                Err(e) => Err(TrackfsError::CommitStateUnknown {
                    key: key.to_string(),
                    source: Box::new(e),
                }),
            };
        }
        Err(e) => e,
    };

    match storage.exists(key).await {
        Ok(true) => {
            warn!(key, error = %fault, "Hint write reported a fault but the hint is present");
            Ok(())
        }
        Ok(false) => Err(TrackfsError::CommitStateUnknown {
            key: key.to_string(),
            source: Box::new(fault),
        }),
        Err(check) => {
            warn!(key, error = %check, "Could not confirm hint after a faulted write");
            Err(TrackfsError::CommitStateUnknown {
                key: key.to_string(),
                source: Box::new(fault),
            })
        }
    }
}

/// Run the archival sweep and fold any failure into `issues`.
pub(crate) async fn sweep_logged(
    archiver: &Archiver,
    storage: &dyn StorageBackend,
    layout: &Layout,
    reference_version: u64,
    issues: &mut Vec<CleanupIssue>,
) -> SweepReport {
    match archiver.sweep(storage, layout, reference_version).await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, reference_version, "Archival sweep failed; will retry on a later commit");
            issues.push(CleanupIssue::new("sweep", &e));
            SweepReport::default()
        }
    }
}

/// After a conflict-type failure, still run garbage collection so that
/// sustained contention cannot starve it. Returns the original error.
pub(crate) async fn sweep_after_failure(
    config: &CommitConfig,
    archiver: &Archiver,
    storage: &dyn StorageBackend,
    layout: &Layout,
    error: TrackfsError,
) -> TrackfsError {
    let version = match &error {
        TrackfsError::CommitConflict { version, .. } | TrackfsError::CommitTooOld { version } => {
            *version
        }
        _ => return error,
    };
    if config.sweep_after_conflict {
        let mut issues = Vec::new();
        let report = sweep_logged(archiver, storage, layout, version, &mut issues).await;
        debug!(
            version,
            archived = report.archived.len(),
            purged = report.purged.len(),
            "Swept after failed attempt"
        );
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(name: &str, millis: i64) -> StorageEntry {
        let ts = Utc.timestamp_millis_opt(millis).unwrap();
        StorageEntry::new(name, ts, format!("memory://commit/0/{name}"))
    }

    #[test]
    fn test_earliest_record_prefers_time_then_name() {
        let entries = vec![entry("b", 10), entry("a", 20), entry("c", 10)];
        assert_eq!(earliest_record(&entries).unwrap().name(), "b");
    }

    #[test]
    fn test_earliest_record_ignores_hint() {
        let entries = vec![entry(COMMIT_HINT, 1), entry("z", 50)];
        assert_eq!(earliest_record(&entries).unwrap().name(), "z");
        assert!(earliest_record(&[entry(COMMIT_HINT, 1)]).is_none());
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::ListMin.to_string(), "list-min");
        assert_eq!(Protocol::TwoPhase.to_string(), "two-phase");
    }
}
