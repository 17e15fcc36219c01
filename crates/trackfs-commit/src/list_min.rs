//! Protocol A: the earliest listed record in a version wins.
//!
//! Every writer drops a uniquely named record into `commit/<version>/`,
//! waits out the listing lag, lists the directory and compares its own
//! record against the earliest one (modification time, then name). Only
//! the winner writes `COMMIT-HINT.TXT`, and a version with a hint is
//! finalized forever.
//!
//! The listing sleep is a heuristic. If the backend's listing lag exceeds
//! the configured accuracy, a writer may list the version without seeing
//! its own record. It then confirms the record with an existence check and
//! backs off with a retryable [`TrackfsError::CommitConflict`]. Two writers
//! that each see only their own record both go on to the hint, and the
//! create-only hint write decides which of them commits.
//!
//! The post-commit dirty check re-resolves the target version the same way
//! a new attempt would: the tracker maximum, plus one once that version is
//! finalized. A commit is dirty when the next version to be attempted has
//! moved more than `max_save_num` past it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use trackfs_core::layout::COMMIT_HINT;
use trackfs_core::{
    CleanupIssue, CommitConfig, CommitOutcome, IdGenerator, Layout, Result, StorageBackend,
    StorageEntry, TrackfsError, WriterId,
};

use crate::archive::Archiver;
use crate::strategy::{
    earliest_record, ensure_marker, ensure_namespaces, listing_accuracy, max_marker_version,
    publish_hint, record_body, sweep_after_failure, sweep_logged, CommitStrategy, Protocol,
};

/// The version a writer should target, plus whatever already lives there.
struct Candidate {
    version: u64,
    records: Vec<StorageEntry>,
}

/// Protocol A commit strategy.
pub struct ListMinCommit {
    config: CommitConfig,
    ids: Arc<IdGenerator>,
    writer: WriterId,
    archiver: Archiver,
}

impl ListMinCommit {
    /// A strategy with [`CommitConfig::list_min`] defaults.
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        let config = CommitConfig::list_min();
        Self {
            archiver: Archiver::new(config.archive.clone()),
            config,
            ids,
            writer: WriterId::generate(),
        }
    }

    /// A strategy with explicit configuration.
    pub fn with_config(config: CommitConfig, ids: Arc<IdGenerator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            archiver: Archiver::new(config.archive.clone()),
            config,
            ids,
            writer: WriterId::generate(),
        })
    }

    /// Identity stamped into every record this strategy writes.
    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    /// Resolve the version to attempt.
    ///
    /// The maximum tracker version is the candidate unless its directory is
    /// already finalized, in which case the next version is.
    async fn resolve(&self, storage: &dyn StorageBackend, layout: &Layout) -> Result<Candidate> {
        let max = max_marker_version(storage, &layout.tracker_dir())
            .await?
            .unwrap_or(0);
        let records = storage.list(&layout.version_dir(max), false).await?;
        if records.iter().any(|e| e.name() == COMMIT_HINT) {
            return Ok(Candidate {
                version: max + 1,
                records: Vec::new(),
            });
        }
        Ok(Candidate {
            version: max,
            records,
        })
    }

    /// Someone is already competing for `version`. Finish their hint if it
    /// is still missing so the version cannot stay stuck, then give up.
    async fn repair_and_retire(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        version: u64,
    ) -> TrackfsError {
        tokio::time::sleep(listing_accuracy(&self.config, storage)).await;

        let hint = layout.commit_hint(version);
        match storage.list(&layout.version_dir(version), false).await {
            Ok(entries) if !entries.iter().any(|e| e.name() == COMMIT_HINT) => {
                let Some(winner) = earliest_record(&entries) else {
                    debug!(version, "Contested version lists no records");
                    return TrackfsError::CommitTooOld { version };
                };
                let winner = winner.name().to_string();
                match storage
                    .write(&hint, Bytes::from(winner.clone()), false)
                    .await
                {
                    Ok(()) => info!(version, record = %winner, "Repaired missing commit hint"),
                    Err(TrackfsError::AlreadyExists { .. }) => {}
                    Err(e) => warn!(version, error = %e, "Hint repair failed"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(version, error = %e, "Could not list version during repair"),
        }
        TrackfsError::CommitTooOld { version }
    }

    async fn attempt(&self, storage: &dyn StorageBackend, layout: &Layout) -> Result<CommitOutcome> {
        ensure_namespaces(storage, layout).await?;

        let candidate = self.resolve(storage, layout).await?;
        let version = candidate.version;
        if !candidate.records.is_empty() {
            debug!(
                version,
                records = candidate.records.len(),
                "Version already contested"
            );
            return Err(self.repair_and_retire(storage, layout, version).await);
        }

        // Claim the version in the tracker before writing the record.
        ensure_marker(storage, &layout.tracker_marker(version), version.to_string()).await?;
        let version_dir = layout.version_dir(version);
        storage.mkdir(&version_dir).await?;

        let record = self.ids.next_id();
        let body = record_body(version, None, &record, &self.writer)?;
        storage
            .write(&layout.record(version, &record), body, false)
            .await?;
        debug!(version, record = %record, "Wrote commit record");

        tokio::time::sleep(listing_accuracy(&self.config, storage)).await;

        let entries = storage.list(&version_dir, false).await?;
        if !entries.iter().any(|e| e.name() == record) {
            return Err(self
                .unlisted_record(storage, layout, version, &record, &entries)
                .await);
        }
        if let Some(winner) = earliest_record(&entries).filter(|w| w.name() != record) {
            return Err(TrackfsError::conflict(
                version,
                format!("record {} precedes {record}", winner.name()),
            ));
        }

        publish_hint(storage, &layout.commit_hint(version), version, &record).await?;

        let mut outcome = CommitOutcome {
            version,
            sub_version: None,
            record,
            sweep: Default::default(),
            cleanup_issues: Vec::new(),
        };

        match self.resolve(storage, layout).await {
            Ok(next) => {
                if next.version.saturating_sub(version) > self.config.archive.max_save_num {
                    return Err(self.retract_dirty(storage, layout, version, next.version).await);
                }
            }
            Err(e) => {
                warn!(version, error = %e, "Dirty check skipped");
                outcome.cleanup_issues.push(CleanupIssue::new("dirty-check", &e));
            }
        }

        outcome.sweep = sweep_logged(
            &self.archiver,
            storage,
            layout,
            version,
            &mut outcome.cleanup_issues,
        )
        .await;
        Ok(outcome)
    }

    /// The listing after the sleep did not show this writer's own record.
    ///
    /// A record that still exists was hidden by listing lag: back off and
    /// let a later attempt retry. A record that is gone means the version
    /// directory was removed underneath us.
    async fn unlisted_record(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        version: u64,
        record: &str,
        entries: &[StorageEntry],
    ) -> TrackfsError {
        match storage.exists(&layout.record(version, record)).await {
            Ok(true) => {
                debug!(
                    version,
                    record,
                    listed = entries.len(),
                    "Own record not listed yet"
                );
                TrackfsError::conflict(
                    version,
                    format!("record {record} not yet visible in listing"),
                )
            }
            Ok(false) => TrackfsError::StructuralCorruption {
                path: layout.version_dir(version),
            },
            Err(e) => e,
        }
    }

    /// The tracker moved so far ahead that this version may already be
    /// archived. Remove what this commit left behind and report it.
    async fn retract_dirty(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        version: u64,
        max_version: u64,
    ) -> TrackfsError {
        warn!(version, max_version, "Commit landed outside the retained window");
        if let Err(e) = storage.delete(&layout.version_dir(version), true).await {
            warn!(version, error = %e, "Failed to delete dirty version directory");
        }
        if let Err(e) = storage.delete(&layout.tracker_marker(version), false).await {
            warn!(version, error = %e, "Failed to delete dirty tracker marker");
        }
        TrackfsError::DirtyCommit {
            version,
            max_version,
        }
    }
}

#[async_trait]
impl CommitStrategy for ListMinCommit {
    fn protocol(&self) -> Protocol {
        Protocol::ListMin
    }

    #[instrument(skip(self, storage), fields(backend = storage.name(), writer = %self.writer))]
    async fn commit(&self, storage: &dyn StorageBackend, root: &str) -> Result<CommitOutcome> {
        let layout = Layout::new(root);
        match self.attempt(storage, &layout).await {
            Ok(outcome) => {
                info!(
                    version = outcome.version,
                    record = %outcome.record,
                    "Commit succeeded"
                );
                Ok(outcome)
            }
            Err(e) => {
                debug!(kind = e.kind(), error = %e, "Commit attempt failed");
                Err(sweep_after_failure(&self.config, &self.archiver, storage, &layout, e).await)
            }
        }
    }
}
