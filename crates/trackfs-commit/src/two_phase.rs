//! Protocol B: two-phase commit over nested sub-versions.
//!
//! A version is finalized by `sub-hint/COMMIT-HINT.TXT`. Below it, every
//! attempt gets a sub-version directory `commit/<v>/<sub>/` and must be
//! the only writer there: it writes `PRE_COMMIT-<id>.txt`, checks it is
//! alone, writes `<id>.txt`, checks again, then publishes the sub-hint.
//! Any sign of a second writer fails the attempt.
//!
//! A sub-version whose writers all gave up carries `EXPIRED-HINT.TXT`,
//! which moves later writers on to the next sub-version. A lone writer
//! that finished both phases but died before the sub-hint is completed on
//! its behalf once its records are older than `pre_commit_ttl`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use trackfs_core::layout::{canonical_record_name, EXPIRED_HINT, PRE_COMMIT_PREFIX};
use trackfs_core::{
    CleanupIssue, CommitConfig, CommitOutcome, IdGenerator, Layout, Result, StorageBackend,
    StorageEntry, TrackfsError, WriterId,
};

use crate::archive::Archiver;
use crate::strategy::{
    ensure_marker, ensure_namespaces, max_marker_version, publish_hint, record_body,
    sweep_after_failure, sweep_logged, CommitStrategy, Protocol,
};

const EXPIRED_CONTENT: &str = "EXPIRED!";

/// Content of a sub-hint: `<record>@<sub>`.
pub fn sub_hint_content(record: &str, sub: u64) -> String {
    format!("{record}@{sub}")
}

/// Split sub-hint content back into `(record, sub)`.
pub fn parse_sub_hint(content: &str) -> Option<(&str, u64)> {
    let (record, sub) = content.rsplit_once('@')?;
    Some((record, sub.parse().ok()?))
}

/// Protocol B commit strategy.
pub struct TwoPhaseCommit {
    config: CommitConfig,
    ids: Arc<IdGenerator>,
    writer: WriterId,
    archiver: Archiver,
}

impl TwoPhaseCommit {
    /// A strategy with [`CommitConfig::two_phase`] defaults.
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        let config = CommitConfig::two_phase();
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

    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    async fn attempt(&self, storage: &dyn StorageBackend, layout: &Layout) -> Result<CommitOutcome> {
        ensure_namespaces(storage, layout).await?;

        let mut version = max_marker_version(storage, &layout.tracker_dir())
            .await?
            .unwrap_or(0);
        if storage.exists(&layout.sub_hint(version)).await? {
            version += 1;
        }
        ensure_marker(storage, &layout.tracker_marker(version), version.to_string()).await?;
        storage.mkdir(&layout.version_dir(version)).await?;
        storage.mkdir(&layout.sub_tracker_dir(version)).await?;
        storage.mkdir(&layout.sub_hint_dir(version)).await?;

        let mut sub = max_marker_version(storage, &layout.sub_tracker_dir(version))
            .await?
            .unwrap_or(0);
        if storage.exists(&layout.expired_hint(version, sub)).await? {
            sub += 1;
        }
        ensure_marker(
            storage,
            &layout.sub_tracker_marker(version, sub),
            sub.to_string(),
        )
        .await?;

        let detail_dir = layout.detail_dir(version, sub);
        storage.mkdir(&detail_dir).await?;

        let existing = storage.list(&detail_dir, false).await?;
        if !existing.is_empty() {
            self.triage(storage, layout, version, sub, &existing).await;
            return Err(TrackfsError::conflict(
                version,
                format!("sub-version {sub} already holds {} objects", existing.len()),
            ));
        }

        let record = format!("{}.txt", self.ids.next_id());
        let pre_commit = format!("{PRE_COMMIT_PREFIX}{record}");
        let body = record_body(version, Some(sub), &record, &self.writer)?;

        // Phase one. Create-only: a record name collision must fail here.
        if let Err(e) = storage
            .write(&layout.detail_record(version, sub, &pre_commit), body.clone(), false)
            .await
        {
            if matches!(e, TrackfsError::AlreadyExists { .. }) {
                warn!(version, sub, record = %record, "Record name collision");
            }
            return Err(e);
        }
        self.ensure_alone(storage, &detail_dir, version, sub, &[pre_commit.as_str()])
            .await?;

        // Phase two.
        storage
            .write_no_promise(&layout.detail_record(version, sub, &record), body)
            .await?;
        let own = [pre_commit.as_str(), record.as_str()];
        self.ensure_alone(storage, &detail_dir, version, sub, &own)
            .await?;

        publish_hint(
            storage,
            &layout.sub_hint(version),
            version,
            &sub_hint_content(&record, sub),
        )
        .await?;

        let mut outcome = CommitOutcome {
            version,
            sub_version: Some(sub),
            record,
            sweep: Default::default(),
            cleanup_issues: Vec::new(),
        };
        if let Err(e) = storage
            .write_no_promise(
                &layout.debug_marker(version, &outcome.record),
                Bytes::from(outcome.record.clone()),
            )
            .await
        {
            warn!(version, error = %e, "Failed to write debug marker");
            outcome.cleanup_issues.push(CleanupIssue::new("debug-marker", &e));
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

    /// Fail unless the sub-version directory holds only `own` objects.
    async fn ensure_alone(
        &self,
        storage: &dyn StorageBackend,
        detail_dir: &str,
        version: u64,
        sub: u64,
        own: &[&str],
    ) -> Result<()> {
        let entries = storage.list(detail_dir, false).await?;
        let others: Vec<&str> = entries
            .iter()
            .map(StorageEntry::name)
            .filter(|name| !own.contains(name))
            .collect();
        if others.is_empty() {
            return Ok(());
        }
        debug!(version, sub, others = ?others, "Concurrent writer in sub-version");
        Err(TrackfsError::conflict(
            version,
            format!("sub-version {sub} contended by {}", others.join(", ")),
        ))
    }

    /// Decide what a contested sub-version needs before this writer backs
    /// off: expiry when every competitor is stuck, or repair when a lone
    /// finished writer never published its sub-hint. Best effort.
    async fn triage(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        version: u64,
        sub: u64,
        entries: &[StorageEntry],
    ) {
        let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.name() != EXPIRED_HINT) {
            *groups.entry(canonical_record_name(entry.name())).or_default() += 1;
        }

        // Several writers, none past phase one: nobody can ever finish.
        if groups.len() > 1 && groups.values().all(|count| *count == 1) {
            self.expire(storage, layout, version, sub).await;
            return;
        }

        let Some(latest) = entries.iter().map(StorageEntry::last_modified).max() else {
            return;
        };
        let age = Utc::now()
            .signed_duration_since(latest)
            .to_std()
            .unwrap_or_default();
        if age <= self.config.pre_commit_ttl {
            return;
        }
        match storage.exists(&layout.sub_hint(version)).await {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!(version, sub, error = %e, "Could not check sub-hint during triage");
                return;
            }
        }

        match groups.iter().next() {
            Some((record, 2)) if groups.len() == 1 => {
                self.complete_abandoned(storage, layout, version, sub, record)
                    .await
            }
            _ => self.expire(storage, layout, version, sub).await,
        }
    }

    async fn expire(&self, storage: &dyn StorageBackend, layout: &Layout, version: u64, sub: u64) {
        match storage
            .write_no_promise(
                &layout.expired_hint(version, sub),
                Bytes::from_static(EXPIRED_CONTENT.as_bytes()),
            )
            .await
        {
            Ok(()) => info!(version, sub, "Expired stuck sub-version"),
            Err(e) => warn!(version, sub, error = %e, "Failed to expire sub-version"),
        }
    }

    /// Publish the sub-hint for a writer that finished both phases.
    async fn complete_abandoned(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        version: u64,
        sub: u64,
        record: &str,
    ) {
        let content = sub_hint_content(record, sub);
        match storage
            .write(&layout.sub_hint(version), Bytes::from(content), false)
            .await
        {
            Ok(()) => info!(version, sub, record, "Completed abandoned commit"),
            Err(TrackfsError::AlreadyExists { .. }) => return,
            Err(e) => {
                warn!(version, sub, error = %e, "Failed to complete abandoned commit");
                return;
            }
        }
        if let Err(e) = storage
            .write_no_promise(
                &layout.debug_marker(version, record),
                Bytes::from(record.to_string()),
            )
            .await
        {
            warn!(version, error = %e, "Failed to write debug marker for repaired commit");
        }
    }
}

#[async_trait]
impl CommitStrategy for TwoPhaseCommit {
    fn protocol(&self) -> Protocol {
        Protocol::TwoPhase
    }

    #[instrument(skip(self, storage), fields(backend = storage.name(), writer = %self.writer))]
    async fn commit(&self, storage: &dyn StorageBackend, root: &str) -> Result<CommitOutcome> {
        let layout = Layout::new(root);
        match self.attempt(storage, &layout).await {
            Ok(outcome) => {
                info!(
                    version = outcome.version,
                    sub_version = outcome.sub_version,
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
