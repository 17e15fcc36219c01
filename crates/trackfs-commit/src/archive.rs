//! Two-stage garbage collection of old versions.
//!
//! Stage one moves tracker markers that fell out of the retained window
//! into `archive/` as `<version>.txt@<expiryMillis>` tickets. Stage two
//! physically deletes a version's commit subtree only once its ticket has
//! expired, so a slow writer still working on an old version is given
//! `clean_ttl` to notice before its directory disappears.

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument};

use trackfs_core::layout::{parse_marker_version, ArchiveMarker};
use trackfs_core::{ArchiveConfig, Layout, Result, StorageBackend, SweepReport};

/// Archival sweeper parameterized by an [`ArchiveConfig`].
#[derive(Debug, Clone)]
pub struct Archiver {
    config: ArchiveConfig,
}

impl Archiver {
    pub fn new(config: ArchiveConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Run both stages against `reference_version`.
    ///
    /// A failure aborts the sweep; everything done before it stays done and
    /// the next sweep picks up the rest.
    #[instrument(skip(self, storage, layout), fields(root = layout.root()))]
    pub async fn sweep(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        reference_version: u64,
    ) -> Result<SweepReport> {
        let archived = self
            .archive_stale_trackers(storage, layout, reference_version)
            .await?;
        let purged = self.purge_expired(storage, layout).await?;
        if !archived.is_empty() || !purged.is_empty() {
            info!(
                reference_version,
                archived = archived.len(),
                purged = purged.len(),
                "Archival sweep complete"
            );
        }
        Ok(SweepReport { archived, purged })
    }

    /// Stage one: ticket and drop every tracker marker more than
    /// `max_save_num` versions behind `reference_version`.
    pub async fn archive_stale_trackers(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
        reference_version: u64,
    ) -> Result<Vec<u64>> {
        let tracker_dir = layout.tracker_dir();
        let entries = storage.list(&tracker_dir, false).await?;
        let ttl_millis = i64::try_from(self.config.clean_ttl.as_millis()).unwrap_or(i64::MAX);

        let mut archived = Vec::new();
        for entry in &entries {
            let Some(version) = parse_marker_version(entry.name()) else {
                continue;
            };
            if reference_version.saturating_sub(version) <= self.config.max_save_num {
                continue;
            }

            // The ticket must exist before the tracker marker goes away, or
            // the version would leak out of both namespaces.
            let expires_at = Utc::now().timestamp_millis().saturating_add(ttl_millis);
            let ticket = ArchiveMarker::new(version, expires_at);
            let ticket_key = layout.archive_entry(&ticket.file_name());
            if !storage.exists(&ticket_key).await? {
                storage
                    .write_no_promise(&ticket_key, Bytes::from(expires_at.to_string()))
                    .await?;
            }
            storage
                .delete(&format!("{tracker_dir}{}", entry.name()), false)
                .await?;
            debug!(version, expires_at, "Archived tracker marker");
            archived.push(version);
        }
        Ok(archived)
    }

    /// Stage two: delete the commit subtree of expired tickets, oldest
    /// version first. One ticket per sweep normally; a backlog larger than
    /// `max_archive_size` lifts that to `batch_clean_max`.
    pub async fn purge_expired(
        &self,
        storage: &dyn StorageBackend,
        layout: &Layout,
    ) -> Result<Vec<u64>> {
        let entries = storage.list(&layout.archive_dir(), false).await?;
        let mut tickets: Vec<(ArchiveMarker, &str)> = entries
            .iter()
            .filter_map(|e| ArchiveMarker::parse(e.name()).map(|m| (m, e.name())))
            .collect();
        tickets.sort_by_key(|(marker, _)| marker.version);

        let batch = if tickets.len() > self.config.max_archive_size {
            self.config.batch_clean_max
        } else {
            1
        };

        let now = Utc::now().timestamp_millis();
        let mut purged = Vec::new();
        for (marker, name) in tickets.into_iter().take(batch) {
            if !marker.is_expired(now) {
                debug!(
                    version = marker.version,
                    remaining_ms = marker.expires_at_millis - now,
                    "Archived version not yet expired"
                );
                continue;
            }
            storage
                .delete(&layout.version_dir(marker.version), true)
                .await?;
            storage.delete(&layout.archive_entry(name), false).await?;
            debug!(version = marker.version, "Purged archived version");
            purged.push(marker.version);
        }
        Ok(purged)
    }
}
