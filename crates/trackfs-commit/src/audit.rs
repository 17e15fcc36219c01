//! Offline consistency checks over a commit root.
//!
//! An audit walks every version still known to `tracker/` or `archive/`
//! and checks the protocol's at-most-one-winner invariant from what is
//! left in storage. It writes nothing.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use trackfs_core::layout::{parse_marker_version, ArchiveMarker, COMMIT_HINT};
use trackfs_core::{Layout, Result, StorageBackend};

use crate::strategy::earliest_record;
use crate::two_phase::parse_sub_hint;

/// Result of an audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Versions that still had data to inspect.
    pub checked: usize,
    /// Versions carrying a finalizing hint.
    pub finalized: usize,
    /// Human-readable invariant violations.
    pub violations: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Smallest and largest version named by tracker or archive markers.
async fn version_range(storage: &dyn StorageBackend, layout: &Layout) -> Result<Option<(u64, u64)>> {
    let trackers = storage.list(&layout.tracker_dir(), false).await?;
    let archived = storage.list(&layout.archive_dir(), false).await?;
    let versions = trackers
        .iter()
        .filter_map(|e| parse_marker_version(e.name()))
        .chain(
            archived
                .iter()
                .filter_map(|e| ArchiveMarker::parse(e.name()).map(|m| m.version)),
        );
    Ok(versions.fold(None, |range, v| match range {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    }))
}

/// Check a Protocol A root: every hint names the earliest record of its
/// version, and only the newest version may lack a hint.
pub async fn audit_list_min(storage: &dyn StorageBackend, root: &str) -> Result<AuditReport> {
    let layout = Layout::new(root);
    let mut report = AuditReport::default();
    let Some((first, last)) = version_range(storage, &layout).await? else {
        return Ok(report);
    };

    for version in first..=last {
        let entries = storage.list(&layout.version_dir(version), false).await?;
        if entries.is_empty() {
            continue;
        }
        report.checked += 1;

        if !entries.iter().any(|e| e.name() == COMMIT_HINT) {
            if version < last {
                report.violations.push(format!(
                    "version {version}: {} records but no commit hint",
                    entries.len()
                ));
            }
            continue;
        }
        report.finalized += 1;

        let named = storage.read(&layout.commit_hint(version)).await?;
        let named = String::from_utf8_lossy(&named);
        match earliest_record(&entries) {
            Some(winner) if winner.name() == named => {}
            Some(winner) => report.violations.push(format!(
                "version {version}: hint names {named} but earliest record is {}",
                winner.name()
            )),
            None => report
                .violations
                .push(format!("version {version}: hint without any record")),
        }
    }

    log_report("list-min", root, &report);
    Ok(report)
}

/// Check a Protocol B root: at most one debug marker per version, and the
/// sub-hint names a record that exists in the sub-version it claims.
pub async fn audit_two_phase(storage: &dyn StorageBackend, root: &str) -> Result<AuditReport> {
    let layout = Layout::new(root);
    let mut report = AuditReport::default();
    let Some((first, last)) = version_range(storage, &layout).await? else {
        return Ok(report);
    };

    for version in first..=last {
        let sub_trackers = storage.list(&layout.sub_tracker_dir(version), false).await?;
        let hint_dir = storage.list(&layout.sub_hint_dir(version), false).await?;
        if sub_trackers.is_empty() && hint_dir.is_empty() {
            continue;
        }
        report.checked += 1;

        let markers: Vec<&str> = hint_dir
            .iter()
            .map(|e| e.name())
            .filter(|name| *name != COMMIT_HINT)
            .collect();
        if markers.len() > 1 {
            report.violations.push(format!(
                "version {version}: {} debug markers ({})",
                markers.len(),
                markers.join(", ")
            ));
        }

        if !hint_dir.iter().any(|e| e.name() == COMMIT_HINT) {
            if !markers.is_empty() {
                report
                    .violations
                    .push(format!("version {version}: debug marker without sub-hint"));
            }
            continue;
        }
        report.finalized += 1;

        let content = storage.read(&layout.sub_hint(version)).await?;
        let content = String::from_utf8_lossy(&content);
        let Some((record, sub)) = parse_sub_hint(&content) else {
            report
                .violations
                .push(format!("version {version}: malformed sub-hint {content:?}"));
            continue;
        };
        if !storage
            .exists(&layout.detail_record(version, sub, record))
            .await?
        {
            report.violations.push(format!(
                "version {version}: sub-hint names missing record {record} in sub-version {sub}"
            ));
        }
        if markers.len() == 1 && markers[0] != record {
            report.violations.push(format!(
                "version {version}: sub-hint names {record} but debug marker is {}",
                markers[0]
            ));
        }
    }

    log_report("two-phase", root, &report);
    Ok(report)
}

fn log_report(protocol: &str, root: &str, report: &AuditReport) {
    if report.is_clean() {
        info!(
            protocol,
            root,
            checked = report.checked,
            finalized = report.finalized,
            "Audit clean"
        );
    } else {
        warn!(
            protocol,
            root,
            checked = report.checked,
            violations = report.violations.len(),
            "Audit found violations"
        );
    }
}
