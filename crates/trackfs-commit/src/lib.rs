//! Commit coordination over a shared storage backend.
//!
//! Multiple independent writers append numbered commits under one root
//! without any lock service. Two interchangeable protocols implement
//! [`CommitStrategy`]:
//!
//! - [`ListMinCommit`]: earliest listed record wins a version
//! - [`TwoPhaseCommit`]: nested sub-versions with pre-commit records
//!
//! Old versions are garbage-collected by the [`Archiver`] after every
//! commit, and [`audit`] offers read-only invariant checks.

pub mod archive;
pub mod audit;
pub mod list_min;
pub mod strategy;
pub mod two_phase;

use std::sync::Arc;

use trackfs_core::{CommitConfig, IdGenerator, Result};

pub use archive::Archiver;
pub use audit::{audit_list_min, audit_two_phase, AuditReport};
pub use list_min::ListMinCommit;
pub use strategy::{earliest_record, CommitStrategy, Protocol};
pub use two_phase::TwoPhaseCommit;

/// Build a boxed strategy for `protocol`.
///
/// `config` defaults to the protocol's own preset when `None`.
pub fn strategy_for(
    protocol: Protocol,
    config: Option<CommitConfig>,
    ids: Arc<IdGenerator>,
) -> Result<Arc<dyn CommitStrategy>> {
    let strategy: Arc<dyn CommitStrategy> = match protocol {
        Protocol::ListMin => Arc::new(ListMinCommit::with_config(
            config.unwrap_or_else(CommitConfig::list_min),
            ids,
        )?),
        Protocol::TwoPhase => Arc::new(TwoPhaseCommit::with_config(
            config.unwrap_or_else(CommitConfig::two_phase),
            ids,
        )?),
    };
    Ok(strategy)
}
