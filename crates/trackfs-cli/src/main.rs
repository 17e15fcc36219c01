//! trackfs CLI: drive the commit protocols against a real or simulated
//! backend.
//!
//! - `trackfs commit`: one commit attempt
//! - `trackfs stress --writers N --attempts M`: concurrent writers, then audit
//! - `trackfs audit`: check the at-most-one-winner invariant
//! - `trackfs sweep [--reference V]`: run archival without committing

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trackfs_commit::{audit_list_min, audit_two_phase, strategy_for, Archiver, AuditReport, Protocol};
use trackfs_core::layout::parse_marker_version;
use trackfs_core::{CommitConfig, IdGenerator, IdStrategy, Layout, StorageBackend};
use trackfs_storage::open_backend;

#[derive(Debug, Parser)]
#[command(name = "trackfs")]
#[command(version, about = "Lock-free commit coordination over shared storage", long_about = None)]
struct Cli {
    /// Storage URI: a path, `local://<path>`, `s3://bucket/prefix` or `memory://`.
    #[arg(long, global = true, env = "TRACKFS_STORAGE", default_value = "memory://")]
    storage: String,

    /// Commit root inside the backend.
    #[arg(long, global = true, default_value = "")]
    root: String,

    /// Coordination protocol.
    #[arg(long, global = true, value_enum, default_value_t = ProtocolArg::ListMin)]
    protocol: ProtocolArg,

    /// Override the backend's listing-accuracy bound, in milliseconds.
    #[arg(long, global = true)]
    listing_accuracy_ms: Option<u64>,

    /// Record name generator.
    #[arg(long, global = true, value_enum, default_value_t = IdStrategyArg::Uuid)]
    ids: IdStrategyArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Attempt a single commit.
    Commit,
    /// Race concurrent writers against one root, then audit it.
    Stress {
        #[arg(long, default_value_t = 4)]
        writers: usize,
        /// Commit attempts per writer.
        #[arg(long, default_value_t = 10)]
        attempts: usize,
    },
    /// Check the committed history for invariant violations.
    Audit,
    /// Run the archival sweep.
    Sweep {
        /// Reference version; defaults to the newest tracker version.
        #[arg(long)]
        reference: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    ListMin,
    TwoPhase,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::ListMin => Protocol::ListMin,
            ProtocolArg::TwoPhase => Protocol::TwoPhase,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IdStrategyArg {
    Uuid,
    Snowflake,
}

impl From<IdStrategyArg> for IdStrategy {
    fn from(arg: IdStrategyArg) -> Self {
        match arg {
            IdStrategyArg::Uuid => IdStrategy::Uuid,
            IdStrategyArg::Snowflake => IdStrategy::Snowflake,
        }
    }
}

impl Cli {
    fn protocol(&self) -> Protocol {
        self.protocol.into()
    }

    /// The protocol's preset with flag overrides applied.
    fn commit_config(&self) -> CommitConfig {
        let mut config = match self.protocol() {
            Protocol::ListMin => CommitConfig::list_min(),
            Protocol::TwoPhase => CommitConfig::two_phase(),
        };
        if let Some(ms) = self.listing_accuracy_ms {
            config.listing_accuracy = Some(Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let storage = open_backend(&cli.storage)
        .await
        .with_context(|| format!("opening storage {}", cli.storage))?;
    let ids = Arc::new(IdGenerator::new(cli.ids.into()));

    match &cli.command {
        Commands::Commit => run_commit(&cli, storage, ids).await,
        Commands::Stress { writers, attempts } => {
            run_stress(&cli, storage, ids, *writers, *attempts).await
        }
        Commands::Audit => {
            let report = audit(&cli, storage.as_ref()).await?;
            print_report(&report);
            if !report.is_clean() {
                bail!("{} invariant violations", report.violations.len());
            }
            Ok(())
        }
        Commands::Sweep { reference } => run_sweep(&cli, storage.as_ref(), *reference).await,
    }
}

async fn run_commit(
    cli: &Cli,
    storage: Arc<dyn StorageBackend>,
    ids: Arc<IdGenerator>,
) -> Result<()> {
    let strategy = strategy_for(cli.protocol(), Some(cli.commit_config()), ids)?;
    let outcome = strategy
        .commit(storage.as_ref(), &cli.root)
        .await
        .with_context(|| format!("{} commit under '{}'", cli.protocol(), cli.root))?;

    match outcome.sub_version {
        Some(sub) => println!(
            "committed version {} (sub-version {sub}) as {}",
            outcome.version, outcome.record
        ),
        None => println!("committed version {} as {}", outcome.version, outcome.record),
    }
    if !outcome.sweep.archived.is_empty() || !outcome.sweep.purged.is_empty() {
        println!(
            "archived {:?}, purged {:?}",
            outcome.sweep.archived, outcome.sweep.purged
        );
    }
    for issue in &outcome.cleanup_issues {
        println!("cleanup issue in {}: {}", issue.stage, issue.message);
    }
    Ok(())
}

async fn run_stress(
    cli: &Cli,
    storage: Arc<dyn StorageBackend>,
    ids: Arc<IdGenerator>,
    writers: usize,
    attempts: usize,
) -> Result<()> {
    if writers == 0 {
        bail!("--writers must be at least 1");
    }
    let started = Instant::now();
    let mut handles = Vec::with_capacity(writers);
    for writer in 0..writers {
        let strategy = strategy_for(cli.protocol(), Some(cli.commit_config()), ids.clone())?;
        let storage = storage.clone();
        let root = cli.root.clone();
        handles.push(tokio::spawn(async move {
            let mut tally: BTreeMap<&'static str, usize> = BTreeMap::new();
            for _ in 0..attempts {
                let kind = match strategy.commit(storage.as_ref(), &root).await {
                    Ok(_) => "committed",
                    Err(e) => {
                        if e.must_not_clean_up() {
                            warn!(writer, error = %e, "Commit state unknown");
                        }
                        e.kind()
                    }
                };
                *tally.entry(kind).or_default() += 1;
            }
            tally
        }));
    }

    let mut totals: BTreeMap<&'static str, usize> = BTreeMap::new();
    for result in futures::future::join_all(handles).await {
        let tally = result.context("writer task panicked")?;
        for (kind, count) in tally {
            *totals.entry(kind).or_default() += count;
        }
    }
    info!(
        writers,
        attempts,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Stress run finished"
    );

    println!("{} writers x {} attempts ({})", writers, attempts, cli.protocol());
    for (kind, count) in &totals {
        println!("  {kind:<24} {count}");
    }

    let report = audit(cli, storage.as_ref()).await?;
    print_report(&report);
    if !report.is_clean() {
        bail!("{} invariant violations", report.violations.len());
    }
    Ok(())
}

async fn audit(cli: &Cli, storage: &dyn StorageBackend) -> Result<AuditReport> {
    let report = match cli.protocol() {
        Protocol::ListMin => audit_list_min(storage, &cli.root).await?,
        Protocol::TwoPhase => audit_two_phase(storage, &cli.root).await?,
    };
    Ok(report)
}

fn print_report(report: &AuditReport) {
    println!(
        "audit: {} versions checked, {} finalized, {} violations",
        report.checked,
        report.finalized,
        report.violations.len()
    );
    for violation in &report.violations {
        println!("  {violation}");
    }
}

async fn run_sweep(cli: &Cli, storage: &dyn StorageBackend, reference: Option<u64>) -> Result<()> {
    let layout = Layout::new(&cli.root);
    let reference = match reference {
        Some(v) => v,
        None => {
            let markers = storage.list(&layout.tracker_dir(), false).await?;
            match markers.iter().filter_map(|e| parse_marker_version(e.name())).max() {
                Some(v) => v,
                None => {
                    println!("nothing to sweep under '{}'", cli.root);
                    return Ok(());
                }
            }
        }
    };

    let archiver = Archiver::new(cli.commit_config().archive);
    let report = archiver.sweep(storage, &layout, reference).await?;
    println!(
        "reference {reference}: archived {:?}, purged {:?}",
        report.archived, report.purged
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stress_flags() {
        let cli = Cli::parse_from([
            "trackfs",
            "stress",
            "--writers",
            "8",
            "--attempts",
            "3",
            "--protocol",
            "two-phase",
        ]);
        assert!(matches!(
            cli.command,
            Commands::Stress {
                writers: 8,
                attempts: 3
            }
        ));
        assert_eq!(cli.protocol(), Protocol::TwoPhase);
        assert_eq!(
            cli.commit_config().archive.clean_ttl,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_listing_accuracy_override() {
        let cli = Cli::parse_from([
            "trackfs",
            "--listing-accuracy-ms",
            "250",
            "--root",
            "tables/orders",
            "commit",
        ]);
        assert_eq!(cli.root, "tables/orders");
        assert_eq!(
            cli.commit_config().listing_accuracy,
            Some(Duration::from_millis(250))
        );
        assert_eq!(cli.protocol(), Protocol::ListMin);
    }

    #[test]
    fn test_sweep_reference_is_optional() {
        let cli = Cli::parse_from(["trackfs", "sweep"]);
        assert!(matches!(cli.command, Commands::Sweep { reference: None }));
        let cli = Cli::parse_from(["trackfs", "sweep", "--reference", "12"]);
        assert!(matches!(cli.command, Commands::Sweep { reference: Some(12) }));
    }

    #[tokio::test]
    async fn test_stress_on_memory_backend_audits_clean() {
        let cli = Cli::parse_from(["trackfs", "stress", "--writers", "3", "--attempts", "4"]);
        let storage = open_backend("memory://").await.unwrap();
        let ids = Arc::new(IdGenerator::default());
        run_stress(&cli, storage.clone(), ids, 3, 4).await.unwrap();

        let report = audit(&cli, storage.as_ref()).await.unwrap();
        assert!(report.finalized >= 1);
    }
}
