//! Xorstor - parity generation and rebuild tools
//!
//! One process runs per storage target. `gen` scans the target's chunk tree
//! and refreshes parity for what changed; `rebuild` regenerates a failed
//! target's chunks and parity onto its replacement.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xorstor_common::config::Config;
use xorstor_parity::scanner::has_chunk_tree;
use xorstor_parity::{
    RunPaths, RunSummary, ScanMode, Scanner, StorageRoot, run_generate, run_rebuild,
};
use xorstor_transport::{ChannelFabric, TcpTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "xorstor")]
#[command(about = "Xorstor parity generation and rebuild")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = Config::DEFAULT_PATH)]
    config: PathBuf,

    /// Rank of this process, overriding `node.rank`
    #[arg(long)]
    rank: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate parity for changed chunks
    Gen {
        /// `complete` or `partial`
        mode: String,
        /// Storage root holding `chunks/` and `parity/`
        root: PathBuf,
        /// Time range `FROM:TO` for partial scans, `-` otherwise
        range: String,
        /// Run-state file
        run_state: PathBuf,
        /// Metadata store directory
        meta_dir: PathBuf,
    },
    /// Regenerate everything a failed target held
    Rebuild {
        /// Slot of the failed target
        failed_slot: usize,
        /// Storage root of this target
        root: PathBuf,
        /// Run-state file
        run_state: PathBuf,
        /// Metadata store directory
        meta_dir: PathBuf,
    },
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = i32::from(e.use_stderr());
            let _ = e.print();
            std::process::exit(code);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args) {
        Ok(summary) if summary.sticky_error.is_none() => {}
        Ok(_) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            error!("{}", failure_hint(&e));
            std::process::exit(1);
        }
    }
}

/// What the operator should do before rerunning after `e`.
fn failure_hint(e: &anyhow::Error) -> &'static str {
    match e.downcast_ref::<xorstor_common::Error>() {
        Some(err) if err.is_fatal() => {
            "Run aborted; fix the configuration or run state before rerunning"
        }
        Some(err) if err.is_disconnect() => {
            "Lost a peer; rerun once every target is reachable"
        }
        _ => "Run degraded; rerun to finish the remaining work",
    }
}

fn run(args: Args) -> Result<RunSummary> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(rank) = args.rank {
        config.node.rank = rank;
    }
    config.validate()?;
    info!("Config file: {}", args.config.display());

    let summary = match args.command {
        Command::Gen {
            mode,
            root,
            range,
            run_state,
            meta_dir,
        } => {
            let mode = ScanMode::parse(&mode, &range)?;
            if !has_chunk_tree(&root) {
                bail!("{} has no chunks directory", root.display());
            }
            let transport = connect(&config)?;
            let mut scanner = Scanner::spawn(&config.scanner, &mode, &StorageRoot::new(&root))?;
            let events = scanner.take_stdout()?;
            let paths = RunPaths {
                storage_root: root,
                run_state,
                meta_dir,
            };
            let result = run_generate(transport, &config, &paths, events);
            let scanned = scanner.finish();
            let summary = result?;
            scanned.context("scan incomplete; rerun to pick up the missed changes")?;
            summary
        }
        Command::Rebuild {
            failed_slot,
            root,
            run_state,
            meta_dir,
        } => {
            let transport = connect(&config)?;
            let paths = RunPaths {
                storage_root: root,
                run_state,
                meta_dir,
            };
            run_rebuild(transport, &config, &paths, failed_slot)?
        }
    };

    log_summary(&summary);
    Ok(summary)
}

/// Join the configured mesh, or run alone when no peers are configured.
fn connect(config: &Config) -> Result<Arc<dyn Transport>> {
    if config.cluster.peers.is_empty() {
        let transport = ChannelFabric::build(1)
            .pop()
            .context("building local transport")?;
        return Ok(Arc::new(transport));
    }
    let peers = config
        .cluster
        .peers
        .iter()
        .map(|peer| resolve(peer))
        .collect::<Result<Vec<_>>>()?;
    let transport = TcpTransport::connect(
        config.node.rank,
        &peers,
        Duration::from_secs(config.cluster.connect_timeout_secs),
    )?;
    Ok(Arc::new(transport))
}

fn resolve(peer: &str) -> Result<SocketAddr> {
    peer.to_socket_addrs()
        .with_context(|| format!("resolving peer {peer}"))?
        .next()
        .with_context(|| format!("peer {peer} has no address"))
}

fn log_summary(summary: &RunSummary) {
    info!(
        "Read {} events, resolved {} paths ({} unchanged, {} without parity)",
        summary.events, summary.paths, summary.skipped, summary.saturated
    );
    info!(
        "Ran {} tasks, {} on this target: {} bytes read, {} bytes written",
        summary.tasks.items,
        summary.tasks.involved,
        summary.tasks.bytes_read,
        summary.tasks.bytes_written
    );
    if summary.corrupt_files > 0 {
        warn!("{} files changed after their parity was generated", summary.corrupt_files);
    }
    if let Some(sticky) = &summary.sticky_error {
        error!(
            "I/O failed on '{}' ({:?}): {}; artifacts on this target are incomplete",
            sticky.path, sticky.kind, sticky.message
        );
    }
}
