//! # Orbit Satellite CLI Module
//!
//! Configuration loading, identity bootstrap and the long-running
//! coordination loops: audit, checker, repair, settlement archival,
//! containment age-out and the object reconciliation sweep.
//!
//! ## Commands
//!
//! - `run`     : start the satellite loops until interrupted
//! - `diag`    : print pointer/queue/containment counts as JSON
//! - `version` : show version string

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use orbit_common::config::{load_from_file, SatelliteConfig};
use orbit_common::identity::Identity;
use orbit_common::time::now_ms;
use orbit_satellite::{RemoteTransport, Satellite};

const APP_NAME: &str = "orbit-satellite";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Orbit satellite.
///
/// Coordinates placement, mints order limits, audits storage nodes and
/// repairs under-replicated segments.
#[derive(Parser)]
#[command(name = "orbit-satellite", version, about = "Orbit satellite")]
pub struct Cli {
    /// Directory holding satellite.toml and the identity key
    #[arg(long, env = "ORBIT_CONFIG_DIR", default_value = "./config")]
    pub config_dir: PathBuf,

    /// Log filter (e.g. "info", "orbit_satellite=debug")
    #[arg(long, env = "ORBIT_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the satellite loops (default)
    Run(RunArgs),
    /// Print pointer, queue and containment counts as JSON
    Diag,
    /// Show version string
    Version,
}

#[derive(Args)]
pub struct RunArgs {
    /// Audit cycle interval in seconds
    #[arg(long, env = "ORBIT_AUDIT_INTERVAL_SECS", default_value_t = 30)]
    pub audit_interval_secs: u64,

    /// Repair worker poll interval in seconds
    #[arg(long, env = "ORBIT_REPAIR_INTERVAL_SECS", default_value_t = 10)]
    pub repair_interval_secs: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        RunArgs {
            audit_interval_secs: 30,
            repair_interval_secs: 10,
        }
    }
}

pub async fn run() -> i32 {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let result = match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Version => {
            println!("{} {}", APP_NAME, APP_VERSION);
            Ok(())
        }
        Command::Diag => diag(&cli.config_dir),
        Command::Run(args) => run_satellite(&cli.config_dir, args).await,
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            error!("{:#}", err);
            1
        }
    }
}

fn bootstrap(config_dir: &PathBuf) -> anyhow::Result<Satellite> {
    let config: SatelliteConfig = load_from_file(config_dir.join("satellite.toml"))?;

    let identity_path = config_dir.join("identity.key");
    let identity = match std::fs::read(&identity_path) {
        Ok(bytes) => Identity::from_secret_bytes(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let identity = Identity::generate();
            std::fs::write(&identity_path, identity.secret_bytes())?;
            info!(satellite_id = %identity.node_id(), "generated fresh satellite identity");
            identity
        }
        Err(e) => return Err(e.into()),
    };
    info!(satellite_id = %identity.node_id(), "satellite identity loaded");

    Ok(Satellite::new(
        Arc::new(identity),
        config,
        Arc::new(RemoteTransport::default()),
    ))
}

async fn run_satellite(config_dir: &PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let audit_interval_secs = args.audit_interval_secs;
    let repair_interval_secs = args.repair_interval_secs;
    let satellite = Arc::new(bootstrap(config_dir)?);
    let shutdown = Arc::new(Notify::new());
    let mut loops = Vec::new();

    // audit: reverify contained nodes, sample a fresh stripe, apply report
    {
        let satellite = satellite.clone();
        let shutdown = shutdown.clone();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(audit_interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match satellite.audit.run_once().await {
                            Ok(Some(report)) => info!(
                                successes = report.successes.len(),
                                fails = report.fails.len(),
                                offlines = report.offlines.len(),
                                contained = report.pending_audits.len(),
                                "audit cycle complete"
                            ),
                            Ok(None) => {}
                            Err(err) => warn!(%err, "audit cycle failed"),
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        }));
    }

    // checker sweep feeding the repair queue
    {
        let satellite = satellite.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_millis(satellite.config.repair.interval_ms);
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { satellite.checker.run_once(); }
                    _ = shutdown.notified() => break,
                }
            }
        }));
    }

    // repair worker draining the queue
    {
        let satellite = satellite.clone();
        let shutdown = shutdown.clone();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(repair_interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        while satellite.repair_worker.run_once().await.is_some() {}
                    }
                    _ = shutdown.notified() => break,
                }
            }
        }));
    }

    // housekeeping: settlement archival, containment age-out, object sweep
    {
        let satellite = satellite.clone();
        let shutdown = shutdown.clone();
        loops.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        satellite.orders.archive(now_ms());
                        let aged = satellite.reporter.age_out_containment();
                        if aged > 0 {
                            info!(aged, "containment entries aged out to offline");
                        }
                        let torn = satellite.metainfo.reconcile_objects();
                        if !torn.is_empty() {
                            warn!(count = torn.len(), "objects with inconsistent segments");
                        }
                        satellite.gc.run_once().await;
                        satellite.tally.run_once();
                    }
                    _ = shutdown.notified() => break,
                }
            }
        }));
    }

    info!(
        audit_interval = audit_interval_secs,
        repair_interval = repair_interval_secs,
        "orbit satellite running; ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.notify_waiters();
    for task in loops {
        let _ = task.await;
    }
    Ok(())
}

fn diag(config_dir: &PathBuf) -> anyhow::Result<()> {
    let satellite = bootstrap(config_dir)?;
    let report = serde_json::json!({
        "satellite_id": satellite.identity.node_id().to_string(),
        "pointers": satellite.metainfo.len(),
        "nodes": satellite.overlay.node_count(),
        "repair_queue": satellite.repair_queue.len(),
        "repair_dead_letters": satellite.repair_queue.dead_letters().len(),
        "contained_nodes": satellite.containment.len(),
        "settled_receipts": satellite.orders.settled_count(),
        "archived_receipts": satellite.orders.archived_count(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
