//! # Orbit Node CLI Module
//!
//! Clap-based CLI for the storage node: configuration loading, identity
//! bootstrap, the periodic settlement and sweep loops, and the `diag`
//! operator view.
//!
//! ## Commands
//!
//! - `run`     : start the node loops until interrupted
//! - `diag`    : print space usage and pending settlement as JSON
//! - `version` : show version string

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use orbit_common::config::{load_from_file, StorageNodeConfig};
use orbit_common::error::Error;
use orbit_common::identity::{Identity, PublicKey};
use orbit_common::time::now_ms;
use orbit_node::monitor::CapacityMonitor;
use orbit_node::orders::{SerialStore, UnsentOrders};
use orbit_node::pieces::{PieceStore, V0HeaderTable};
use orbit_node::trust::TrustedSatellites;
use orbit_node::NodeEndpoint;
use orbit_storage::FileStore;

const APP_NAME: &str = "orbit-node";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Orbit storage node.
///
/// Persists erasure-share pieces under satellite-signed order limits,
/// settles countersigned receipts, and reconciles against retain filters.
#[derive(Parser)]
#[command(name = "orbit-node", version, about = "Orbit storage node")]
pub struct Cli {
    /// Directory holding node.toml, the identity key and the serial set
    #[arg(long, env = "ORBIT_CONFIG_DIR", default_value = "./config")]
    pub config_dir: PathBuf,

    /// Log filter (e.g. "info", "orbit_node=debug")
    #[arg(long, env = "ORBIT_LOG", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the node loops (default)
    Run(RunArgs),
    /// Print space usage and pending settlement as JSON
    Diag,
    /// Show version string
    Version,
}

#[derive(Args)]
pub struct RunArgs {
    /// Piecestore listen address
    #[arg(long, env = "ORBIT_NODE_LISTEN", default_value = "127.0.0.1:28967")]
    pub listen: String,

    /// Settlement cycle interval in seconds
    #[arg(long, env = "ORBIT_SETTLE_INTERVAL_SECS", default_value_t = 300)]
    pub settle_interval_secs: u64,

    /// Expiry sweep interval in seconds
    #[arg(long, env = "ORBIT_SWEEP_INTERVAL_SECS", default_value_t = 3600)]
    pub sweep_interval_secs: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        RunArgs {
            listen: "127.0.0.1:28967".to_string(),
            settle_interval_secs: 300,
            sweep_interval_secs: 3600,
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
        Command::Run(args) => run_node(&cli.config_dir, args).await,
    };

    match result {
        Ok(()) => 0,
        Err(err) => {
            error!("{:#}", err);
            1
        }
    }
}

struct NodeSetup {
    endpoint: NodeEndpoint,
    serials: Arc<SerialStore>,
    serials_path: PathBuf,
}

/// Whitelist entries are hex-encoded satellite public keys; the node id is
/// derived from the key, so a typoed entry cannot impersonate anyone.
fn parse_satellite_key(entry: &str) -> Result<PublicKey, Error> {
    let bytes = hex::decode(entry).map_err(|e| Error::invalid(format!("satellite key hex: {}", e)))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::invalid("satellite key must be 32 bytes"))?;
    Ok(PublicKey(arr))
}

fn bootstrap(config_dir: &PathBuf) -> anyhow::Result<NodeSetup> {
    let config: StorageNodeConfig = load_from_file(config_dir.join("node.toml"))?;

    let identity_path = config_dir.join("identity.key");
    let identity = match std::fs::read(&identity_path) {
        Ok(bytes) => Identity::from_secret_bytes(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let identity = Identity::generate();
            std::fs::write(&identity_path, identity.secret_bytes())?;
            info!(node_id = %identity.node_id(), "generated fresh node identity");
            identity
        }
        Err(e) => return Err(e.into()),
    };
    info!(node_id = %identity.node_id(), "node identity loaded");

    let trust = Arc::new(TrustedSatellites::new());
    for entry in &config.trusted_satellites {
        match parse_satellite_key(entry) {
            Ok(key) => {
                let id = trust.add(key);
                info!(satellite = %id, "configured trusted satellite");
            }
            Err(err) => warn!(%entry, %err, "skipping malformed trusted satellite"),
        }
    }

    let blobs = Arc::new(FileStore::new(&config.data_dir)?);
    let monitor = Arc::new(CapacityMonitor::new(config.allocated_bytes));
    monitor.recalculate(blobs.as_ref(), &trust.ids())?;
    let v0_path = config_dir.join("v0-headers.db");
    let v0 = Arc::new(V0HeaderTable::load(&v0_path)?);
    let store = PieceStore::new(blobs, monitor, v0);

    let serials_path = config_dir.join("serials.db");
    let serials = Arc::new(SerialStore::load(
        &serials_path,
        config.orders.serial_retention_ms,
    )?);

    let endpoint = NodeEndpoint::new(
        Arc::new(identity),
        store,
        trust,
        serials.clone(),
        Arc::new(UnsentOrders::new()),
    );
    Ok(NodeSetup {
        endpoint,
        serials,
        serials_path,
    })
}

async fn run_node(config_dir: &PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let settle_interval_secs = args.settle_interval_secs;
    let sweep_interval_secs = args.sweep_interval_secs;
    let setup = bootstrap(config_dir)?;
    let shutdown = Arc::new(Notify::new());

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    let server = tokio::spawn(orbit_node::server::serve(
        setup.endpoint.clone(),
        listener,
        shutdown.clone(),
    ));

    let sweep_endpoint = setup.endpoint.clone();
    let sweep_shutdown = shutdown.clone();
    let sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match sweep_endpoint.sweep_expired() {
                        Ok(summary) if summary.deleted > 0 => {
                            info!(deleted = summary.deleted, "expiry sweep reclaimed pieces");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(%err, "expiry sweep failed"),
                    }
                }
                _ = sweep_shutdown.notified() => break,
            }
        }
    });

    // settlement channels are registered as satellites dial in; until then
    // receipts accumulate in the unsent set
    let agent = orbit_node::orders::SettlementAgent::new(
        setup.endpoint.node_id(),
        setup.endpoint.unsent_orders().clone(),
    );
    let settle_shutdown = shutdown.clone();
    let settle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(settle_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let accepted = agent.run_once().await;
                    if accepted > 0 {
                        info!(accepted, "settlement cycle complete");
                    }
                }
                _ = settle_shutdown.notified() => break,
            }
        }
    });

    let serial_store = setup.serials.clone();
    let purge_shutdown = shutdown.clone();
    let purge = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = ticker.tick() => { serial_store.purge(now_ms()); }
                _ = purge_shutdown.notified() => break,
            }
        }
    });

    info!(
        settle_interval = settle_interval_secs,
        sweep_interval = sweep_interval_secs,
        "orbit node running; ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.notify_waiters();
    let _ = tokio::join!(server, sweep, purge, settle);

    // the serial set must survive restarts or replays reopen
    setup.serials.persist(&setup.serials_path)?;
    info!("serial set persisted, exiting");
    Ok(())
}

fn diag(config_dir: &PathBuf) -> anyhow::Result<()> {
    let setup = bootstrap(config_dir)?;
    let monitor = setup.endpoint.store().monitor();
    let report = serde_json::json!({
        "node_id": setup.endpoint.node_id().to_string(),
        "allocated_bytes": monitor.allocated(),
        "used_bytes": monitor.used_total(),
        "available_bytes": monitor.available(),
        "pending_settlement": setup.endpoint.unsent_orders().pending(),
        "seen_serials": setup.serials.len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
