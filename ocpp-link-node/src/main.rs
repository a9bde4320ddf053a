//! OCPP Link Node - keeps a fleet of simulated charge points online
//!
//! # Usage
//!
//! ```bash
//! # Connect two charge points and keep them online until Ctrl-C
//! ocpp-link-node --csms-url ws://localhost:8080/ocpp run -c CP-001 -c CP-002
//!
//! # Connect every charge point the catalog knows about
//! ocpp-link-node --api-url http://localhost:8080/api/v1 run --catalog
//!
//! # Ask the backend to start charging on CP-001; the node plays the
//! # charge point side of the remote start
//! ocpp-link-node start-charging CP-001 --connector 1 --id-tag TAG-1
//! ```

mod catalog_http;

use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use ocpp_link::{
    bring_fleet_online, bring_online, spawn_probe, Catalog, CatalogError, ConnectionManager,
    LinkConfig, LinkError, NetworkMonitor, WebSocketTransport,
};
use thiserror::Error;
use tokio::time;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::catalog_http::HttpCatalog;

/// How often fleet statistics are logged while running
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// OCPP 1.6J charge point connection manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Central system WebSocket URL (charge point id is appended)
    #[arg(long, default_value = "ws://localhost:8080/ocpp")]
    csms_url: String,

    /// Catalog API base URL
    #[arg(long, default_value = "http://localhost:8080/api/v1")]
    api_url: String,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "300")]
    heartbeat: u64,

    /// Base reconnect delay in seconds (doubles per attempt)
    #[arg(long, default_value = "5")]
    reconnect_interval: u64,

    /// Reconnect attempts before giving up
    #[arg(long, default_value = "5")]
    max_reconnect_attempts: u32,

    /// Call timeout in seconds
    #[arg(long, default_value = "30")]
    call_timeout: u64,

    /// Vendor name reported in BootNotification
    #[arg(long, default_value = "SimulatorVendor")]
    vendor: String,

    /// Model name reported in BootNotification
    #[arg(long, default_value = "SimulatorModel")]
    model: String,

    /// host:port probed to decide whether the network is up
    #[arg(long)]
    probe: Option<String>,

    /// Probe interval in seconds
    #[arg(long, default_value = "5")]
    probe_interval: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect charge points and keep them online until Ctrl-C
    Run {
        /// Charge point id (can be repeated)
        #[arg(short, long = "charge-point")]
        charge_points: Vec<String>,

        /// Also connect every charge point listed by the catalog
        #[arg(long)]
        catalog: bool,
    },

    /// Ask the backend to start charging on a charge point
    StartCharging {
        charge_point: String,

        #[arg(long, default_value = "1")]
        connector: u32,

        #[arg(long)]
        id_tag: String,

        #[command(flatten)]
        linger: Linger,
    },

    /// Ask the backend to stop a transaction
    StopCharging {
        charge_point: String,

        #[arg(long)]
        transaction_id: i32,

        #[command(flatten)]
        linger: Linger,
    },
}

#[derive(ClapArgs, Debug)]
struct Linger {
    /// Seconds to stay connected after the command so the scripted
    /// charge point messages go out
    #[arg(long, default_value = "10")]
    linger: u64,
}

#[derive(Debug, Error)]
enum NodeError {
    #[error("nothing to run: pass --charge-point or --catalog")]
    NothingToRun,

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           OCPP Link Node - Charge Point Connections          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  CSMS:     {:<50} ║", truncate(&args.csms_url, 50));
    println!("║  Catalog:  {:<50} ║", truncate(&args.api_url, 50));
    println!("║  Vendor:   {:<50} ║", truncate(&format!("{} / {}", args.vendor, args.model), 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = LinkConfig::new(&args.csms_url)
        .with_vendor(&args.vendor, &args.model)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat.max(1)))
        .with_reconnect(
            Duration::from_secs(args.reconnect_interval),
            args.max_reconnect_attempts,
        )
        .with_call_timeout(Duration::from_secs(args.call_timeout));

    let network = NetworkMonitor::online();
    let probe = args.probe.as_ref().map(|target| {
        info!("Probing {} every {}s", target, args.probe_interval);
        spawn_probe(
            network.clone(),
            target.clone(),
            Duration::from_secs(args.probe_interval.max(1)),
        )
    });

    let manager = ConnectionManager::new(config, Arc::new(WebSocketTransport::new()), network);
    let catalog = HttpCatalog::new(&args.api_url)?;

    let outcome = match args.command {
        Command::Run {
            charge_points,
            catalog: use_catalog,
        } => run(&manager, &catalog, charge_points, use_catalog).await,
        Command::StartCharging {
            charge_point,
            connector,
            id_tag,
            linger,
        } => {
            command(&manager, &charge_point, linger.linger, || {
                catalog.start_charging(&charge_point, connector, &id_tag)
            })
            .await
        }
        Command::StopCharging {
            charge_point,
            transaction_id,
            linger,
        } => {
            command(&manager, &charge_point, linger.linger, || {
                catalog.stop_charging(&charge_point, transaction_id)
            })
            .await
        }
    };

    manager.shutdown().await;
    if let Some(probe) = probe {
        probe.abort();
    }

    if let Err(e) = &outcome {
        error!("{}", e);
    }
    outcome.map_err(Into::into)
}

async fn run(
    manager: &ConnectionManager,
    catalog: &HttpCatalog,
    charge_points: Vec<String>,
    use_catalog: bool,
) -> Result<(), NodeError> {
    if charge_points.is_empty() && !use_catalog {
        return Err(NodeError::NothingToRun);
    }

    if !charge_points.is_empty() {
        for id in &charge_points {
            watch_errors(manager, id);
        }
        bring_online(manager, &charge_points).await;
    }
    if use_catalog {
        bring_fleet_online(manager, catalog).await?;
    }

    let mut ticker = time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(manager),
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, disconnecting");
                return Ok(());
            }
        }
    }
}

/// Connect one charge point, issue a catalog command and stay online for
/// `linger` seconds so the charge point side of the command plays out
async fn command<F, Fut>(
    manager: &ConnectionManager,
    charge_point: &str,
    linger: u64,
    issue: F,
) -> Result<(), NodeError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<ocpp_link::CommandResponse, CatalogError>>,
{
    watch_errors(manager, charge_point);
    manager.connect(charge_point).await?;

    let response = issue().await?;
    info!(
        charge_point_id = %charge_point,
        "Backend answered {:?} {}",
        response.status,
        response.message
    );

    tokio::select! {
        _ = time::sleep(Duration::from_secs(linger)) => {}
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
    }

    let status = manager.get_connection_status(charge_point);
    match serde_json::to_string(&status) {
        Ok(json) => info!("{}", json),
        Err(e) => warn!("Status not serializable: {}", e),
    }
    Ok(())
}

fn watch_errors(manager: &ConnectionManager, charge_point: &str) {
    let id = charge_point.to_string();
    manager.on_error(charge_point, move |e| warn!(charge_point_id = %id, "{}", e));
}

fn log_stats(manager: &ConnectionManager) {
    let stats = manager.connection_stats();
    info!(
        "{} connected, {} disconnected of {} ({:.1}%), network {:?}",
        stats.connected,
        stats.disconnected,
        stats.total,
        stats.connection_rate,
        manager.network().status()
    );
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
