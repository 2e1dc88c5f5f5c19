//! harvestd - usage report harvester
//!
//! Runs the endpoint dispatcher as a daemon, or performs one-shot
//! administrative operations against the harvest database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use usage_harvest::automatic::Reconciler;
use usage_harvest::client::{DirectoryImport, HttpReportClient};
use usage_harvest::clock::SystemClock;
use usage_harvest::config::{HarvestConfig, LoggingConfig};
use usage_harvest::harvest::HarvestPlanner;
use usage_harvest::model::HarvestId;
use usage_harvest::outbox::NullWake;
use usage_harvest::runtime::{DispatchIntervals, Dispatcher, WorkerRegistry};
use usage_harvest::scheduler::unlock_stuck_schedulers;
use usage_harvest::store::SqliteStore;
use usage_harvest::HarvestContext;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "harvestd")]
#[command(about = "Usage report harvester")]
#[command(version)]
struct Args {
    /// Config file path.
    #[arg(short, long, env = "HARVEST_CONFIG", global = true)]
    config: Option<String>,

    /// Log level, overrides the configured one.
    #[arg(long, env = "HARVEST_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher until interrupted.
    Run {
        /// Write downloaded reports to this directory.
        #[arg(long, env = "HARVEST_IMPORT_DIR")]
        import_dir: Option<PathBuf>,
    },
    /// Reconcile automatic harvests once.
    Reconcile,
    /// Release stuck schedulers once.
    Sweep,
    /// Print harvest progress.
    Stats { harvest_id: i64 },
    /// Delete a manual harvest and its intentions.
    Wipe { harvest_id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = HarvestConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging, args.log_level.as_deref());
    tracing::info!("Starting harvestd v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(SqliteStore::open(&config.database.path).await?);
    tracing::info!(path = %store.path().display(), "Database opened");

    let client = Arc::new(HttpReportClient::new(Duration::from_secs(
        config.client.timeout_secs,
    ))?);
    let ctx = HarvestContext::new(store, client, Arc::new(SystemClock))
        .with_settings(config.settings());

    match args.command {
        Command::Run { import_dir } => {
            let ctx = match import_dir {
                Some(dir) => ctx.with_import(Arc::new(DirectoryImport::new(dir))),
                None => ctx,
            };
            run(ctx, &config).await;
        }
        Command::Reconcile => {
            let report = Reconciler::new(ctx).reconcile_for_next_month().await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Sweep => {
            let unlocked = unlock_stuck_schedulers(&ctx, WorkerRegistry::new().as_ref()).await?;
            println!("{}", serde_json::json!({ "unlocked": unlocked }));
        }
        Command::Stats { harvest_id } => {
            let stats = HarvestPlanner::new(ctx, Arc::new(NullWake))
                .stats(HarvestId(harvest_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Wipe { harvest_id } => {
            let removed = HarvestPlanner::new(ctx, Arc::new(NullWake))
                .wipe(HarvestId(harvest_id))
                .await?;
            println!("{}", serde_json::json!({ "removed": removed }));
        }
    }

    Ok(())
}

async fn run(ctx: HarvestContext, config: &HarvestConfig) {
    // Wake-ups come from planners embedded in this process; the sender is
    // kept alive for the lifetime of the dispatcher.
    let (wake_tx, wake_rx) = mpsc::unbounded_channel::<String>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher::new(
        ctx,
        WorkerRegistry::new(),
        DispatchIntervals::from_config(config),
    );
    let handle = tokio::spawn(dispatcher.run(wake_rx, shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    if let Err(err) = handle.await {
        tracing::error!(error = %err, "Dispatcher task failed");
    }
    drop(wake_tx);
    tracing::info!("harvestd shut down gracefully");
}

/// Initialize tracing/logging.
fn init_tracing(logging: &LoggingConfig, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
