//! imgfleetd: the imgfleet daemon.
//!
//! Single binary that assembles every subsystem:
//! - State store (redb) holding jobs, worker heartbeats and pool snapshots
//! - In-process job queue and filesystem artifact store
//! - Local worker fleet running the processing loop
//! - Result collector, when `queue.publish_results` is on
//! - Scaling controller
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! imgfleetd standalone --config imgfleet.toml --port 8080 --data-dir ./data
//! imgfleetd check-config --config imgfleet.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use imgfleet_api::{ApiState, build_router};
use imgfleet_autoscale::ScalingController;
use imgfleet_core::config::FleetConfig;
use imgfleet_gateway::retry::RetryPolicy;
use imgfleet_gateway::{FsArtifactStore, MemoryQueue};
use imgfleet_state::{JobTracker, StateStore, TrackerPolicy};
use imgfleet_worker::{CommandProcessor, LocalFleet, ResultCollector, WorkerContext};

const DEFAULT_FILTER: &str = "info,imgfleetd=debug,imgfleet=debug";

#[derive(Parser)]
#[command(name = "imgfleetd", about = "imgfleet image processing daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run API, scaling controller and local workers in one process.
    Standalone {
        /// Path to imgfleet.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse and validate a config file, then print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
        } => {
            let config = load_config(config.as_deref(), port, data_dir)?;
            run_standalone(config).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(
    path: Option<&Path>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<FleetConfig> {
    let mut config = match path {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FleetConfig::default(),
    };
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(data_dir) = data_dir {
        config.server.data_dir = data_dir;
    }
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    println!("{}: OK", path.display());
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run_standalone(config: FleetConfig) -> anyhow::Result<()> {
    info!("imgfleet daemon starting in standalone mode");

    let data_dir = &config.server.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("imgfleet.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");

    let tracker = JobTracker::new(store, TrackerPolicy::from(&config.tracker));

    let queue = Arc::new(MemoryQueue::new("jobs", config.queue.visibility_timeout));
    let artifacts = Arc::new(FsArtifactStore::open(data_dir.join("artifacts")).await?);
    info!(root = ?artifacts.root(), "artifact store opened");

    let results = config
        .queue
        .publish_results
        .then(|| Arc::new(MemoryQueue::new("results", config.queue.visibility_timeout)));

    let processor = Arc::new(CommandProcessor::new(&config.worker.processor));
    let mut ctx = WorkerContext::new(
        &config,
        tracker.clone(),
        queue.clone(),
        artifacts.clone(),
        processor,
    );
    if let Some(results) = &results {
        ctx = ctx.with_results(results.clone());
    }
    let fleet = Arc::new(LocalFleet::new(ctx));
    info!(program = %config.worker.processor.program, "local worker fleet initialized");

    let mut controller =
        ScalingController::new(&config, tracker.clone(), queue.clone(), fleet.clone());
    controller.requeue_unfinished().await?;
    info!(
        interval_ms = config.scaling.interval.as_millis() as u64,
        min_pool = config.scaling.min_pool,
        max_pool = config.scaling.max_pool,
        "scaling controller initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let interval = config.scaling.interval;
    let collector_handle = results.map(|results| {
        let collector = ResultCollector::new(
            results,
            tracker.clone(),
            RetryPolicy::from(&config.gateway),
            config.worker.poll_wait,
        );
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { collector.run(shutdown).await })
    });

    let controller_handle = tokio::spawn(async move {
        controller.run(interval, shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let state = ApiState::new(
        tracker,
        queue,
        artifacts,
        RetryPolicy::from(&config.gateway),
    );
    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Stop scaling first so no new workers are launched while draining.
    let _ = controller_handle.await;
    fleet.shutdown().await;
    if let Some(handle) = collector_handle {
        let _ = handle.await;
    }

    info!("imgfleet daemon stopped");
    Ok(())
}
