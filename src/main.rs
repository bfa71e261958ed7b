#![forbid(unsafe_code)]

//! `rtcr`: checkpoint/restore supervisor binary.
//!
//! Bootstraps configuration, launches the configured children against the
//! simulated kernel, runs periodic checkpoint cycles and serves the IPC
//! socket for `rtcr-ctl`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rtcr::ipc::server::{spawn_ipc_server, ControlState};
use rtcr::kernel::sim::SimKernel;
use rtcr::orchestrator::checkpointer::Checkpointer;
use rtcr::orchestrator::supervisor::Supervisor;
use rtcr::workload::ChildWorkload;
use rtcr::{AppError, GlobalConfig, Result};

/// Cycle period used when `--cycles` is given without a configured interval.
const DEFAULT_CYCLE_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "rtcr", about = "Transparent checkpoint/restore supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Exit after this many periodic checkpoint cycles.
    #[arg(long)]
    cycles: Option<u64>,

    /// Override the scheduling mode from the configuration.
    #[arg(long)]
    parallel: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("rtcr supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if args.parallel {
        config.parallel = true;
    }
    let config = Arc::new(config);
    info!(mode = ?config.mode(), children = config.children.len(), "configuration loaded");

    // ── Build kernel, supervisor and orchestrator ───────
    let kernel = SimKernel::new();
    for child in &config.children {
        if let Some(module) = &child.rom {
            kernel.add_rom(module, format!("{module} for {}\n", child.name).as_bytes());
        }
    }

    let ct = CancellationToken::new();
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(kernel),
        Arc::clone(&config),
        ct.child_token(),
    ));
    let checkpointer = Arc::new(Checkpointer::new(
        Arc::clone(supervisor.registry()),
        config.mode(),
    ));

    // ── Launch children ─────────────────────────────────
    let mut workloads = Vec::with_capacity(config.children.len());
    for child in &config.children {
        workloads.push(ChildWorkload::launch(&supervisor, child)?);
    }
    info!(count = workloads.len(), "children launched");

    // ── Start IPC server ────────────────────────────────
    let state = Arc::new(ControlState {
        supervisor: Arc::clone(&supervisor),
        checkpointer: Arc::clone(&checkpointer),
    });
    let ipc_handle = spawn_ipc_server(state, ct.clone())?;

    // ── Periodic checkpoint loop ────────────────────────
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let interval_ms = match (config.interval_ms, args.cycles) {
        (0, Some(_)) => DEFAULT_CYCLE_INTERVAL_MS,
        (interval, _) => interval,
    };

    if interval_ms == 0 {
        info!("periodic checkpoints disabled; waiting for ipc commands");
        shutdown.await;
    } else {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        let mut completed = 0_u64;
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    for workload in &workloads {
                        if let Err(err) = workload.mutate(completed) {
                            warn!(child = workload.name(), %err, "workload step failed");
                        }
                    }
                    match checkpointer.run_cycle().await {
                        Ok(report) => info!(
                            epoch = report.epoch,
                            total_us = report.total_us,
                            "checkpoint cycle complete"
                        ),
                        Err(err) => error!(%err, "checkpoint cycle failed"),
                    }
                    completed += 1;
                    if args.cycles.is_some_and(|limit| completed >= limit) {
                        info!(completed, "cycle limit reached");
                        break;
                    }
                }
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────
    info!("shutting down");
    ct.cancel();
    supervisor.shutdown();
    let _ = ipc_handle.await;
    info!("rtcr shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
