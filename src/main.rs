#![forbid(unsafe_code)]

//! `breakpoint-relay`: worker node running units of work with remote
//! breakpoints.
//!
//! Opens the shared session directory, registers a job, runs the selected
//! workload, and keeps a background reaper sweeping sessions of dead jobs.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use breakpoint_relay::config::{post_mortem_enabled, GlobalConfig};
use breakpoint_relay::liveness::ProcessLiveness;
use breakpoint_relay::reaper::spawn_reaper_task;
use breakpoint_relay::registry::JobTable;
use breakpoint_relay::worker::{demo, Worker, WorkerOptions};
use breakpoint_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum Workload {
    /// Recursive factorial with a breakpoint at every level.
    Factorial,
    /// Single breakpoint over non-ASCII source.
    Commands,
    /// Breakpoint followed by a helper call.
    Stepping,
}

#[derive(Debug, Parser)]
#[command(name = "breakpoint-relay", about = "Worker node with remote breakpoints", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Publish sessions reachable from other nodes.
    #[arg(long)]
    debugger_external: bool,

    /// Job identifier; generated when omitted.
    #[arg(long)]
    job_id: Option<String>,

    #[command(subcommand)]
    command: NodeCommand,
}

#[derive(Debug, Subcommand)]
enum NodeCommand {
    /// Run a demo workload and print its result.
    Demo {
        /// Workload to run.
        #[arg(value_enum)]
        workload: Workload,

        /// Argument of the factorial workload.
        #[arg(long, default_value_t = 5)]
        n: u64,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("breakpoint-relay node bootstrap");

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
    if args.debugger_external {
        config.debugger_external = true;
    }
    let settings = config.bridge_settings()?;
    info!(advertised_host = %settings.advertised_host, "configuration loaded");

    // ── Open registry and register the job ──────────────
    let registry = config.open_registry().await?;
    let job_id = args
        .job_id
        .unwrap_or_else(|| format!("job-{}", uuid::Uuid::new_v4().simple()));
    let options = WorkerOptions {
        job_id,
        breakpoints_enabled: config.breakpoints.enabled,
        post_mortem: post_mortem_enabled(),
    };
    let worker = Worker::start(registry.clone(), settings, options).await?;

    // ── Start reaper ────────────────────────────────────
    let ct = CancellationToken::new();
    let oracle = Arc::new(ProcessLiveness::new(JobTable::new(registry.store())));
    let reaper_handle =
        spawn_reaper_task(registry, oracle, config.reaper_interval(), ct.clone());

    // ── Run workload ────────────────────────────────────
    let NodeCommand::Demo { workload, n } = args.command;
    let handle = match workload {
        Workload::Factorial => demo::submit_factorial(&worker, n),
        Workload::Commands => demo::submit_commands(&worker),
        Workload::Stepping => demo::submit_stepping(&worker),
    };
    info!(job_id = %worker.job_id(), call = %handle.label(), "workload submitted");

    let outcome = tokio::select! {
        result = handle.result() => Some(result),
        () = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
    };

    // ── Shutdown ────────────────────────────────────────
    ct.cancel();
    if let Err(err) = worker.finish().await {
        error!(%err, "failed to mark job finished");
    }
    if let Err(err) = reaper_handle.await {
        error!(%err, "reaper task did not shut down cleanly");
    }

    match outcome {
        Some(Ok(value)) => {
            println!("{value}");
            Ok(())
        }
        Some(Err(err)) => Err(err),
        None => Ok(()),
    }
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
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

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
