#![forbid(unsafe_code)]

//! `breakpoint-ctl`: operator CLI for `breakpoint-relay`.
//!
//! Lists and reaps breakpoint sessions in the shared directory and runs the
//! interactive debugger client against them.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use breakpoint_relay::client::DebuggerClient;
use breakpoint_relay::config::{post_mortem_enabled, GlobalConfig, POST_MORTEM_ENV};
use breakpoint_relay::liveness::ProcessLiveness;
use breakpoint_relay::reaper::reap;
use breakpoint_relay::registry::JobTable;
use breakpoint_relay::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "breakpoint-ctl",
    about = "Operator CLI for breakpoint-relay sessions",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Registry database path; overrides the configured one.
    #[arg(long)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reap stale sessions, then pick a session and debug it interactively.
    Debug,

    /// Print active sessions as JSON.
    List,

    /// Remove sessions whose owning job has died and print the report.
    Reap,

    /// Show whether post-mortem breakpoints are enabled.
    PostMortem,
}

fn main() {
    let args = Cli::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Err(err) = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Failed to init tracing: {err}");
    }

    let outcome = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    if let Err(err) = outcome {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(path) = args.registry {
        config.registry_path = path;
    }

    if matches!(args.command, Command::PostMortem) {
        let state = if post_mortem_enabled() { "enabled" } else { "disabled" };
        println!("post-mortem debugging {state} ({POST_MORTEM_ENV})");
        return Ok(());
    }

    let registry = config.open_registry().await?;
    let oracle = Arc::new(ProcessLiveness::new(JobTable::new(registry.store())));

    match args.command {
        Command::Debug => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut client =
                DebuggerClient::new(registry, config.client_settings(), stdin, tokio::io::stdout())
                    .with_reaper(oracle);
            client.run().await
        }
        Command::List => {
            let listing = registry.list_sessions().await?;
            print_json(&listing.sessions)
        }
        Command::Reap => {
            let report = reap(&registry, oracle.as_ref()).await?;
            print_json(&report)
        }
        Command::PostMortem => Ok(()),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Io(format!("cannot encode output: {err}")))?;
    println!("{text}");
    Ok(())
}
