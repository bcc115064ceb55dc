//! vigild: the Vigil daemon.
//!
//! Loads a `vigil.toml`, registers the built-in probe and action kinds,
//! and drives the engine:
//! - Health checks behind per-check circuit breakers
//! - Threshold alerts with sustain windows and cooldowns
//! - Rule-driven recovery with cooldowns, attempt limits, and rollback
//!
//! # Usage
//!
//! ```text
//! vigild run --config vigil.toml --interval 15s
//! vigild validate --config vigil.toml
//! vigild status --config vigil.toml
//! ```

mod actions;
mod probes;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil_core::duration::{duration_field, format_duration};
use vigil_core::VigilConfig;
use vigil_engine::{Engine, EngineBuilder};
use vigil_health::ProbeRegistry;
use vigil_recovery::ActionRegistry;

#[derive(Parser)]
#[command(name = "vigild", about = "Vigil self-healing monitor")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Tick the engine periodically until Ctrl-C.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "vigil.toml")]
        config: PathBuf,

        /// Override `[engine] interval` (e.g. "15s").
        #[arg(long)]
        interval: Option<String>,
    },
    /// Load and validate a configuration, resolving every probe and action kind.
    Validate {
        #[arg(long, default_value = "vigil.toml")]
        config: PathBuf,
    },
    /// Run one tick and print the status snapshot as JSON.
    Status {
        #[arg(long, default_value = "vigil.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, interval } => run(&config, interval.as_deref()).await,
        Command::Validate { config } => validate(&config),
        Command::Status { config } => status(&config).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vigil=debug,vigild=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_engine(path: &Path) -> anyhow::Result<Engine> {
    let config = VigilConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let mut probe_kinds = ProbeRegistry::new();
    probes::register(&mut probe_kinds);
    let mut action_kinds = ActionRegistry::new();
    actions::register(&mut action_kinds);

    let engine = EngineBuilder::new(config)
        .with_probes(probe_kinds)
        .with_actions(action_kinds)
        .build()?;
    Ok(engine)
}

async fn run(path: &Path, interval: Option<&str>) -> anyhow::Result<()> {
    info!(config = %path.display(), "vigil daemon starting");

    let engine = build_engine(path)?;
    let interval = match interval {
        Some(s) => duration_field("cli", "--interval", s)?,
        None => engine.interval(),
    };
    info!(
        checks = engine.health().len(),
        interval = %format_duration(interval),
        "engine initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    engine.run(interval, shutdown_rx).await;

    info!("vigil daemon stopped");
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let engine = build_engine(path)?;
    println!(
        "{}: ok ({} health checks, {} alert rules, {} recovery rules)",
        path.display(),
        engine.health().len(),
        engine.alerts().rules().count(),
        engine.recovery().rules().count(),
    );
    Ok(())
}

async fn status(path: &Path) -> anyhow::Result<()> {
    let engine = build_engine(path)?;
    engine.tick().await;
    engine.drain_recovery().await;

    let snapshot = engine.status().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
