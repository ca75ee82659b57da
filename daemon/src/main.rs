mod cli;
mod config;
mod dispatch;
mod event;
mod exec;
mod logging;
mod paths;
mod pidfile;
mod registry;
mod shutdown;
mod tokenizer;
mod watch;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::sync::mpsc;

use crate::config::{Config, LogLevel};
use crate::exec::ProcessRunner;
use crate::registry::PathRegistry;
use crate::shutdown::{ShutdownCoordinator, TerminationSignals};
use crate::watch::Subscriptions;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = match config::load(&cli.config).and_then(|c| c.validate().map(|_| c)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Can't load config file {}: {e:#}", cli.config.display());
            std::process::exit(1);
        }
    };

    if cli.test {
        println!("Config file {} is valid", cli.config.display());
        return;
    }

    // ── Logging ───────────────────────────────────────────────────────────────
    let level = cli.log_level(config.log.level);
    let log_guard = match logging::init(&config.log, level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    let code = match run(&config, &cli, level).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("{e:#}");
            1
        }
    };

    // Flush buffered log records before exiting.
    drop(log_guard);
    std::process::exit(code);
}

async fn run(config: &Config, cli: &cli::Cli, level: LogLevel) -> Result<()> {
    tracing::info!("Starting watchcron service [{VERSION}]");
    tracing::info!("Trace mode: [{}]", cli.trace);
    tracing::info!("Debug mode: [{}]", cli.debug);
    tracing::info!("Pid file: [{}]", config.pid_file.display());
    tracing::info!("Log level: [{}]", level.as_str());
    tracing::info!("Log directory: [{}]", config.log.dir.display());
    tracing::info!("Log mode: [{:o}]", config.log.mode);

    // Before the PID marker exists, so an early SIGTERM still cleans it up.
    let mut signals = TerminationSignals::install()?;

    // ── PID marker ────────────────────────────────────────────────────────────
    if let Some(pid) = pidfile::live_owner(&config.pid_file) {
        bail!(
            "Another instance is already running with pid {pid} | File [{}]",
            config.pid_file.display()
        );
    }
    let pid = pidfile::write(&config.pid_file)?;

    let coordinator = match start(config) {
        Ok(c) => c,
        Err(e) => {
            pidfile::remove(&config.pid_file);
            return Err(e);
        }
    };

    tracing::info!("watchcron service running with a pid: {pid}");

    // ── Wait for termination ──────────────────────────────────────────────────
    let name = signals.recv().await;
    tracing::info!(signal = name, "Received termination signal");

    let stats = coordinator.shutdown().await;
    tracing::info!(
        events = stats.events,
        skipped = stats.skipped,
        commands_run = stats.commands_run,
        commands_failed = stats.commands_failed,
        "Shutdown watchcron service completed"
    );
    Ok(())
}

/// Builds the registry, starts every watch and the dispatch loop.
/// Any path that cannot be watched aborts startup.
fn start(config: &Config) -> Result<ShutdownCoordinator> {
    let registry = Arc::new(PathRegistry::from_config(config)?);
    tracing::info!("Path match: [{:?}]", registry.path_match());

    for rule in registry.rules() {
        tracing::info!("Path: [{}] recursive: [{}]", rule.path.display(), rule.recursive);
        for command in &rule.commands {
            tracing::info!("Command: [{command}]");
        }
    }

    let (tx, rx) = mpsc::channel(config.exec.queue_capacity);
    let subscriptions = Subscriptions::start(&registry, tx)?;
    tracing::info!("Watching [{}] paths", subscriptions.len());
    let dispatch = dispatch::start(Arc::clone(&registry), rx, ProcessRunner);

    Ok(ShutdownCoordinator::new(
        dispatch,
        subscriptions,
        config.pid_file.clone(),
    ))
}
