//! Graceful shutdown: stop pulling events, drain in-flight work, release the
//! watches and remove the PID marker.
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::dispatch::{DispatchHandle, DispatchStats};
use crate::pidfile;
use crate::watch::Subscriptions;

/// SIGINT and SIGTERM listeners. Installed early so a signal that arrives
/// during startup is held until [`TerminationSignals::recv`] is awaited
/// instead of killing the process.
pub struct TerminationSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl TerminationSignals {
    pub fn install() -> Result<Self> {
        let interrupt =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        Ok(Self { interrupt, terminate })
    }

    /// Resolves with the signal name once SIGINT or SIGTERM arrives.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

/// Owns everything that has to be torn down, in order, when the daemon stops.
pub struct ShutdownCoordinator {
    dispatch: DispatchHandle,
    subscriptions: Subscriptions,
    pid_file: PathBuf,
}

impl ShutdownCoordinator {
    pub fn new(dispatch: DispatchHandle, subscriptions: Subscriptions, pid_file: PathBuf) -> Self {
        Self {
            dispatch,
            subscriptions,
            pid_file,
        }
    }

    /// Blocks until any command already running has finished. A command
    /// that never exits (and has no deadline) holds shutdown indefinitely.
    pub async fn shutdown(self) -> DispatchStats {
        self.dispatch.request_shutdown();

        let state = std::sync::Arc::clone(self.dispatch.state());
        tracing::info!(
            phase = ?state.phase(),
            in_flight = state.in_flight(),
            "Awaiting in-flight dispatch work"
        );
        let stats = self.dispatch.await_shutdown().await;
        tracing::info!(phase = ?state.phase(), "Finished in-flight dispatch work");

        self.subscriptions.stop();

        if pidfile::remove(&self.pid_file) {
            tracing::info!(file = %self.pid_file.display(), "Removed pid file");
        }

        stats
    }
}
