//! Logging configuration using tracing

use std::fs::{File, OpenOptions, Permissions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogConfig, LogLevel};
use crate::paths::log_file_path;

/// Overrides the configured filter when set, e.g. `WATCHCRON_LOG=debug`.
pub const LOG_ENV_VAR: &str = "WATCHCRON_LOG";

const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S";

/// Initialize the logging subsystem.
///
/// Records go to `<log.dir>/app.log` through a non-blocking writer. The
/// returned guard flushes pending records when dropped, so keep it alive
/// until the process is about to exit.
pub fn init(log: &LogConfig, level: LogLevel) -> Result<WorkerGuard> {
    let (file, _) = open_log_file(log)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let env_filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(guard)
}

/// Opens (creating if needed) the application log in append mode and
/// applies the configured permission bits.
fn open_log_file(log: &LogConfig) -> Result<(File, PathBuf)> {
    std::fs::create_dir_all(&log.dir)
        .with_context(|| format!("Can't create log directory: {}", log.dir.display()))?;

    let path = log_file_path(&log.dir);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(log.mode)
        .open(&path)
        .with_context(|| format!("Can't open/create app log file: {}", path.display()))?;

    // `mode` only applies on creation and is masked by the umask.
    std::fs::set_permissions(&path, Permissions::from_mode(log.mode))
        .with_context(|| format!("Can't chmod log file: {}", path.display()))?;

    Ok((file, path))
}
