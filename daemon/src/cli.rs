use std::path::PathBuf;

use clap::Parser;

use crate::config::LogLevel;
use crate::paths::DEFAULT_CONFIG_PATH;

/// Runs configured commands whenever files under watched paths are written
/// or moved in.
#[derive(Debug, Parser)]
#[command(name = "watchcron-daemon", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log at trace level regardless of the configured level.
    #[arg(long)]
    pub trace: bool,

    /// Log at debug level regardless of the configured level.
    #[arg(long)]
    pub debug: bool,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    pub test: bool,
}

impl Cli {
    /// The level actually used: `--trace` wins over `--debug`, which wins
    /// over the configured level.
    pub fn log_level(&self, configured: LogLevel) -> LogLevel {
        if self.trace {
            LogLevel::Trace
        } else if self.debug {
            LogLevel::Debug
        } else {
            configured
        }
    }
}
