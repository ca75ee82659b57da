use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::exec::DEFAULT_SHELL;
use crate::paths::{DEFAULT_LOG_DIR, DEFAULT_PID_FILE};
use crate::registry::PathMatch;

pub const DEFAULT_LOG_MODE: u32 = 0o640;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Root configuration structure. Deserialized from the TOML file named by `--config`.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// File holding the decimal pid of the running daemon.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    /// One entry per watched path.
    #[serde(default)]
    pub watch: Vec<WatchConfig>,
}

/// Log file settings.
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
    /// Directory that receives `app.log`.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// Permission bits applied to `app.log` (e.g. `0o640`).
    #[serde(default = "default_log_mode")]
    pub mode: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            mode: DEFAULT_LOG_MODE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    #[serde(alias = "fatal", alias = "panic")]
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Settings shared by every command the daemon runs.
#[derive(Debug, Deserialize)]
pub struct ExecConfig {
    /// Shell used by watch entries that set `shell = true`.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Per-command deadline in seconds. Unbounded when absent.
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub path_match: PathMatch,
    /// Canonicalize watch paths (following symlinks) at startup.
    #[serde(default = "default_true")]
    pub resolve_symlinks: bool,
    /// Capacity of the event queue between the watchers and the dispatcher.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            timeout_secs: None,
            path_match: PathMatch::default(),
            resolve_symlinks: true,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Configuration entry for a single watched path.
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    pub path: PathBuf,
    /// Watch every descendant, not just direct children.
    #[serde(default)]
    pub recursive: bool,
    /// Command lines run in order for every matching event.
    pub commands: Vec<String>,
    /// Run the commands through `exec.shell -c` instead of executing them directly.
    #[serde(default)]
    pub shell: bool,
    pub workdir: Option<PathBuf>,
    /// Overrides `exec.timeout_secs` for this path.
    pub timeout_secs: Option<u64>,
}

impl WatchConfig {
    /// Returns the effective command deadline, falling back to the exec config.
    pub fn effective_timeout(&self, exec: &ExecConfig) -> Option<Duration> {
        self.timeout_secs.or(exec.timeout_secs).map(Duration::from_secs)
    }

    /// Returns the shell to run commands through, or `None` for direct execution.
    pub fn effective_shell<'a>(&self, exec: &'a ExecConfig) -> Option<&'a str> {
        self.shell.then_some(exec.shell.as_str())
    }
}

/// Loads and parses the config file at `path`.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

impl Config {
    /// Rejects configs the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.pid_file.is_absolute(),
            "pid_file must be an absolute path: {}",
            self.pid_file.display()
        );
        ensure!(
            self.log.dir.is_absolute(),
            "log.dir must be an absolute path: {}",
            self.log.dir.display()
        );
        ensure!(self.exec.queue_capacity >= 1, "exec.queue_capacity must be at least 1");
        ensure!(self.exec.timeout_secs != Some(0), "exec.timeout_secs must be greater than 0");

        if self.watch.is_empty() {
            bail!("no [[watch]] entries configured");
        }

        for watch in &self.watch {
            let path = watch.path.display();
            ensure!(watch.path.is_absolute(), "watch path must be absolute: {path}");
            ensure!(
                watch.timeout_secs != Some(0),
                "timeout_secs must be greater than 0 for {path}"
            );
            if let Some(dir) = &watch.workdir {
                ensure!(dir.is_absolute(), "workdir must be absolute for {path}");
            }
            ensure!(!watch.commands.is_empty(), "no commands configured for {path}");
            for command in &watch.commands {
                ensure!(!command.trim().is_empty(), "blank command configured for {path}");
            }
        }

        Ok(())
    }
}

fn default_pid_file() -> PathBuf {
    PathBuf::from(DEFAULT_PID_FILE)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

fn default_log_mode() -> u32 {
    DEFAULT_LOG_MODE
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
