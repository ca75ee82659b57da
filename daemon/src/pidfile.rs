//! PID marker bookkeeping: a text file holding the decimal pid of the daemon.
use anyhow::{Context, Result};
use std::path::Path;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Reads the pid recorded in `path`, if the file exists.
pub fn read(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Can't read pid file: {}", path.display()))?;
    let pid = content
        .trim()
        .parse::<u32>()
        .with_context(|| format!("Pid file does not hold a pid: {}", path.display()))?;
    Ok(Some(pid))
}

/// Returns the pid recorded in `path` when it belongs to a live process other
/// than this one. Unreadable or stale files yield `None`.
pub fn live_owner(path: &Path) -> Option<u32> {
    let pid = match read(path) {
        Ok(Some(pid)) => pid,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "Ignoring unreadable pid file");
            return None;
        }
    };
    if pid == std::process::id() {
        return None;
    }

    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    sys.process(target).map(|_| pid)
}

/// Replaces any existing file at `path` with the pid of this process and
/// returns that pid. Creates the parent directory if it does not exist.
pub fn write(path: &Path) -> Result<u32> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Can't create pid directory: {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Can't remove pid file: {}", path.display()))?;
    }

    let pid = std::process::id();
    std::fs::write(path, pid.to_string())
        .with_context(|| format!("Can't create pid file: {}", path.display()))?;
    Ok(pid)
}

/// Removes the pid file if present. Failures are logged, never fatal.
/// Returns whether a file was removed.
pub fn remove(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(file = %path.display(), error = %e, "Can't remove pid file");
            false
        }
    }
}
