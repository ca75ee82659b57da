/// Default file locations for the daemon.
///
///   - /etc/watchcron/watchcron.toml  Configuration, read once at startup.
///   - /run/watchcron/watchcron.pid   PID marker, written at startup, removed on shutdown.
///   - /var/log/watchcron/app.log     Application log.
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/watchcron/watchcron.toml";
pub const DEFAULT_PID_FILE: &str = "/run/watchcron/watchcron.pid";
pub const DEFAULT_LOG_DIR: &str = "/var/log/watchcron";
pub const LOG_FILE_NAME: &str = "app.log";

/// Returns the full path of the application log inside `log_dir`.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_path_has_correct_name() {
        let path = log_file_path(Path::new(DEFAULT_LOG_DIR));
        assert_eq!(path.file_name().unwrap(), LOG_FILE_NAME);
    }

    #[test]
    fn log_file_path_is_inside_log_dir() {
        let path = log_file_path(Path::new("/tmp/logs"));
        assert_eq!(path.parent(), Some(Path::new("/tmp/logs")));
    }

    #[test]
    fn defaults_are_absolute() {
        for p in [DEFAULT_CONFIG_PATH, DEFAULT_PID_FILE, DEFAULT_LOG_DIR] {
            assert!(Path::new(p).is_absolute(), "{p} is not absolute");
        }
    }
}
