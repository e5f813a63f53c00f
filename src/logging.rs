//! Structured logging setup for embedding applications.
//!
//! Console output plus a daily rolling file under `{data_dir}/logs`. The
//! engine itself only emits `tracing` events; calling [`init_logging`] is
//! optional and hosts with their own subscriber should skip it.

use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "dinesync";

/// Install the global tracing subscriber. Returns the guard that flushes
/// the file writer; hold it for the life of the process. `None` means the
/// file layer is not active, because a subscriber was already installed or
/// the log directory could not be created.
pub fn init_logging(data_dir: &Path) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dinesync=debug"));

    let log_dir = data_dir.join("logs");
    prune_old_logs(&log_dir);

    let console_layer = fmt::layer().with_target(true);

    match fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            let installed = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        Err(e) => {
            eprintln!("Could not create log directory {}: {e}", log_dir.display());
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
            None
        }
    }
}

/// Prune old log files, keeping only the most recent [`MAX_LOG_FILES`].
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with(LOG_FILE_PREFIX) {
                        let modified = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .unwrap_or(std::time::UNIX_EPOCH);
                        log_files.push((path, modified));
                    }
                }
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dinesync-{tag}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_prune_keeps_newest_files_and_ignores_strangers() {
        let dir = scratch_dir("logs");
        for i in 0..MAX_LOG_FILES + 3 {
            fs::write(dir.join(format!("dinesync.2026-01-{:02}", i + 1)), b"log").unwrap();
        }
        fs::write(dir.join("unrelated.txt"), b"keep").unwrap();

        prune_old_logs(&dir);

        let remaining = fs::read_dir(&dir).unwrap().count();
        assert_eq!(remaining, MAX_LOG_FILES + 1);
        assert!(dir.join("unrelated.txt").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_prune_tolerates_missing_directory() {
        let dir = std::env::temp_dir().join(format!("dinesync-nope-{}", uuid::Uuid::new_v4()));
        prune_old_logs(&dir);
        assert!(!dir.exists());
    }

    #[test]
    #[serial]
    fn test_init_does_not_panic_when_already_installed() {
        let dir = scratch_dir("init");
        let first = init_logging(&dir);
        // A second install must fail quietly; only one global subscriber
        // can exist per process.
        let second = init_logging(&dir);
        assert!(second.is_none());
        drop(first);
        fs::remove_dir_all(&dir).ok();
    }
}
