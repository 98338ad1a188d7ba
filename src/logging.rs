//! Logging setup
//!
//! The binary installs one global fmt subscriber. A DLC manager may
//! additionally log to its own file: the subscriber is installed as the
//! thread default on the manager's worker thread, so everything the worker
//! does (initialization, queue advancement, verification) lands there.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::subscriber::DefaultGuard;
use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log path has no file name: {0}")]
    NoFileName(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the process-wide console subscriber.
///
/// `RUST_LOG` is honoured; `verbose` raises this crate to debug.
pub fn init(verbose: bool) -> Result<(), LogError> {
    use tracing_subscriber::util::SubscriberInitExt;

    let directive = if verbose { "superpack=debug" } else { "superpack=info" };
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .finish()
        .try_init()?;
    Ok(())
}

/// Default per-manager log file: `<documents>/dlc_manager_log_<day>_<hour>_<minute>.log`.
pub fn default_log_file_path() -> PathBuf {
    let dir = dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    let stamp = Local::now().format("%d_%H_%M");
    dir.join(format!("dlc_manager_log_{}.log", stamp))
}

/// Keeps a thread-local file subscriber alive.
///
/// Dropping it restores the previous default and flushes the file.
pub struct ThreadFileLog {
    _default: DefaultGuard,
    _writer: WorkerGuard,
}

/// Route this thread's events to `path` (appending) until the guard drops.
pub fn thread_file_logger(path: &Path) -> Result<ThreadFileLog, LogError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| LogError::NoFileName(path.to_path_buf()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let appender = rolling::never(&dir, file_name);
    let (writer, guard) = non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(appender);

    let subscriber = fmt()
        .with_env_filter(EnvFilter::new("superpack=debug"))
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(writer)
        .finish();

    Ok(ThreadFileLog {
        _default: tracing::subscriber::set_default(subscriber),
        _writer: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_thread_file_logger_writes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("logs").join("dlc.log");
        {
            let _log = thread_file_logger(&path)?;
            tracing::info!(target: "superpack::dlc", "hello from the worker");
        }
        let text = fs::read_to_string(&path)?;
        assert!(text.contains("hello from the worker"));
        Ok(())
    }

    #[test]
    fn test_default_log_name() {
        let path = default_log_file_path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("dlc_manager_log_"));
        assert!(name.ends_with(".log"));
    }
}
