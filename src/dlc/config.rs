//! DLC manager configuration
//!
//! Defines the hints accepted by [`DlcManager::initialize`](super::DlcManager::initialize).

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::downloader::{DownloaderHints, RangeDownloader};
use crate::logging::{self, LogError};
use crate::meta::MetaError;

/// Tuning and collaborators for one manager instance
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Hints {
    /// File-list database of packs shipped with the application.
    pub local_packs_db: Option<PathBuf>,

    /// Per-manager log file. An empty path picks a timestamped name in the
    /// documents directory; `None` disables the file log.
    pub log_file_path: Option<PathBuf>,

    /// Pause between connection attempts.
    pub retry_connect_milliseconds: u64,

    /// Failed attempts after which a cached remote index is used offline.
    pub skip_cdn_connect_after_attempts: u32,

    /// Files downloaded at the same time.
    pub max_parallel_files: usize,

    /// Seconds without data before a transfer fails.
    pub timeout_for_download: u64,

    /// Connection slots of a downloader created by the manager.
    pub downloader_max_handles: usize,

    /// Resource root used to resolve absolute paths in `is_known_file`.
    pub resource_root: Option<PathBuf>,

    /// Downloader to share with other managers; one is created if unset.
    #[serde(skip)]
    pub downloader: Option<RangeDownloader>,
}

impl Default for Hints {
    fn default() -> Self {
        Self {
            local_packs_db: None,
            log_file_path: None,
            retry_connect_milliseconds: 3000,
            skip_cdn_connect_after_attempts: 3,
            max_parallel_files: 8,
            timeout_for_download: 30,
            downloader_max_handles: 8,
            resource_root: None,
            downloader: None,
        }
    }
}

impl Hints {
    /// Load hints from a JSON file (the downloader cannot be set this way).
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let hints: Hints = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        hints.validate()?;
        Ok(hints)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_connect_milliseconds == 0 {
            return Err(invalid("retry_connect_milliseconds", "must be positive"));
        }
        if self.max_parallel_files == 0 {
            return Err(invalid("max_parallel_files", "must be positive"));
        }
        if self.timeout_for_download == 0 {
            return Err(invalid("timeout_for_download", "must be positive"));
        }
        if self.downloader_max_handles == 0 {
            return Err(invalid("downloader_max_handles", "must be positive"));
        }
        if let Some(db) = &self.local_packs_db {
            if !db.is_file() {
                return Err(invalid("local_packs_db", &format!("{} is not a file", db.display())));
            }
        }
        Ok(())
    }

    /// Resolved log file, if file logging is enabled.
    pub fn log_file(&self) -> Option<PathBuf> {
        match &self.log_file_path {
            Some(path) if path.as_os_str().is_empty() => Some(logging::default_log_file_path()),
            Some(path) => Some(path.clone()),
            None => None,
        }
    }

    /// The injected downloader, or a new one tuned by these hints.
    pub(crate) fn downloader(&self) -> Result<RangeDownloader, ConfigError> {
        if let Some(downloader) = &self.downloader {
            return Ok(downloader.clone());
        }
        RangeDownloader::new(DownloaderHints {
            max_handles: self.downloader_max_handles,
            timeout_sec: self.timeout_for_download,
            ..DownloaderHints::default()
        })
        .map_err(|e| ConfigError::Downloader(format!("{:#}", e)))
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidHint {
        name,
        reason: reason.to_string(),
    }
}

/// Errors raised synchronously by `initialize`
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Download path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Download directory {path} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid hint {name}: {reason}")]
    InvalidHint { name: &'static str, reason: String },

    #[error("Bad local packs database {path}: {source}")]
    LocalPacksDb {
        path: PathBuf,
        #[source]
        source: MetaError,
    },

    #[error("Neither a remote URL nor a local packs database was given")]
    NoSource,

    #[error("Manager is already initialized")]
    AlreadyInitialized,

    #[error("Failed to read hints {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse hints {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to start downloader: {0}")]
    Downloader(String),

    #[error("Failed to start manager thread: {0}")]
    Thread(std::io::Error),

    #[error(transparent)]
    Log(#[from] LogError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let hints = Hints::default();
        assert!(hints.validate().is_ok());
        assert_eq!(hints.retry_connect_milliseconds, 3000);
        assert!(hints.log_file().is_none());
    }

    #[test]
    fn test_from_json_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("hints.json");
        std::fs::write(&path, r#"{"retry_connect_milliseconds": 250, "max_parallel_files": 2}"#)?;

        let hints = Hints::from_json_file(&path)?;
        assert_eq!(hints.retry_connect_milliseconds, 250);
        assert_eq!(hints.max_parallel_files, 2);
        assert_eq!(hints.timeout_for_download, 30);
        assert!(hints.downloader.is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_hints() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("hints.json");
        std::fs::write(&path, r#"{"max_parallel_files": 0}"#)?;
        assert!(matches!(
            Hints::from_json_file(&path),
            Err(ConfigError::InvalidHint { name: "max_parallel_files", .. })
        ));

        std::fs::write(&path, "{ not json")?;
        assert!(matches!(Hints::from_json_file(&path), Err(ConfigError::Parse { .. })));

        let hints = Hints {
            local_packs_db: Some(dir.path().join("missing.db")),
            ..Hints::default()
        };
        assert!(hints.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_empty_log_path_uses_default_name() {
        let hints = Hints {
            log_file_path: Some(PathBuf::new()),
            ..Hints::default()
        };
        let path = hints.log_file().unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("dlc_manager_log_"));
    }
}
