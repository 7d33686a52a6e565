use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AddonError {
    #[error("Unsupported package: {0}")]
    UnsupportedPackage(String),
    #[error("Transfer {0} error: {1}")]
    TransferError(String, String),
    #[error("Filesystem {0} error: {1}")]
    FilesystemError(String, String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Worker error: {0}")]
    WorkerError(String),
    #[error("Invalid job transition: {0}")]
    JobStateError(String),
    #[error("IO Error: {0}")]
    IOError(#[from] io::Error),
}

pub type AddonResult<T> = std::result::Result<T, AddonError>;

/// Coarse failure class carried by failed progress reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedPackage,
    Transfer,
    Filesystem,
    Internal,
}

impl ErrorKind {
    /// Only transfer failures leave nothing behind and may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transfer)
    }
}

impl AddonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AddonError::UnsupportedPackage(_) => ErrorKind::UnsupportedPackage,
            AddonError::TransferError(_, _) => ErrorKind::Transfer,
            AddonError::FilesystemError(_, _) | AddonError::IOError(_) => ErrorKind::Filesystem,
            AddonError::ConfigError(_)
            | AddonError::WorkerError(_)
            | AddonError::JobStateError(_) => ErrorKind::Internal,
        }
    }

    pub fn fs(path: &Path, err: impl ToString) -> Self {
        AddonError::FilesystemError(path.display().to_string(), err.to_string())
    }

    pub fn transfer(url: &str, err: impl ToString) -> Self {
        AddonError::TransferError(url.to_string(), err.to_string())
    }
}

/// Failure of a best-effort step that runs after the job outcome is decided.
/// Never converted into an `AddonError`.
#[derive(Error, Debug)]
#[error("Cleanup {path} failed: {source}")]
pub struct CleanupError {
    pub path: String,
    #[source]
    pub source: io::Error,
}

pub type CleanupResult = std::result::Result<(), CleanupError>;
