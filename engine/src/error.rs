//! Error types for the backup engine.
//!
//! `EngineError` covers job-level failures (target unusable, index cannot be
//! opened) as well as the per-file failures the run loop logs and counts.
//! Only the former ever abort a run.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::JobState;

/// Errors raised by the engine.
///
/// `TargetNotFound`, `TargetNotDirectory` and `IndexUnavailable` are fatal to a
/// run. Everything else is recoverable at file granularity.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Target directory does not exist
    #[error("Target directory not found: {}", path.display())]
    TargetNotFound { path: PathBuf },

    /// Target path exists but is not a directory
    #[error("Target is not a directory: {}", path.display())]
    TargetNotDirectory { path: PathBuf },

    /// The persistent hash index could not be opened
    #[error("Hash index unavailable at {}: {source}", path.display())]
    IndexUnavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A single index operation failed (treated as a cache miss by callers)
    #[error("Hash index error: {0}")]
    Index(#[from] rusqlite::Error),

    /// Failed to read from a file
    #[error("Failed to read file: {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write or remove a file
    #[error("Failed to write file: {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a directory
    #[error("Failed to create directory: {}: {source}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read or recreate a symbolic link
    #[error("Failed to recreate symlink: {}: {source}", path.display())]
    SymlinkFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A copy read back with different content than its source
    #[error("Copy verification failed: {}", path.display())]
    ChecksumMismatch { path: PathBuf },

    /// `run_job` was called on a job that already ran
    #[error("Job must be pending to run; current state: {state:?}")]
    InvalidJobState { state: JobState },

    /// Path cannot be expressed relative to any configured source root
    #[error("Path is not under any source root: {}", path.display())]
    PathNotUnderRoot { path: PathBuf },

    /// Configuration could not be serialized
    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] serde_json::Error),

    /// Catch-all for unexpected errors
    #[error("Engine error: {message}")]
    Unknown { message: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::SymlinkFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Unknown {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_os_error() {
        let per_file = EngineError::ReadError {
            path: PathBuf::from("/nope/a.txt"),
            source: io::Error::from_raw_os_error(13),
        };
        assert_eq!(per_file.raw_os_error(), Some(13));

        let fatal = EngineError::TargetNotFound {
            path: PathBuf::from("/nope"),
        };
        assert_eq!(fatal.raw_os_error(), None);
    }

    #[test]
    fn test_display_includes_path() {
        let err = EngineError::TargetNotDirectory {
            path: PathBuf::from("/tmp/file.txt"),
        };
        assert!(err.to_string().contains("/tmp/file.txt"));
    }
}
