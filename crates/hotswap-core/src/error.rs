use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Identification, LockStatus};

/// Failure taxonomy of the replacement engine.
///
/// Only `LockTimeout` is ever the product of retrying; every other variant is
/// surfaced on first occurrence.
#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("path not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("permission denied: {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "{} is still locked after {attempts} attempt(s) (last status: {last_status}; {})",
        path.display(),
        lockers.summary()
    )]
    LockTimeout {
        path: PathBuf,
        attempts: u32,
        last_status: LockStatus,
        lockers: Identification,
    },

    #[error("verification failed for {}: {detail}", path.display())]
    VerificationFailed { path: PathBuf, detail: String },

    #[error("rollback also failed for {}: {rollback} (after: {cause})", path.display())]
    RollbackFailed {
        path: PathBuf,
        cause: Box<ReplaceError>,
        rollback: Box<ReplaceError>,
    },

    #[error(
        "backup already exists at {}; run `hotswap cleanup` before updating again",
        backup.display()
    )]
    StaleBackup { backup: PathBuf },

    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Serializable tag of a [`ReplaceError`], recorded on outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    LockTimeout,
    VerificationFailed,
    RollbackFailed,
    StaleBackup,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::LockTimeout => "lock_timeout",
            Self::VerificationFailed => "verification_failed",
            Self::RollbackFailed => "rollback_failed",
            Self::StaleBackup => "stale_backup",
            Self::Io => "io",
        }
    }
}

impl ReplaceError {
    /// Maps an OS error without retry classification. Lock contention is
    /// decided by the retry executor, not here.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
                source: err,
            },
            _ => Self::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Self::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            Self::StaleBackup { .. } => ErrorKind::StaleBackup,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::NotFound { path }
            | Self::PermissionDenied { path, .. }
            | Self::LockTimeout { path, .. }
            | Self::VerificationFailed { path, .. }
            | Self::RollbackFailed { path, .. }
            | Self::Io { path, .. } => path,
            Self::StaleBackup { backup } => backup,
        }
    }

    /// Locking processes attached to this error or to the failure it wraps.
    pub fn lockers(&self) -> Option<&Identification> {
        match self {
            Self::LockTimeout { lockers, .. } => Some(lockers),
            Self::RollbackFailed { cause, rollback, .. } => {
                rollback.lockers().or_else(|| cause.lockers())
            }
            _ => None,
        }
    }
}
