use std::fs;
use std::io;
use std::path::Path;

use hotswap_core::{LockStatus, ReplaceError};

/// Answers "is this path open for exclusive access by someone else".
pub trait LockProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<LockStatus, ReplaceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsLockProbe;

impl LockProbe for OsLockProbe {
    fn probe(&self, path: &Path) -> Result<LockStatus, ReplaceError> {
        probe_path(path)
    }
}

/// Opens `path` exclusively and releases it at once.
///
/// A missing path is `NotFound`, never `Locked`.
pub fn probe_path(path: &Path) -> Result<LockStatus, ReplaceError> {
    let metadata = fs::metadata(path).map_err(|err| ReplaceError::from_io(path, err))?;
    probe_exclusive(path, &metadata)
}

#[cfg(unix)]
fn probe_exclusive(path: &Path, _metadata: &fs::Metadata) -> Result<LockStatus, ReplaceError> {
    use fs2::FileExt;

    let file = fs::File::open(path).map_err(|err| ReplaceError::from_io(path, err))?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(LockStatus::Unlocked)
        }
        Err(err) if is_lock_contention(&err) => Ok(LockStatus::Locked),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "flock probe unsupported");
            Ok(LockStatus::Unknown)
        }
    }
}

#[cfg(windows)]
fn probe_exclusive(path: &Path, metadata: &fs::Metadata) -> Result<LockStatus, ReplaceError> {
    use std::os::windows::fs::OpenOptionsExt;

    if metadata.is_dir() {
        return Ok(LockStatus::Unknown);
    }

    match fs::OpenOptions::new().read(true).share_mode(0).open(path) {
        Ok(file) => {
            drop(file);
            Ok(LockStatus::Unlocked)
        }
        Err(err) if is_lock_contention(&err) => Ok(LockStatus::Locked),
        Err(err) => Err(ReplaceError::from_io(path, err)),
    }
}

#[cfg(not(any(unix, windows)))]
fn probe_exclusive(_path: &Path, _metadata: &fs::Metadata) -> Result<LockStatus, ReplaceError> {
    Ok(LockStatus::Unknown)
}

/// True for OS errors that mean "someone else holds incompatible access".
pub fn is_lock_contention(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    let Some(code) = err.raw_os_error() else {
        return false;
    };
    if fs2::lock_contended_error().raw_os_error() == Some(code) {
        return true;
    }
    is_platform_contention_code(code)
}

#[cfg(windows)]
fn is_platform_contention_code(code: i32) -> bool {
    // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
    matches!(code, 32 | 33)
}

#[cfg(unix)]
fn is_platform_contention_code(code: i32) -> bool {
    code == libc::ETXTBSY || code == libc::EWOULDBLOCK
}

#[cfg(not(any(unix, windows)))]
fn is_platform_contention_code(_code: i32) -> bool {
    false
}
