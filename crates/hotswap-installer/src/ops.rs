use std::fs;
use std::io;
use std::path::Path;

use hotswap_security::{file_digest, FileDigest};

use crate::fs_utils::{remove_file_if_exists, sibling_temp_path};

/// Primitive file operations used by the replacer. Each call is retried by
/// the caller, so implementations must leave no partial state on error.
pub trait FileOps: Send + Sync {
    /// Copies the current `destination` to `backup`.
    fn backup_file(&self, destination: &Path, backup: &Path) -> io::Result<()>;

    /// Puts the contents of `source` at `destination` without ever leaving
    /// `destination` missing or truncated.
    fn install_file(&self, source: &Path, destination: &Path) -> io::Result<()>;

    fn digest(&self, path: &Path) -> io::Result<FileDigest>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// Real filesystem implementation: sibling temp file plus rename.
///
/// On Unix the OS does not refuse to replace a file another process holds,
/// so reads take a shared `flock` and renames an exclusive one on the
/// current destination; a holder of an exclusive lock surfaces as contention.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFileOps;

impl FileOps for FsFileOps {
    fn backup_file(&self, destination: &Path, backup: &Path) -> io::Result<()> {
        let _guard = AccessGuard::shared(destination)?;
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = sibling_temp_path(backup, "hotswap-bak");
        if let Err(err) = fs::copy(destination, &temp).and_then(|_| fs::rename(&temp, backup)) {
            let _ = remove_file_if_exists(&temp);
            return Err(err);
        }
        Ok(())
    }

    fn install_file(&self, source: &Path, destination: &Path) -> io::Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = sibling_temp_path(destination, "hotswap-new");
        let staged = fs::copy(source, &temp).and_then(|_| {
            let file = fs::OpenOptions::new().write(true).open(&temp)?;
            file.sync_all()
        });
        if let Err(err) = staged {
            let _ = remove_file_if_exists(&temp);
            return Err(err);
        }

        let guard = match AccessGuard::exclusive(destination) {
            Ok(guard) => guard,
            Err(err) => {
                let _ = remove_file_if_exists(&temp);
                return Err(err);
            }
        };
        let renamed = fs::rename(&temp, destination);
        drop(guard);
        if let Err(err) = renamed {
            let _ = remove_file_if_exists(&temp);
            return Err(err);
        }
        Ok(())
    }

    fn digest(&self, path: &Path) -> io::Result<FileDigest> {
        file_digest(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let _guard = AccessGuard::exclusive(path)?;
        remove_file_if_exists(path)
    }
}

/// Advisory lock held on an existing path for the duration of one
/// primitive. A missing path yields an empty guard.
struct AccessGuard {
    #[cfg(unix)]
    file: Option<fs::File>,
}

impl AccessGuard {
    #[cfg(unix)]
    fn shared(path: &Path) -> io::Result<Self> {
        Self::acquire(path, |file| fs2::FileExt::try_lock_shared(file))
    }

    #[cfg(unix)]
    fn exclusive(path: &Path) -> io::Result<Self> {
        Self::acquire(path, |file| fs2::FileExt::try_lock_exclusive(file))
    }

    #[cfg(unix)]
    fn acquire(path: &Path, lock: impl Fn(&fs::File) -> io::Result<()>) -> io::Result<Self> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self { file: None }),
            Err(err) => return Err(err),
        };
        lock(&file)?;
        Ok(Self { file: Some(file) })
    }

    #[cfg(not(unix))]
    fn shared(_path: &Path) -> io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(not(unix))]
    fn exclusive(_path: &Path) -> io::Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for AccessGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}
