use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKUP_SUFFIX: &str = ".hotswap-bak";

/// One "replace `destination` with `source`" operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementUnit {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub backup: PathBuf,
}

impl ReplacementUnit {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        backup_suffix: &str,
    ) -> Self {
        let destination = destination.into();
        let backup = derive_backup_path(&destination, backup_suffix);
        Self {
            source: source.into(),
            destination,
            backup,
        }
    }

    pub fn is_tree(&self) -> bool {
        self.source.is_dir()
    }
}

pub fn derive_backup_path(destination: &Path, suffix: &str) -> PathBuf {
    let mut file_name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    file_name.push(suffix);
    destination.with_file_name(file_name)
}
