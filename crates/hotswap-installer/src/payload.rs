use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hotswap_core::{derive_backup_path, ReplacementUnit};
use hotswap_security::file_digest;

use crate::fs_utils::list_files_recursive;

/// Units for the files of a payload that differ from the live tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadScan {
    pub changed: Vec<ReplacementUnit>,
    pub unchanged: usize,
}

/// Descends into the single top-level directory archives usually wrap
/// their contents in. Loose files at the top level keep `dir` as the root.
pub fn detect_payload_root(dir: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        entries.push(entry.path());
    }

    match entries.as_slice() {
        [] => Err(anyhow!("update payload is empty: {}", dir.display())),
        [only] if only.is_dir() => {
            tracing::debug!(root = %only.display(), "descending into single payload directory");
            Ok(only.clone())
        }
        _ => Ok(dir.to_path_buf()),
    }
}

/// Compares every payload file with its counterpart under `target` by size
/// and SHA-256; missing or differing files become replacement units.
pub fn scan_changed_files(
    payload_root: &Path,
    target_root: &Path,
    backup_suffix: &str,
) -> Result<PayloadScan> {
    let files = list_files_recursive(payload_root)?;
    reject_backup_collisions(&files, target_root, backup_suffix)?;

    let mut changed = Vec::new();
    let mut unchanged = 0;

    for rel in files {
        let source = payload_root.join(&rel);
        let destination = target_root.join(&rel);
        if is_same_content(&source, &destination)? {
            unchanged += 1;
            continue;
        }
        changed.push(ReplacementUnit::new(source, destination, backup_suffix));
    }

    tracing::debug!(
        changed = changed.len(),
        unchanged,
        payload = %payload_root.display(),
        "scanned update payload"
    );
    Ok(PayloadScan { changed, unchanged })
}

/// A payload file landing on another payload file's backup path would be
/// deleted by backup cleanup after being installed.
fn reject_backup_collisions(
    files: &[PathBuf],
    target_root: &Path,
    backup_suffix: &str,
) -> Result<()> {
    let destinations: HashSet<PathBuf> = files.iter().map(|rel| target_root.join(rel)).collect();
    for rel in files {
        let backup = derive_backup_path(&target_root.join(rel), backup_suffix);
        if destinations.contains(&backup) {
            return Err(anyhow!(
                "payload file {} collides with the backup of {}",
                backup.display(),
                target_root.join(rel).display()
            ));
        }
    }
    Ok(())
}

fn is_same_content(source: &Path, destination: &Path) -> Result<bool> {
    let Ok(destination_metadata) = fs::metadata(destination) else {
        return Ok(false);
    };
    if !destination_metadata.is_file() {
        return Ok(false);
    }
    let source_metadata = fs::metadata(source)
        .with_context(|| format!("failed to stat {}", source.display()))?;
    if source_metadata.len() != destination_metadata.len() {
        return Ok(false);
    }

    let expected = file_digest(source)
        .with_context(|| format!("failed to hash {}", source.display()))?;
    let actual = file_digest(destination)
        .with_context(|| format!("failed to hash {}", destination.display()))?;
    Ok(actual.mismatch(&expected).is_none())
}
