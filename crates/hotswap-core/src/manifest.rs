use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{derive_backup_path, ReplacementUnit};

/// List of (source, destination) pairs produced by the unpack step.
///
/// ```toml
/// [[entry]]
/// source = "payload/src/main.py"
/// destination = "/opt/app/src/main.py"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateManifest {
    #[serde(default, rename = "entry")]
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl UpdateManifest {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse update manifest")
    }

    /// Reads a manifest file; relative entries resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read update manifest: {}", path.display()))?;
        let mut manifest = Self::from_toml_str(&raw)
            .with_context(|| format!("invalid update manifest: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        manifest.resolve_relative(base);
        Ok(manifest)
    }

    pub fn resolve_relative(&mut self, base: &Path) {
        for entry in &mut self.entries {
            if entry.source.is_relative() {
                entry.source = base.join(&entry.source);
            }
            if entry.destination.is_relative() {
                entry.destination = base.join(&entry.destination);
            }
        }
    }

    /// Rejects manifests whose units would race on the same path.
    pub fn validate(&self, backup_suffix: &str) -> Result<()> {
        let mut destinations = HashSet::new();
        for entry in &self.entries {
            if entry.destination.file_name().is_none() {
                return Err(anyhow!(
                    "manifest destination has no file name: {}",
                    entry.destination.display()
                ));
            }
            if !entry.destination.is_absolute() {
                return Err(anyhow!(
                    "manifest destination must be absolute: {}",
                    entry.destination.display()
                ));
            }
            if entry.source == entry.destination {
                return Err(anyhow!(
                    "manifest entry replaces {} with itself",
                    entry.destination.display()
                ));
            }
            if !destinations.insert(entry.destination.clone()) {
                return Err(anyhow!(
                    "duplicate manifest destination: {}",
                    entry.destination.display()
                ));
            }
        }

        for entry in &self.entries {
            let backup = derive_backup_path(&entry.destination, backup_suffix);
            if destinations.contains(&backup) {
                return Err(anyhow!(
                    "manifest destination {} collides with the backup of another entry",
                    backup.display()
                ));
            }
        }

        Ok(())
    }

    pub fn units(&self, backup_suffix: &str) -> Vec<ReplacementUnit> {
        self.entries
            .iter()
            .map(|entry| {
                ReplacementUnit::new(&entry.source, &entry.destination, backup_suffix)
            })
            .collect()
    }
}
