use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Paths under the updater's state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Layout rooted at `<prefix>/state`.
    pub fn under_prefix(prefix: &Path) -> Self {
        Self::new(prefix.join("state"))
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    pub fn active_run_path(&self) -> PathBuf {
        self.runs_dir().join("active")
    }

    pub fn run_metadata_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    pub fn run_journal_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.journal"))
    }

    pub fn run_staging_path(&self, run_id: &str) -> PathBuf {
        self.staging_dir().join(run_id)
    }

    pub fn swap_plan_path(&self, run_id: &str) -> PathBuf {
        self.run_staging_path(run_id).join("swap-plan.json")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.state_dir.clone(), self.runs_dir(), self.staging_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_user_prefix() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows user prefix")?;
        return Ok(PathBuf::from(app_data).join("Hotswap"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user prefix")?;
    Ok(PathBuf::from(home).join(".hotswap"))
}
