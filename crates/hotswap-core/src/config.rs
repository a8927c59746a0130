use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{RetryPolicy, DEFAULT_BACKUP_SUFFIX};

/// Contents of `hotswap.toml`. Every section is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotswapConfig {
    pub state_dir: Option<PathBuf>,
    pub backup_suffix: String,
    pub retry: RetrySection,
    pub waiter: WaiterSection,
    pub identify: IdentifySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaiterSection {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifySection {
    pub enabled: bool,
    pub handle_tool: Option<PathBuf>,
}

impl Default for HotswapConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
            retry: RetrySection::default(),
            waiter: WaiterSection::default(),
            identify: IdentifySection::default(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: RetryPolicy::DEFAULT_INITIAL_DELAY.as_millis() as u64,
            backoff_factor: RetryPolicy::DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl Default for WaiterSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            timeout_secs: 30,
        }
    }
}

impl Default for IdentifySection {
    fn default() -> Self {
        Self {
            enabled: true,
            handle_tool: None,
        }
    }
}

impl HotswapConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse hotswap config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    /// Explicit path wins; otherwise the default path is used when present.
    pub fn load_or_default(explicit: Option<&Path>, default_path: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if default_path.exists() {
            return Self::load(default_path);
        }
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        let suffix = self.backup_suffix.trim();
        if suffix.is_empty() {
            return Err(anyhow!("backup_suffix must not be empty"));
        }
        if suffix.contains(['/', '\\']) {
            return Err(anyhow!(
                "backup_suffix must not contain path separators: {suffix}"
            ));
        }
        if self.waiter.poll_interval_ms == 0 {
            return Err(anyhow!("waiter.poll_interval_ms must be greater than 0"));
        }
        self.retry_policy()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.initial_delay_ms),
            self.retry.backoff_factor,
        )
    }
}

impl WaiterSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
