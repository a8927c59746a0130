use std::path::PathBuf;

use hotswap_core::{ReplacementUnit, UpdateMode};
use serde::{Deserialize, Serialize};

pub const RUN_METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Applying,
    Committed,
    Partial,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Applying
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: u32,
    pub run_id: String,
    pub mode: UpdateMode,
    pub status: RunState,
    pub started_at_unix: u64,
    pub owner_pid: u32,
}

/// One line of `<run>.journal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJournalEntry {
    pub seq: u64,
    pub step: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Written by `stage_executable`, consumed by `complete_swap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapPlan {
    pub plan_id: String,
    pub staged: PathBuf,
    pub live: PathBuf,
    pub wait_for: Option<WaitTarget>,
    #[serde(default)]
    pub companions: Vec<ReplacementUnit>,
    #[serde(default)]
    pub relaunch_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitTarget {
    Pid(u32),
    Name(String),
}
