use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{ErrorKind, LockingProcess, ReplaceError, ReplacementUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeResult {
    Success,
    RolledBack,
    Failed,
}

impl OutcomeResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp_unix_ms: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<LockingProcess>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp_unix_ms: current_unix_millis(),
            message: message.into(),
            processes: Vec::new(),
        }
    }

    pub fn with_processes(mut self, processes: Vec<LockingProcess>) -> Self {
        self.processes = processes;
        self
    }
}

/// Terminal record of one replacement unit. Built once through
/// [`OutcomeBuilder`] and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    unit: ReplacementUnit,
    result: OutcomeResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorKind>,
    diagnostics: Vec<Diagnostic>,
}

impl UpdateOutcome {
    pub fn builder(unit: ReplacementUnit) -> OutcomeBuilder {
        OutcomeBuilder {
            unit,
            diagnostics: Vec::new(),
        }
    }

    pub fn unit(&self) -> &ReplacementUnit {
        &self.unit
    }

    pub fn result(&self) -> OutcomeResult {
        self.result
    }

    pub fn error(&self) -> Option<ErrorKind> {
        self.error
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn is_success(&self) -> bool {
        self.result == OutcomeResult::Success
    }

    pub fn locking_processes(&self) -> Vec<&LockingProcess> {
        let mut seen = Vec::<&LockingProcess>::new();
        for process in self
            .diagnostics
            .iter()
            .flat_map(|diagnostic| &diagnostic.processes)
        {
            if !seen.iter().any(|existing| existing.pid == process.pid) {
                seen.push(process);
            }
        }
        seen
    }
}

#[derive(Debug)]
pub struct OutcomeBuilder {
    unit: ReplacementUnit,
    diagnostics: Vec<Diagnostic>,
}

impl OutcomeBuilder {
    pub fn unit(&self) -> &ReplacementUnit {
        &self.unit
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(message));
    }

    /// Records an error together with any locking processes it carries.
    pub fn note_error(&mut self, context: &str, err: &ReplaceError) {
        let processes = err
            .lockers()
            .map(|identification| identification.processes.clone())
            .unwrap_or_default();
        let message = match err.lockers() {
            Some(identification) => format!("{context}: {err} [{}]", identification.summary()),
            None => format!("{context}: {err}"),
        };
        self.diagnostics
            .push(Diagnostic::new(message).with_processes(processes));
    }

    pub fn finish(self, result: OutcomeResult, error: Option<ErrorKind>) -> UpdateOutcome {
        UpdateOutcome {
            unit: self.unit,
            result,
            error,
            diagnostics: self.diagnostics,
        }
    }

    pub fn success(self) -> UpdateOutcome {
        self.finish(OutcomeResult::Success, None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Merge,
    ExecutableSwap,
}

impl UpdateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::ExecutableSwap => "executable_swap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartialSuccess,
    Fatal,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Succeeded => 0,
            Self::Fatal => 1,
            Self::PartialSuccess => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::PartialSuccess => "partial_success",
            Self::Fatal => "fatal",
        }
    }
}

/// Aggregated result of one update run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub run_id: String,
    pub mode: UpdateMode,
    pub outcomes: Vec<UpdateOutcome>,
    pub unchanged: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relaunched_pid: Option<u32>,
}

impl UpdateReport {
    pub fn new(run_id: impl Into<String>, mode: UpdateMode) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            outcomes: Vec::new(),
            unchanged: 0,
            fatal: None,
            relaunched_pid: None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.count(OutcomeResult::Success)
    }

    pub fn rolled_back(&self) -> usize {
        self.count(OutcomeResult::RolledBack)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeResult::Failed)
    }

    fn count(&self, result: OutcomeResult) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result() == result)
            .count()
    }

    pub fn status(&self) -> RunStatus {
        if self.fatal.is_some() {
            return RunStatus::Fatal;
        }
        let unsuccessful = self.outcomes.len() - self.succeeded();
        if unsuccessful == 0 {
            return RunStatus::Succeeded;
        }
        if self.succeeded() == 0 {
            return RunStatus::Fatal;
        }
        RunStatus::PartialSuccess
    }
}

pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
