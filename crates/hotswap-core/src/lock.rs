use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of probing a path for exclusive access.
///
/// `Unknown` is reported where the platform (or the kind of path) offers no
/// reliable way to tell; callers must never treat it as `Unlocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked,
    Locked,
    Unknown,
}

impl LockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::Locked => "locked",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_locked(self) -> bool {
        self == Self::Locked
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockingProcess {
    pub name: String,
    pub pid: u32,
}

impl LockingProcess {
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
        }
    }
}

impl fmt::Display for LockingProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentifyCapability {
    /// `source` names the tool or query that produced the answer.
    Supported { source: String },
    Unknown,
}

/// Best-effort answer to "who holds this path open".
///
/// An empty process list only means "nobody" when the capability is
/// `Supported`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    pub capability: IdentifyCapability,
    pub processes: Vec<LockingProcess>,
}

impl Identification {
    pub fn unknown() -> Self {
        Self {
            capability: IdentifyCapability::Unknown,
            processes: Vec::new(),
        }
    }

    pub fn supported(source: impl Into<String>, processes: Vec<LockingProcess>) -> Self {
        let mut seen = HashSet::new();
        let processes = processes
            .into_iter()
            .filter(|process| seen.insert(process.pid))
            .collect();
        Self {
            capability: IdentifyCapability::Supported {
                source: source.into(),
            },
            processes,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.capability == IdentifyCapability::Unknown
    }

    pub fn source(&self) -> Option<&str> {
        match &self.capability {
            IdentifyCapability::Supported { source } => Some(source),
            IdentifyCapability::Unknown => None,
        }
    }

    pub fn summary(&self) -> String {
        match (&self.capability, self.processes.is_empty()) {
            (IdentifyCapability::Unknown, _) => "locking process: unknown".to_string(),
            (IdentifyCapability::Supported { source }, true) => {
                format!("no locking process reported by {source}")
            }
            (IdentifyCapability::Supported { .. }, false) => {
                let names = self
                    .processes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("locked by {names}")
            }
        }
    }
}
