mod config;
mod error;
mod lock;
mod manifest;
mod outcome;
mod policy;
mod unit;

pub use config::{HotswapConfig, IdentifySection, RetrySection, WaiterSection};
pub use error::{ErrorKind, ReplaceError};
pub use lock::{IdentifyCapability, Identification, LockStatus, LockingProcess};
pub use manifest::{ManifestEntry, UpdateManifest};
pub use outcome::{
    current_unix_millis, Diagnostic, OutcomeBuilder, OutcomeResult, RunStatus, UpdateMode,
    UpdateOutcome, UpdateReport,
};
pub use policy::RetryPolicy;
pub use unit::{derive_backup_path, ReplacementUnit, DEFAULT_BACKUP_SUFFIX};

#[cfg(test)]
mod tests;
