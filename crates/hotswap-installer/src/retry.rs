use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hotswap_core::{IdentifySection, LockStatus, ReplaceError, RetryPolicy};
use hotswap_probe::{is_lock_contention, select_identifier, LockProbe, OsLockProbe, ProcessIdentifier};

pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Another process holds incompatible access; worth retrying.
    LockContention,
    /// Surfaced on first occurrence.
    Terminal,
}

/// Runs file operations under a [`RetryPolicy`], retrying only lock
/// contention and enriching exhaustion with the locking processes.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    probe: Arc<dyn LockProbe>,
    identifier: Arc<dyn ProcessIdentifier>,
    sleeper: Sleeper,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new(
        policy: RetryPolicy,
        probe: Arc<dyn LockProbe>,
        identifier: Arc<dyn ProcessIdentifier>,
    ) -> Self {
        Self {
            policy,
            probe,
            identifier,
            sleeper: Arc::new(thread::sleep),
        }
    }

    pub fn with_os_defaults(policy: RetryPolicy, identify: &IdentifySection) -> Self {
        Self::new(
            policy,
            Arc::new(OsLockProbe),
            Arc::new(select_identifier(identify)),
        )
    }

    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn probe(&self) -> &dyn LockProbe {
        self.probe.as_ref()
    }

    pub fn identifier(&self) -> &dyn ProcessIdentifier {
        self.identifier.as_ref()
    }

    /// Runs `operation` against `path` until it succeeds, fails terminally,
    /// or `max_attempts` lock-contended failures have been observed.
    pub fn execute<T, F>(&self, path: &Path, mut operation: F) -> Result<T, ReplaceError>
    where
        F: FnMut() -> io::Result<T>,
    {
        let mut attempt = 0_u32;
        loop {
            let err = match operation() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.classify(path, &err) == FailureClass::Terminal {
                return Err(ReplaceError::from_io(path, err));
            }

            attempt += 1;
            let delay = self.policy.delay_after_attempt(attempt);
            tracing::debug!(
                path = %path.display(),
                attempt,
                max_attempts = self.policy.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "file operation blocked by lock, backing off"
            );
            (self.sleeper)(delay);
            let last_status = self.probe.probe(path).unwrap_or(LockStatus::Unknown);

            if attempt >= self.policy.max_attempts() {
                let lockers = self.identifier.identify(path);
                tracing::warn!(
                    path = %path.display(),
                    attempts = attempt,
                    %last_status,
                    lockers = %lockers.summary(),
                    "giving up on locked file"
                );
                return Err(ReplaceError::LockTimeout {
                    path: path.to_path_buf(),
                    attempts: attempt,
                    last_status,
                    lockers,
                });
            }
        }
    }

    /// Permission errors only count as contention when the probe confirms
    /// the path is held.
    pub fn classify(&self, path: &Path, err: &io::Error) -> FailureClass {
        if is_lock_contention(err) {
            return FailureClass::LockContention;
        }
        if err.kind() == io::ErrorKind::PermissionDenied
            && matches!(self.probe.probe(path), Ok(LockStatus::Locked))
        {
            return FailureClass::LockContention;
        }
        FailureClass::Terminal
    }
}
