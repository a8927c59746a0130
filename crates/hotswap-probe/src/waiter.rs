use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use hotswap_core::{ErrorKind, LockStatus};

use crate::{LivenessProbe, LockProbe, OsLiveness, ProcessIdentity};

/// Polls until a process exits or a path stops being locked.
///
/// Both waits return `false` on timeout; callers decide whether to proceed.
pub struct ProcessWaiter<L = OsLiveness> {
    liveness: L,
    poll_interval: Duration,
}

impl ProcessWaiter<OsLiveness> {
    pub fn new(poll_interval: Duration) -> Self {
        Self::with_liveness(OsLiveness, poll_interval)
    }
}

impl<L: LivenessProbe> ProcessWaiter<L> {
    pub fn with_liveness(liveness: L, poll_interval: Duration) -> Self {
        Self {
            liveness,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn await_termination(&self, identity: &ProcessIdentity, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            match self.liveness.is_running(identity) {
                Ok(false) => {
                    tracing::debug!(%identity, elapsed_ms = started.elapsed().as_millis() as u64, "process terminated");
                    return true;
                }
                Ok(true) => {}
                Err(err) => {
                    // an unanswerable query counts as "still running"
                    tracing::debug!(%identity, error = %format!("{err:#}"), "liveness query failed");
                }
            }
            if !self.sleep_within(started, timeout) {
                tracing::warn!(%identity, timeout_secs = timeout.as_secs(), "timed out waiting for process to exit");
                return false;
            }
        }
    }

    /// Waits until `path` probes unlocked. A path that no longer exists is
    /// released; an `Unknown` answer is never treated as released.
    pub fn await_release(&self, probe: &dyn LockProbe, path: &Path, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            match probe.probe(path) {
                Ok(LockStatus::Unlocked) => return true,
                Ok(LockStatus::Locked) => {}
                Ok(LockStatus::Unknown) => {
                    tracing::warn!(path = %path.display(), "lock state cannot be determined on this platform");
                    return false;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => return true,
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "lock probe failed while waiting");
                }
            }
            if !self.sleep_within(started, timeout) {
                tracing::warn!(path = %path.display(), timeout_secs = timeout.as_secs(), "timed out waiting for file release");
                return false;
            }
        }
    }

    fn sleep_within(&self, started: Instant, timeout: Duration) -> bool {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return false;
        }
        thread::sleep(self.poll_interval.min(timeout - elapsed));
        true
    }
}
