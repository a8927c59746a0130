use std::fmt;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};

/// How a waited-on process is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessIdentity {
    Pid(u32),
    Name(String),
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pid(pid) => write!(f, "pid {pid}"),
            Self::Name(name) => write!(f, "process '{name}'"),
        }
    }
}

pub trait LivenessProbe: Send + Sync {
    fn is_running(&self, identity: &ProcessIdentity) -> Result<bool>;
}

/// Asks the OS process table through `kill(pid, 0)`/`pgrep` or `tasklist`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl LivenessProbe for OsLiveness {
    fn is_running(&self, identity: &ProcessIdentity) -> Result<bool> {
        match identity {
            ProcessIdentity::Pid(pid) => pid_alive(*pid),
            ProcessIdentity::Name(name) => name_alive(name),
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> Result<bool> {
    let raw = match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(anyhow!("invalid pid for liveness probe: {pid}")),
    };
    // SAFETY: signal 0 performs only the existence and permission checks.
    if unsafe { libc::kill(raw, 0) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error().and_then(liveness_from_errno) {
        Some(alive) => Ok(alive),
        None => Err(err).with_context(|| format!("failed probing liveness of pid={pid}")),
    }
}

/// `EPERM` means the process exists but belongs to someone else.
#[cfg(unix)]
pub(crate) fn liveness_from_errno(errno: i32) -> Option<bool> {
    match errno {
        libc::EPERM => Some(true),
        libc::ESRCH => Some(false),
        _ => None,
    }
}

#[cfg(unix)]
fn name_alive(name: &str) -> Result<bool> {
    let status = Command::new("pgrep")
        .arg("-x")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("failed executing liveness probe for '{name}'"))?;
    match status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(anyhow!("pgrep failed for '{name}': status={status}")),
    }
}

#[cfg(windows)]
fn pid_alive(pid: u32) -> Result<bool> {
    let stdout = tasklist(&format!("PID eq {pid}"))?;
    Ok(stdout.contains(&format!(",\"{pid}\"")) && !reports_no_tasks(&stdout))
}

#[cfg(windows)]
fn name_alive(name: &str) -> Result<bool> {
    let stdout = tasklist(&format!("IMAGENAME eq {name}"))?;
    let needle = format!("\"{}\"", name.to_ascii_lowercase());
    Ok(stdout.to_ascii_lowercase().contains(&needle) && !reports_no_tasks(&stdout))
}

#[cfg(windows)]
fn tasklist(filter: &str) -> Result<String> {
    let output = Command::new("tasklist")
        .args(["/FI", filter, "/FO", "CSV", "/NH"])
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed executing liveness probe ({filter})"))?;
    if !output.status.success() {
        return Err(anyhow!(
            "liveness probe failed ({filter}): status={} stderr='{}'",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(windows)]
fn reports_no_tasks(stdout: &str) -> bool {
    stdout.to_ascii_lowercase().contains("no tasks are running")
}

#[cfg(not(any(unix, windows)))]
fn pid_alive(pid: u32) -> Result<bool> {
    Err(anyhow!("process liveness is unsupported on this platform (pid={pid})"))
}

#[cfg(not(any(unix, windows)))]
fn name_alive(name: &str) -> Result<bool> {
    Err(anyhow!("process liveness is unsupported on this platform ('{name}')"))
}
