use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Starts the freshly installed executable from its own directory.
pub fn relaunch<S: AsRef<OsStr>>(executable: &Path, args: &[S]) -> Result<u32> {
    let working_dir = executable.parent().filter(|dir| !dir.as_os_str().is_empty());
    spawn_detached(executable, args, working_dir)
        .with_context(|| format!("failed to relaunch {}", executable.display()))
}

/// Spawns `program` without inheriting stdio so it outlives the caller.
pub fn spawn_detached<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    working_dir: Option<&Path>,
) -> Result<u32> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", program.display()))?;
    let pid = child.id();
    tracing::info!(program = %program.display(), pid, "spawned detached process");
    Ok(pid)
}
