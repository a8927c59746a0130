use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use hotswap_core::{IdentifySection, Identification, LockingProcess};

const TOOL_TIMEOUT: Duration = Duration::from_secs(10);
const POWERSHELL_TIMEOUT: Duration = Duration::from_secs(15);

/// Resolves which processes hold a path open. Never fails: missing
/// capability is reported through [`Identification::unknown`].
pub trait ProcessIdentifier: Send + Sync {
    fn identify(&self, path: &Path) -> Identification;
}

/// One concrete lookup mechanism. An `Err` means the mechanism itself failed
/// (tool missing, crashed, timed out), not that nobody holds the file.
pub trait LockerQuery: Send + Sync {
    fn source(&self) -> &str;
    fn query(&self, path: &Path) -> Result<Vec<LockingProcess>>;
}

/// Ordered fallback of lookup mechanisms, chosen once at startup.
#[derive(Default)]
pub struct QueryChain {
    queries: Vec<Box<dyn LockerQuery>>,
}

impl QueryChain {
    pub fn new(queries: Vec<Box<dyn LockerQuery>>) -> Self {
        Self { queries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn sources(&self) -> Vec<&str> {
        self.queries.iter().map(|query| query.source()).collect()
    }
}

impl ProcessIdentifier for QueryChain {
    fn identify(&self, path: &Path) -> Identification {
        for query in &self.queries {
            match query.query(path) {
                Ok(processes) => return Identification::supported(query.source(), processes),
                Err(err) => {
                    tracing::debug!(
                        source = query.source(),
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "lock identification mechanism unavailable, falling back"
                    );
                }
            }
        }
        Identification::unknown()
    }
}

pub fn select_identifier(config: &IdentifySection) -> QueryChain {
    if !config.enabled {
        return QueryChain::empty();
    }

    let mut queries: Vec<Box<dyn LockerQuery>> = Vec::new();
    if cfg!(windows) {
        let handle_tool = config
            .handle_tool
            .clone()
            .or_else(|| which::which("handle64.exe").ok())
            .or_else(|| which::which("handle.exe").ok());
        if let Some(program) = handle_tool {
            queries.push(Box::new(HandleTool::new(program)));
        }
        if let Ok(program) = which::which("powershell.exe").or_else(|_| which::which("pwsh")) {
            queries.push(Box::new(PowerShellModules::new(program)));
        }
    } else {
        if let Ok(program) = which::which("lsof") {
            queries.push(Box::new(Lsof::new(program)));
        }
        if cfg!(target_os = "linux") && Path::new("/proc/self/fd").is_dir() {
            queries.push(Box::new(ProcFdScan::new("/proc")));
        }
    }

    let chain = QueryChain::new(queries);
    tracing::debug!(sources = ?chain.sources(), "selected lock identification chain");
    chain
}

/// Sysinternals-style handle lister.
pub struct HandleTool {
    program: PathBuf,
}

impl HandleTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl LockerQuery for HandleTool {
    fn source(&self) -> &str {
        "handle"
    }

    fn query(&self, path: &Path) -> Result<Vec<LockingProcess>> {
        let mut command = Command::new(&self.program);
        command.args(["-accepteula", "-nobanner"]).arg(path);
        let output = run_tool(&mut command, TOOL_TIMEOUT)?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}",
                self.program.display(),
                output.status
            ));
        }
        Ok(parse_handle_output(
            &String::from_utf8_lossy(&output.stdout),
            path,
        ))
    }
}

/// Lists processes whose loaded modules include the path.
pub struct PowerShellModules {
    program: PathBuf,
}

impl PowerShellModules {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl LockerQuery for PowerShellModules {
    fn source(&self) -> &str {
        "powershell"
    }

    fn query(&self, path: &Path) -> Result<Vec<LockingProcess>> {
        let script = format!(
            "Get-Process | Where-Object {{ try {{ $_.Modules | Where-Object {{ $_.FileName -eq '{}' }} }} catch {{ }} }} | ForEach-Object {{ \"$($_.Id)`t$($_.ProcessName)\" }}",
            escape_ps_single_quote(path)
        );
        let mut command = Command::new(&self.program);
        command.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
        let output = run_tool(&mut command, POWERSHELL_TIMEOUT)?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(parse_powershell_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

pub struct Lsof {
    program: PathBuf,
}

impl Lsof {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl LockerQuery for Lsof {
    fn source(&self) -> &str {
        "lsof"
    }

    fn query(&self, path: &Path) -> Result<Vec<LockingProcess>> {
        let mut command = Command::new(&self.program);
        command.args(["-w", "-F", "pc", "--"]).arg(path);
        let output = run_tool(&mut command, TOOL_TIMEOUT)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // lsof exits 1 when nothing has the file open.
        if !output.status.success() && !stdout.trim().is_empty() {
            return Err(anyhow!(
                "{} exited with {}",
                self.program.display(),
                output.status
            ));
        }
        if !output.status.success() && output.status.code() != Some(1) {
            return Err(anyhow!(
                "{} exited with {}",
                self.program.display(),
                output.status
            ));
        }
        Ok(parse_lsof_output(&stdout))
    }
}

/// Linux fallback: walks `/proc/<pid>/fd` and `/proc/<pid>/exe`.
pub struct ProcFdScan {
    proc_root: PathBuf,
}

impl ProcFdScan {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn process_holds(&self, pid_dir: &Path, target: &Path) -> bool {
        if fs::read_link(pid_dir.join("exe")).is_ok_and(|exe| exe == target) {
            return true;
        }
        let Ok(fds) = fs::read_dir(pid_dir.join("fd")) else {
            return false;
        };
        fds.flatten()
            .any(|fd| fs::read_link(fd.path()).is_ok_and(|link| link == target))
    }
}

impl LockerQuery for ProcFdScan {
    fn source(&self) -> &str {
        "procfs"
    }

    fn query(&self, path: &Path) -> Result<Vec<LockingProcess>> {
        let target = fs::canonicalize(path)
            .with_context(|| format!("failed to canonicalize {}", path.display()))?;
        let entries = fs::read_dir(&self.proc_root)
            .with_context(|| format!("failed to read {}", self.proc_root.display()))?;

        let mut processes = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let pid_dir = entry.path();
            if !self.process_holds(&pid_dir, &target) {
                continue;
            }
            let name = fs::read_to_string(pid_dir.join("comm"))
                .map(|comm| comm.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            processes.push(LockingProcess::new(name, pid));
        }
        Ok(processes)
    }
}

/// Runs a helper tool, killing it when it outlives `timeout`.
pub fn run_tool(command: &mut Command, timeout: Duration) -> Result<Output> {
    let program = command.get_program().to_string_lossy().to_string();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to launch {program}"))?;

    let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
    let stderr_reader = child.stderr.take().map(spawn_pipe_reader);

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed waiting for {program}"))?
        {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!(
                "{program} timed out after {}s",
                timeout.as_secs()
            ));
        }
        thread::sleep(Duration::from_millis(25));
    };

    Ok(Output {
        status,
        stdout: join_pipe_reader(stdout_reader),
        stderr: join_pipe_reader(stderr_reader),
    })
}

fn spawn_pipe_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn join_pipe_reader(reader: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Parses `handle -nobanner` lines such as
/// `notepad.exe  pid: 4242  type: File  1C4: C:\app\main.exe`.
pub fn parse_handle_output(stdout: &str, path: &Path) -> Vec<LockingProcess> {
    let needle = path.to_string_lossy().to_ascii_lowercase();
    let mut processes = Vec::new();
    for line in stdout.lines() {
        if !line.to_ascii_lowercase().contains(&needle) {
            continue;
        }
        let tokens = line.split_whitespace().collect::<Vec<_>>();
        let Some(name) = tokens.first() else {
            continue;
        };
        let pid = tokens.iter().enumerate().find_map(|(index, token)| {
            let rest = token.strip_prefix("pid:")?;
            if rest.is_empty() {
                tokens.get(index + 1)?.parse::<u32>().ok()
            } else {
                rest.parse::<u32>().ok()
            }
        });
        if let Some(pid) = pid {
            processes.push(LockingProcess::new(*name, pid));
        }
    }
    processes
}

/// Parses `<pid>\t<name>` lines emitted by the PowerShell query.
pub fn parse_powershell_output(stdout: &str) -> Vec<LockingProcess> {
    stdout
        .lines()
        .filter_map(|line| {
            let (pid, name) = line.trim().split_once('\t')?;
            let pid = pid.trim().parse::<u32>().ok()?;
            Some(LockingProcess::new(name.trim(), pid))
        })
        .collect()
}

/// Parses `lsof -F pc` field output (`p<pid>` followed by `c<command>`).
pub fn parse_lsof_output(stdout: &str) -> Vec<LockingProcess> {
    let mut processes = Vec::new();
    let mut current_pid = None;
    for line in stdout.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current_pid = pid.trim().parse::<u32>().ok();
            continue;
        }
        if let Some(name) = line.strip_prefix('c') {
            if let Some(pid) = current_pid.take() {
                processes.push(LockingProcess::new(name.trim(), pid));
            }
        }
    }
    processes
}

pub fn escape_ps_single_quote(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}
