use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use hotswap_core::{ErrorKind, IdentifySection, LockStatus, LockingProcess, ReplaceError};

use super::*;

fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("must write test file");
    path
}

#[test]
fn unlocked_file_probes_unlocked_every_time() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let path = write_file(dir.path(), "config.json", "{}");

    for _ in 0..3 {
        assert_eq!(
            probe_path(&path).expect("probe must succeed"),
            LockStatus::Unlocked
        );
    }
    assert_eq!(fs::read_to_string(&path).expect("must read"), "{}");
}

#[cfg(unix)]
#[test]
fn exclusively_held_file_probes_locked() {
    use fs2::FileExt;

    let dir = tempfile::tempdir().expect("must create temp dir");
    let path = write_file(dir.path(), "main.bin", "old");
    let holder = fs::File::open(&path).expect("must open holder");
    FileExt::try_lock_exclusive(&holder).expect("must take lock");

    assert_eq!(
        OsLockProbe.probe(&path).expect("probe must succeed"),
        LockStatus::Locked
    );

    FileExt::unlock(&holder).expect("must release lock");
    assert_eq!(
        OsLockProbe.probe(&path).expect("probe must succeed"),
        LockStatus::Unlocked
    );
}

#[test]
fn missing_path_is_not_found_rather_than_locked() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let err = probe_path(&dir.path().join("absent.dll")).expect_err("missing path must fail");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn would_block_counts_as_contention() {
    assert!(is_lock_contention(&std::io::Error::from(
        std::io::ErrorKind::WouldBlock
    )));
    assert!(!is_lock_contention(&std::io::Error::from(
        std::io::ErrorKind::NotFound
    )));
    assert!(is_lock_contention(&fs2::lock_contended_error()));
}

#[test]
fn parse_handle_lines_for_target_path() {
    let stdout = "\
notepad.exe        pid: 4242   type: File           1C4: C:\\App\\main.exe
explorer.exe       pid: 17     type: File           2A0: C:\\Other\\thing.txt
MsMpEng.exe        pid:5120    type: File           3F0: C:\\App\\MAIN.EXE
";
    let processes = parse_handle_output(stdout, Path::new("C:\\App\\main.exe"));
    assert_eq!(
        processes,
        vec![
            LockingProcess::new("notepad.exe", 4242),
            LockingProcess::new("MsMpEng.exe", 5120),
        ]
    );
}

#[test]
fn parse_handle_output_without_matches_is_empty() {
    let stdout = "No matching handles found.\n";
    assert!(parse_handle_output(stdout, Path::new("C:\\App\\main.exe")).is_empty());
}

#[test]
fn parse_lsof_field_output() {
    let stdout = "p812\ncpython3\nf4\np913\ncviewer\nf12\nf13\n";
    assert_eq!(
        parse_lsof_output(stdout),
        vec![
            LockingProcess::new("python3", 812),
            LockingProcess::new("viewer", 913),
        ]
    );
}

#[test]
fn parse_powershell_tab_separated_lines() {
    let stdout = "1200\tapp\r\n\r\nnot a line\n77\tsvchost\n";
    assert_eq!(
        parse_powershell_output(stdout),
        vec![
            LockingProcess::new("app", 1200),
            LockingProcess::new("svchost", 77),
        ]
    );
}

#[test]
fn escape_single_quotes_for_powershell() {
    assert_eq!(
        escape_ps_single_quote(Path::new("C:\\Users\\O'Neil\\app.exe")),
        "C:\\Users\\O''Neil\\app.exe"
    );
}

struct FailingQuery;

impl LockerQuery for FailingQuery {
    fn source(&self) -> &str {
        "broken"
    }

    fn query(&self, _path: &Path) -> Result<Vec<LockingProcess>> {
        Err(anyhow!("tool not installed"))
    }
}

struct FixedQuery(Vec<LockingProcess>);

impl LockerQuery for FixedQuery {
    fn source(&self) -> &str {
        "fixed"
    }

    fn query(&self, _path: &Path) -> Result<Vec<LockingProcess>> {
        Ok(self.0.clone())
    }
}

#[test]
fn chain_falls_back_past_failing_mechanism() {
    let chain = QueryChain::new(vec![
        Box::new(FailingQuery),
        Box::new(FixedQuery(vec![LockingProcess::new("app", 9)])),
    ]);
    let identification = chain.identify(Path::new("/app/main"));
    assert_eq!(identification.source(), Some("fixed"));
    assert_eq!(identification.processes, vec![LockingProcess::new("app", 9)]);
}

#[test]
fn chain_without_working_mechanism_reports_unknown() {
    let chain = QueryChain::new(vec![Box::new(FailingQuery)]);
    assert!(chain.identify(Path::new("/app/main")).is_unknown());
    assert!(QueryChain::empty().identify(Path::new("/app/main")).is_unknown());
}

#[test]
fn chain_with_empty_answer_is_supported_not_unknown() {
    let chain = QueryChain::new(vec![Box::new(FixedQuery(Vec::new()))]);
    let identification = chain.identify(Path::new("/app/main"));
    assert!(!identification.is_unknown());
    assert!(identification.processes.is_empty());
}

#[test]
fn disabled_identification_selects_empty_chain() {
    let chain = select_identifier(&IdentifySection {
        enabled: false,
        handle_tool: None,
    });
    assert!(chain.sources().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn procfs_scan_finds_own_open_handle() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let path = write_file(dir.path(), "held.dat", "payload");
    let _holder = fs::File::open(&path).expect("must open holder");

    let processes = ProcFdScan::new("/proc")
        .query(&path)
        .expect("procfs scan must succeed");
    assert!(
        processes.iter().any(|process| process.pid == std::process::id()),
        "expected own pid in {processes:?}"
    );
}

struct CountdownLiveness {
    remaining: AtomicU32,
}

impl CountdownLiveness {
    fn new(polls_until_exit: u32) -> Self {
        Self {
            remaining: AtomicU32::new(polls_until_exit),
        }
    }
}

impl LivenessProbe for CountdownLiveness {
    fn is_running(&self, _identity: &ProcessIdentity) -> Result<bool> {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                Some(value.saturating_sub(1))
            })
            .unwrap_or(0);
        Ok(previous > 0)
    }
}

struct BrokenLiveness;

impl LivenessProbe for BrokenLiveness {
    fn is_running(&self, _identity: &ProcessIdentity) -> Result<bool> {
        Err(anyhow!("process table unavailable"))
    }
}

#[test]
fn waiter_returns_once_process_exits() {
    let waiter =
        ProcessWaiter::with_liveness(CountdownLiveness::new(2), Duration::from_millis(5));
    assert!(waiter.await_termination(&ProcessIdentity::Name("app".into()), Duration::from_secs(5)));
}

#[test]
fn waiter_does_not_sleep_for_already_exited_process() {
    let waiter =
        ProcessWaiter::with_liveness(CountdownLiveness::new(0), Duration::from_secs(30));
    let started = Instant::now();
    assert!(waiter.await_termination(&ProcessIdentity::Pid(1234), Duration::from_secs(60)));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn waiter_times_out_when_liveness_cannot_be_answered() {
    let waiter = ProcessWaiter::with_liveness(BrokenLiveness, Duration::from_millis(5));
    assert!(!waiter.await_termination(&ProcessIdentity::Pid(1), Duration::from_millis(30)));
}

#[cfg(unix)]
#[test]
fn os_waiter_sees_reaped_child_as_terminated() {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("must spawn child");
    let pid = child.id();
    child.wait().expect("must reap child");

    let waiter = ProcessWaiter::new(Duration::from_millis(50));
    assert!(waiter.await_termination(&ProcessIdentity::Pid(pid), Duration::from_secs(5)));
}

#[cfg(unix)]
#[test]
fn signal_permission_error_still_means_running() {
    use crate::liveness::liveness_from_errno;

    assert_eq!(liveness_from_errno(libc::EPERM), Some(true));
    assert_eq!(liveness_from_errno(libc::ESRCH), Some(false));
    assert_eq!(liveness_from_errno(libc::EINVAL), None);
}

#[cfg(unix)]
#[test]
fn init_process_is_running_for_any_user() {
    // pid 1 answers EPERM to unprivileged callers and 0 to root
    let alive = OsLiveness
        .is_running(&ProcessIdentity::Pid(1))
        .expect("liveness query must answer");
    assert!(alive);
}

#[cfg(unix)]
#[test]
fn pid_zero_is_rejected() {
    assert!(OsLiveness.is_running(&ProcessIdentity::Pid(0)).is_err());
}

struct ScriptedProbe {
    answers: Mutex<Vec<Result<LockStatus, ReplaceError>>>,
}

impl LockProbe for ScriptedProbe {
    fn probe(&self, _path: &Path) -> Result<LockStatus, ReplaceError> {
        let mut answers = self.answers.lock().expect("probe script poisoned");
        if answers.is_empty() {
            return Ok(LockStatus::Unlocked);
        }
        answers.remove(0)
    }
}

#[test]
fn await_release_polls_until_unlocked() {
    let probe = ScriptedProbe {
        answers: Mutex::new(vec![Ok(LockStatus::Locked), Ok(LockStatus::Locked)]),
    };
    let waiter = ProcessWaiter::new(Duration::from_millis(5));
    assert!(waiter.await_release(&probe, Path::new("/app/main"), Duration::from_secs(5)));
    assert!(probe.answers.lock().expect("poisoned").is_empty());
}

#[test]
fn await_release_never_treats_unknown_as_released() {
    let probe = ScriptedProbe {
        answers: Mutex::new(vec![Ok(LockStatus::Unknown)]),
    };
    let waiter = ProcessWaiter::new(Duration::from_millis(5));
    assert!(!waiter.await_release(&probe, Path::new("/app/main"), Duration::from_secs(5)));
}

#[test]
fn await_release_treats_vanished_path_as_released() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let waiter = ProcessWaiter::new(Duration::from_millis(5));
    assert!(waiter.await_release(
        &OsLockProbe,
        &dir.path().join("gone.exe"),
        Duration::from_millis(50)
    ));
}
