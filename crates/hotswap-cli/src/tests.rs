use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use hotswap_core::{
    ErrorKind, Identification, LockStatus, LockingProcess, OutcomeResult, ReplaceError,
    ReplacementUnit, UpdateMode, UpdateOutcome, UpdateReport,
};
use hotswap_installer::{list_runs, RunMetadata, RunState, WaitTarget};

use crate::command_flows::{
    apply_overrides, apply_swap_args, resolve_settings, run_merge_command, wait_target,
    MergeSource, Output,
};
use crate::render::{format_report_lines, format_run_lines, render_status_line, report_json, OutputStyle};
use crate::{Cli, Commands, GlobalOptions};

fn plain_output() -> Output {
    Output {
        style: OutputStyle::Plain,
        json: false,
    }
}

fn unit(root: &Path, name: &str) -> ReplacementUnit {
    ReplacementUnit::new(
        root.join("payload").join(name),
        root.join("app").join(name),
        ".hotswap-bak",
    )
}

fn locked_outcome(unit: ReplacementUnit) -> UpdateOutcome {
    let err = ReplaceError::LockTimeout {
        path: unit.destination.clone(),
        attempts: 3,
        last_status: LockStatus::Locked,
        lockers: Identification::supported("lsof", vec![LockingProcess::new("editor", 4242)]),
    };
    let mut builder = UpdateOutcome::builder(unit);
    builder.note_error("install", &err);
    builder.finish(OutcomeResult::Failed, Some(ErrorKind::LockTimeout))
}

fn partial_report(root: &Path) -> UpdateReport {
    let mut report = UpdateReport::new("run-1771001234000-77", UpdateMode::Merge);
    report
        .outcomes
        .push(UpdateOutcome::builder(unit(root, "main.py")).success());
    report.outcomes.push(locked_outcome(unit(root, "lib.dll")));
    report.unchanged = 4;
    report
}

#[test]
fn merge_accepts_manifest_alone() {
    let cli = Cli::try_parse_from(["hotswap", "merge", "--manifest", "update.toml"])
        .expect("manifest merge should parse");
    match cli.command {
        Commands::Merge {
            manifest, payload, ..
        } => {
            assert_eq!(manifest, Some(PathBuf::from("update.toml")));
            assert!(payload.is_none());
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn merge_rejects_manifest_with_payload() {
    let err = Cli::try_parse_from([
        "hotswap",
        "merge",
        "--manifest",
        "update.toml",
        "--payload",
        "unpacked",
        "--target",
        "/opt/app",
    ])
    .expect_err("manifest and payload are exclusive");
    assert_eq!(err.kind(), ClapErrorKind::ArgumentConflict);
}

#[test]
fn merge_payload_requires_target() {
    let err = Cli::try_parse_from(["hotswap", "merge", "--payload", "unpacked"])
        .expect_err("payload without target must fail");
    assert_eq!(err.kind(), ClapErrorKind::MissingRequiredArgument);
}

#[test]
fn stage_exe_collects_trailing_relaunch_args() {
    let cli = Cli::try_parse_from([
        "hotswap",
        "stage-exe",
        "--new",
        "/tmp/app-new.exe",
        "--live",
        "/opt/app/app.exe",
        "--pid",
        "4242",
        "--",
        "--restored",
        "--profile=default",
    ])
    .expect("stage-exe should parse");
    match cli.command {
        Commands::StageExe {
            new_executable,
            pid,
            relaunch_args,
            no_spawn,
            ..
        } => {
            assert_eq!(new_executable, PathBuf::from("/tmp/app-new.exe"));
            assert_eq!(pid, Some(4242));
            assert_eq!(relaunch_args, vec!["--restored", "--profile=default"]);
            assert!(!no_spawn);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn wait_requires_a_target() {
    let err = Cli::try_parse_from(["hotswap", "wait"]).expect_err("wait needs a target");
    assert_eq!(err.kind(), ClapErrorKind::MissingRequiredArgument);

    let err = Cli::try_parse_from(["hotswap", "wait", "--pid", "1", "--name", "app"])
        .expect_err("pid and name are exclusive");
    assert_eq!(err.kind(), ClapErrorKind::ArgumentConflict);
}

#[test]
fn global_options_parse_after_subcommand() {
    let cli = Cli::try_parse_from([
        "hotswap",
        "status",
        "--json",
        "--state-dir",
        "/tmp/hotswap-state",
        "--max-attempts",
        "3",
    ])
    .expect("global flags are accepted anywhere");
    assert!(cli.options.json);
    assert_eq!(cli.options.max_attempts, Some(3));
    assert_eq!(
        cli.options.state_dir,
        Some(PathBuf::from("/tmp/hotswap-state"))
    );
}

#[test]
fn wait_target_prefers_pid() {
    assert_eq!(
        wait_target(Some(7), Some("app".to_string())),
        Some(WaitTarget::Pid(7))
    );
    assert_eq!(
        wait_target(None, Some("app".to_string())),
        Some(WaitTarget::Name("app".to_string()))
    );
    assert_eq!(wait_target(None, None), None);
}

#[test]
fn status_line_badges_only_in_rich_mode() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "replaced a"),
        "replaced a"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "replaced a"),
        "[OK] replaced a"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "rolled back b"),
        "[WARN] rolled back b"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "step", "waiting"),
        "[..] waiting"
    );
}

#[test]
fn report_lines_name_the_locking_process() {
    let temp = tempfile::tempdir().expect("must create tempdir");
    let report = partial_report(temp.path());

    let lines = format_report_lines(&report, OutputStyle::Plain);
    let main = temp.path().join("app").join("main.py");
    let lib = temp.path().join("app").join("lib.dll");

    assert_eq!(lines[0], format!("replaced {}", main.display()));
    assert_eq!(
        lines[1],
        format!("failed {} (lock_timeout)", lib.display())
    );
    assert!(
        lines.iter().any(|line| line == "  close to continue: editor (pid 4242)"),
        "missing locker line: {lines:?}"
    );
    assert_eq!(
        lines.last().map(String::as_str),
        Some(
            "partial_success: 1 succeeded, 0 rolled back, 1 failed, 4 unchanged (run run-1771001234000-77)"
        )
    );
}

#[test]
fn successful_outcomes_omit_diagnostics() {
    let temp = tempfile::tempdir().expect("must create tempdir");
    let mut builder = UpdateOutcome::builder(unit(temp.path(), "main.py"));
    builder.note("backed up");
    let mut report = UpdateReport::new("run-1-1", UpdateMode::Merge);
    report.outcomes.push(builder.success());

    let lines = format_report_lines(&report, OutputStyle::Plain);
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("succeeded: 1 succeeded"));
}

#[test]
fn report_json_carries_status_and_exit_code() {
    let temp = tempfile::tempdir().expect("must create tempdir");
    let report = partial_report(temp.path());

    let rendered = report_json(&report).expect("must serialize report");
    let value: serde_json::Value = serde_json::from_str(&rendered).expect("must be valid JSON");

    assert_eq!(value["status"], "partial_success");
    assert_eq!(value["exit_code"], 2);
    assert_eq!(value["run_id"], "run-1771001234000-77");
    assert_eq!(value["mode"], "merge");
    assert_eq!(value["unchanged"], 4);
    assert_eq!(value["outcomes"][1]["result"], "failed");
    assert_eq!(value["outcomes"][1]["error"], "lock_timeout");
    assert!(value.get("fatal").is_none());
}

#[test]
fn run_lines_mark_the_active_run() {
    assert_eq!(format_run_lines(&[], None), vec!["no update runs recorded"]);

    let runs = vec![
        RunMetadata {
            version: 1,
            run_id: "run-10-1".to_string(),
            mode: UpdateMode::Merge,
            status: RunState::Committed,
            started_at_unix: 10,
            owner_pid: 1,
        },
        RunMetadata {
            version: 1,
            run_id: "run-20-2".to_string(),
            mode: UpdateMode::ExecutableSwap,
            status: RunState::Applying,
            started_at_unix: 20,
            owner_pid: 2,
        },
    ];
    let lines = format_run_lines(&runs, Some("run-20-2"));
    assert_eq!(lines[0], "run-10-1 merge committed started_at=10 owner_pid=1");
    assert_eq!(
        lines[1],
        "run-20-2 executable_swap applying started_at=20 owner_pid=2 [active]"
    );
}

#[test]
fn flags_override_config_file_values() {
    let temp = tempfile::tempdir().expect("must create tempdir");
    let config_path = temp.path().join("config.toml");
    fs::write(
        &config_path,
        "[retry]\nmax_attempts = 9\ninitial_delay_ms = 50\n\n[waiter]\ntimeout_secs = 12\n",
    )
    .expect("must write config");

    let options = GlobalOptions {
        config: Some(config_path.clone()),
        state_dir: Some(temp.path().join("state")),
        max_attempts: Some(2),
        ..GlobalOptions::default()
    };
    let settings = resolve_settings(&options).expect("settings should resolve");

    assert_eq!(settings.policy.max_attempts(), 2);
    assert_eq!(settings.policy.initial_delay().as_millis(), 50);
    assert_eq!(settings.config.waiter.timeout_secs, 12);
    assert_eq!(settings.layout.state_dir(), temp.path().join("state"));
    assert_eq!(settings.config_path, Some(config_path));
}

#[test]
fn invalid_backoff_override_is_rejected() {
    let options = GlobalOptions {
        backoff_factor: Some(0.5),
        ..GlobalOptions::default()
    };
    let err = apply_overrides(hotswap_core::HotswapConfig::default(), &options)
        .expect_err("backoff below 1.0 is invalid");
    assert!(
        format!("{err:#}").contains("backoff_factor"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn apply_swap_args_forward_state_and_config() {
    let temp = tempfile::tempdir().expect("must create tempdir");
    let config_path = temp.path().join("config.toml");
    fs::write(&config_path, "").expect("must write config");
    let options = GlobalOptions {
        config: Some(config_path.clone()),
        state_dir: Some(temp.path().join("state")),
        ..GlobalOptions::default()
    };
    let settings = resolve_settings(&options).expect("settings should resolve");
    let plan = temp.path().join("state/staging/run-1-1/swap-plan.json");

    let args = apply_swap_args(&settings, &plan);
    let expected: Vec<std::ffi::OsString> = vec![
        "--config".into(),
        config_path.into(),
        "--state-dir".into(),
        temp.path().join("state").into(),
        "apply-swap".into(),
        "--plan".into(),
        plan.into(),
    ];
    assert_eq!(args, expected);

    let reparsed = Cli::try_parse_from(
        std::iter::once(std::ffi::OsString::from("hotswap")).chain(args),
    )
    .expect("helper arguments must parse");
    assert!(matches!(reparsed.command, Commands::ApplySwap { .. }));
}

#[test]
fn merge_command_replaces_manifest_entries() {
    let temp = tempfile::tempdir().expect("must create tempdir");
    let root = temp.path();
    fs::create_dir_all(root.join("payload")).expect("must create payload");
    fs::create_dir_all(root.join("app")).expect("must create app");
    fs::write(root.join("payload/main.py"), "v2").expect("must write source");
    fs::write(root.join("app/main.py"), "v1").expect("must write destination");
    let manifest = root.join("update.toml");
    fs::write(
        &manifest,
        "[[entry]]\nsource = \"payload/main.py\"\ndestination = \"app/main.py\"\n",
    )
    .expect("must write manifest");

    let options = GlobalOptions {
        state_dir: Some(root.join("state")),
        max_attempts: Some(1),
        initial_delay_ms: Some(1),
        ..GlobalOptions::default()
    };
    let settings = resolve_settings(&options).expect("settings should resolve");

    let code = run_merge_command(&settings, MergeSource::Manifest(manifest), plain_output())
        .expect("merge should run");
    assert_eq!(code, ExitCode::SUCCESS);
    assert_eq!(
        fs::read_to_string(root.join("app/main.py")).expect("must read destination"),
        "v2"
    );
    assert!(!root.join("app/main.py.hotswap-bak").exists());

    let runs = list_runs(&settings.layout).expect("must list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunState::Committed);
}

#[test]
fn merge_command_rejects_duplicate_destinations() {
    let temp = tempfile::tempdir().expect("must create tempdir");
    let root = temp.path();
    let manifest = root.join("update.toml");
    fs::write(
        &manifest,
        "[[entry]]\nsource = \"a\"\ndestination = \"app/x\"\n\n[[entry]]\nsource = \"b\"\ndestination = \"app/x\"\n",
    )
    .expect("must write manifest");
    let options = GlobalOptions {
        state_dir: Some(root.join("state")),
        ..GlobalOptions::default()
    };
    let settings = resolve_settings(&options).expect("settings should resolve");

    let err = run_merge_command(&settings, MergeSource::Manifest(manifest), plain_output())
        .expect_err("duplicate destinations must be rejected");
    assert!(
        format!("{err:#}").contains("duplicate manifest destination"),
        "unexpected error: {err:#}"
    );
    assert!(!root.join("state").join("runs").exists());
}
