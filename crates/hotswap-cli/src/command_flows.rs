use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use hotswap_core::{HotswapConfig, ReplacementUnit, RetryPolicy, UpdateManifest, UpdateReport};
use hotswap_installer::{
    default_user_prefix, detect_payload_root, is_valid_run_id, list_runs, load_swap_plan,
    read_active_run, scan_changed_files, spawn_detached, RepairOutcome, RetryExecutor,
    StageRequest, StagedReplacer, StateLayout, UpdateCoordinator, WaitTarget,
};
use hotswap_probe::{
    probe_path, select_identifier, OsLiveness, OsLockProbe, ProcessIdentifier, ProcessIdentity,
    ProcessWaiter,
};
use serde_json::json;

use crate::render::{
    format_report_lines, format_run_lines, render_section_header, render_status_line,
    report_json, OutputStyle, RunProgress,
};
use crate::GlobalOptions;

/// Effective configuration after file and flag resolution.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) config: HotswapConfig,
    pub(crate) layout: StateLayout,
    pub(crate) policy: RetryPolicy,
    pub(crate) config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Output {
    pub(crate) style: OutputStyle,
    pub(crate) json: bool,
}

impl Output {
    /// JSON output keeps stdout free of progress lines.
    fn progress_style(self) -> OutputStyle {
        if self.json {
            OutputStyle::Plain
        } else {
            self.style
        }
    }

    fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    fn print_json(self, value: &serde_json::Value) -> Result<()> {
        let rendered =
            serde_json::to_string_pretty(value).context("failed to serialize JSON output")?;
        println!("{rendered}");
        Ok(())
    }
}

pub(crate) enum MergeSource {
    Manifest(PathBuf),
    Payload { payload: PathBuf, target: PathBuf },
}

pub(crate) enum WaitRequest {
    Process(ProcessIdentity),
    Release(PathBuf),
}

pub(crate) fn resolve_settings(options: &GlobalOptions) -> Result<Settings> {
    let prefix = default_user_prefix();
    let (config, config_path) = match (&options.config, &prefix) {
        (Some(path), _) => (HotswapConfig::load(path)?, Some(path.clone())),
        (None, Ok(prefix)) => {
            let default_path = prefix.join("config.toml");
            let config = HotswapConfig::load_or_default(None, &default_path)?;
            let used = default_path.exists().then_some(default_path);
            (config, used)
        }
        (None, Err(err)) => {
            tracing::debug!(error = %format!("{err:#}"), "no user prefix; using default config");
            (HotswapConfig::default(), None)
        }
    };
    let config = apply_overrides(config, options)?;
    let policy = config.retry_policy()?;

    let state_dir = match options.state_dir.clone().or_else(|| config.state_dir.clone()) {
        Some(dir) => dir,
        None => match prefix {
            Ok(prefix) => StateLayout::under_prefix(&prefix).state_dir().to_path_buf(),
            Err(err) => return Err(err.context("cannot resolve hotswap state directory")),
        },
    };

    Ok(Settings {
        config,
        layout: StateLayout::new(state_dir),
        policy,
        config_path,
    })
}

/// Command-line flags win over config file values.
pub(crate) fn apply_overrides(
    mut config: HotswapConfig,
    options: &GlobalOptions,
) -> Result<HotswapConfig> {
    if let Some(max_attempts) = options.max_attempts {
        config.retry.max_attempts = max_attempts;
    }
    if let Some(initial_delay_ms) = options.initial_delay_ms {
        config.retry.initial_delay_ms = initial_delay_ms;
    }
    if let Some(backoff_factor) = options.backoff_factor {
        config.retry.backoff_factor = backoff_factor;
    }
    if let Some(timeout_secs) = options.timeout_secs {
        config.waiter.timeout_secs = timeout_secs;
    }
    config
        .retry_policy()
        .context("invalid retry settings after applying command-line overrides")?;
    Ok(config)
}

pub(crate) fn build_coordinator(settings: &Settings) -> UpdateCoordinator {
    let retry = RetryExecutor::with_os_defaults(settings.policy, &settings.config.identify);
    UpdateCoordinator::new(
        settings.layout.clone(),
        StagedReplacer::new(retry),
        settings.config.backup_suffix.clone(),
    )
}

pub(crate) fn load_manifest_units(path: &Path, backup_suffix: &str) -> Result<Vec<ReplacementUnit>> {
    let manifest = UpdateManifest::load(path)?;
    manifest
        .validate(backup_suffix)
        .with_context(|| format!("invalid update manifest: {}", path.display()))?;
    Ok(manifest.units(backup_suffix))
}

pub(crate) fn run_merge_command(
    settings: &Settings,
    source: MergeSource,
    output: Output,
) -> Result<ExitCode> {
    let suffix = &settings.config.backup_suffix;
    let (units, unchanged) = match source {
        MergeSource::Manifest(path) => (load_manifest_units(&path, suffix)?, 0),
        MergeSource::Payload { payload, target } => {
            let root = detect_payload_root(&payload)?;
            let scan = scan_changed_files(&root, &target, suffix)?;
            (scan.changed, scan.unchanged)
        }
    };

    settings.layout.ensure_base_dirs()?;
    let coordinator = build_coordinator(settings);
    let progress = RunProgress::start(output.progress_style(), "merge");
    let report = match coordinator.merge(&units, unchanged) {
        Ok(report) => report,
        Err(err) => {
            progress.abandon();
            return Err(err);
        }
    };
    progress.finish(&report);
    emit_report(&report, output)
}

pub(crate) fn run_stage_exe_command(
    settings: &Settings,
    request: StageRequest,
    companions: Option<PathBuf>,
    spawn_helper: bool,
    output: Output,
) -> Result<ExitCode> {
    let mut request = request;
    if let Some(path) = companions {
        request.companions = load_manifest_units(&path, &settings.config.backup_suffix)?;
    }

    settings.layout.ensure_base_dirs()?;
    let coordinator = build_coordinator(settings);
    let plan = coordinator.stage_executable(request)?;
    let plan_path = settings.layout.swap_plan_path(&plan.plan_id);

    let helper_pid = if spawn_helper {
        let program = std::env::current_exe().context("failed to resolve hotswap executable")?;
        let args = apply_swap_args(settings, &plan_path);
        Some(spawn_detached(&program, &args, None)?)
    } else {
        None
    };

    if output.json {
        output.print_json(&json!({
            "plan": plan,
            "plan_path": plan_path,
            "helper_pid": helper_pid,
        }))?;
    } else {
        output.print_status(
            "ok",
            &format!("staged {} for {}", plan.staged.display(), plan.live.display()),
        );
        output.print_status("step", &format!("swap plan: {}", plan_path.display()));
        if let Some(pid) = helper_pid {
            output.print_status("step", &format!("apply-swap helper started (pid {pid})"));
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Arguments of the detached `hotswap apply-swap` helper.
pub(crate) fn apply_swap_args(settings: &Settings, plan_path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(config) = &settings.config_path {
        args.push("--config".into());
        args.push(config.into());
    }
    args.push("--state-dir".into());
    args.push(settings.layout.state_dir().into());
    args.push("apply-swap".into());
    args.push("--plan".into());
    args.push(plan_path.into());
    args
}

pub(crate) fn run_apply_swap_command(
    settings: &Settings,
    plan_path: &Path,
    relaunch: bool,
    output: Output,
) -> Result<ExitCode> {
    let plan = load_swap_plan(plan_path)?;
    settings.layout.ensure_base_dirs()?;
    let coordinator = build_coordinator(settings);
    let waiter = ProcessWaiter::new(settings.config.waiter.poll_interval());

    let progress = RunProgress::start(output.progress_style(), "swap");
    let report = match coordinator.complete_swap(
        &plan,
        &waiter,
        settings.config.waiter.timeout(),
        relaunch,
    ) {
        Ok(report) => report,
        Err(err) => {
            progress.abandon();
            return Err(err);
        }
    };
    progress.finish(&report);
    emit_report(&report, output)
}

fn emit_report(report: &UpdateReport, output: Output) -> Result<ExitCode> {
    if output.json {
        println!(
            "{}",
            report_json(report).context("failed to serialize update report")?
        );
    } else {
        if let Some(header) = render_section_header(output.style, report.mode.as_str()) {
            println!("{header}");
        }
        output.print_lines(&format_report_lines(report, output.style));
    }
    Ok(ExitCode::from(report.status().exit_code()))
}

pub(crate) fn run_probe_command(path: &Path, output: Output) -> Result<ExitCode> {
    let status = probe_path(path)?;
    if output.json {
        output.print_json(&json!({ "path": path, "status": status }))?;
    } else {
        let badge = if status.is_locked() { "warn" } else { "ok" };
        output.print_status(badge, &format!("{}: {status}", path.display()));
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_who_command(settings: &Settings, path: &Path, output: Output) -> Result<ExitCode> {
    let identifier = select_identifier(&settings.config.identify);
    let identification = identifier.identify(path);
    if output.json {
        output.print_json(&json!({ "path": path, "identification": identification }))?;
        return Ok(ExitCode::SUCCESS);
    }

    output.print_status("step", &identification.summary());
    for process in &identification.processes {
        println!("  {process}");
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_wait_command(
    settings: &Settings,
    request: WaitRequest,
    output: Output,
) -> Result<ExitCode> {
    let waiter = ProcessWaiter::with_liveness(OsLiveness, settings.config.waiter.poll_interval());
    let timeout = settings.config.waiter.timeout();
    let (subject, done) = match request {
        WaitRequest::Process(identity) => {
            let done = waiter.await_termination(&identity, timeout);
            (identity.to_string(), done)
        }
        WaitRequest::Release(path) => {
            let done = waiter.await_release(&OsLockProbe, &path, timeout);
            (path.display().to_string(), done)
        }
    };

    if output.json {
        output.print_json(&json!({ "subject": subject, "released": done }))?;
    } else if done {
        output.print_status("ok", &format!("{subject} released"));
    } else {
        output.print_status(
            "warn",
            &format!("{subject} still busy after {}s", timeout.as_secs()),
        );
    }
    Ok(if done {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

pub(crate) fn run_cleanup_command(
    settings: &Settings,
    run: Option<String>,
    output: Output,
) -> Result<ExitCode> {
    let coordinator = build_coordinator(settings);
    let run_ids = match run {
        Some(run_id) => {
            if !is_valid_run_id(&run_id) {
                return Err(anyhow!("invalid run id: {run_id}"));
            }
            vec![run_id]
        }
        None => {
            let active = read_active_run(&settings.layout)?;
            list_runs(&settings.layout)?
                .into_iter()
                .map(|run| run.run_id)
                .filter(|run_id| active.as_deref() != Some(run_id.as_str()))
                .collect()
        }
    };

    let mut removed = Vec::new();
    for run_id in &run_ids {
        removed.extend(coordinator.cleanup_run(run_id)?);
    }

    if output.json {
        output.print_json(&json!({ "runs": run_ids, "removed": removed }))?;
    } else if removed.is_empty() {
        output.print_status("ok", "no preserved backups to remove");
    } else {
        for path in &removed {
            output.print_status("ok", &format!("removed {}", path.display()));
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_status_command(settings: &Settings, output: Output) -> Result<ExitCode> {
    let runs = list_runs(&settings.layout)?;
    let active = read_active_run(&settings.layout)?;
    if output.json {
        output.print_json(&json!({ "active": active, "runs": runs }))?;
    } else {
        output.print_lines(&format_run_lines(&runs, active.as_deref()));
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_repair_command(settings: &Settings, output: Output) -> Result<ExitCode> {
    let coordinator = build_coordinator(settings);
    let outcome = coordinator.repair(&OsLiveness)?;
    match (&outcome, output.json) {
        (RepairOutcome::NothingToRepair, true) => {
            output.print_json(&json!({ "repaired": false }))?
        }
        (
            RepairOutcome::ClearedStaleRun {
                run_id,
                preserved_backups,
            },
            true,
        ) => output.print_json(&json!({
            "repaired": true,
            "run_id": run_id,
            "preserved_backups": preserved_backups,
        }))?,
        (RepairOutcome::NothingToRepair, false) => {
            output.print_status("ok", "no stale update run found")
        }
        (
            RepairOutcome::ClearedStaleRun {
                run_id,
                preserved_backups,
            },
            false,
        ) => {
            output.print_status("ok", &format!("cleared stale run {run_id}"));
            if *preserved_backups > 0 {
                output.print_status(
                    "warn",
                    &format!(
                        "{preserved_backups} preserved backup(s) remain; run `hotswap cleanup --run {run_id}` once they are no longer needed"
                    ),
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn wait_target(pid: Option<u32>, name: Option<String>) -> Option<WaitTarget> {
    match (pid, name) {
        (Some(pid), _) => Some(WaitTarget::Pid(pid)),
        (None, Some(name)) => Some(WaitTarget::Name(name)),
        (None, None) => None,
    }
}
