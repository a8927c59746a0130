use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hotswap_core::{
    ErrorKind, OutcomeResult, ReplacementUnit, RunStatus, UpdateMode, UpdateOutcome, UpdateReport,
};
use hotswap_probe::{LivenessProbe, ProcessIdentity, ProcessWaiter};
use hotswap_security::file_digest;

use crate::fs_utils::remove_path_if_exists;
use crate::launch::relaunch;
use crate::transactions::{
    append_run_journal_entry, clear_active_run, current_unix_timestamp, new_run_id,
    read_active_run, read_run_journal, read_run_metadata, run_owner_pid, set_active_run,
    update_run_status, write_run_metadata,
};
use crate::{
    FileOps, FsFileOps, RunJournalEntry, RunMetadata, RunState, StagedReplacer, StateLayout,
    SwapPlan, WaitTarget, RUN_METADATA_VERSION,
};

/// Inputs of [`UpdateCoordinator::stage_executable`].
#[derive(Debug, Clone, Default)]
pub struct StageRequest {
    pub new_executable: PathBuf,
    pub live: PathBuf,
    pub wait_for: Option<WaitTarget>,
    pub companions: Vec<ReplacementUnit>,
    pub relaunch_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    NothingToRepair,
    ClearedStaleRun { run_id: String, preserved_backups: usize },
}

/// Drives whole update runs: one journaled run per merge or swap.
pub struct UpdateCoordinator<O = FsFileOps> {
    layout: StateLayout,
    replacer: StagedReplacer<O>,
    backup_suffix: String,
}

impl<O: FileOps> UpdateCoordinator<O> {
    pub fn new(
        layout: StateLayout,
        replacer: StagedReplacer<O>,
        backup_suffix: impl Into<String>,
    ) -> Self {
        Self {
            layout,
            replacer,
            backup_suffix: backup_suffix.into(),
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn replacer(&self) -> &StagedReplacer<O> {
        &self.replacer
    }

    /// Replaces every unit in order. A failed unit is reported and the run
    /// moves on to the next one.
    pub fn merge(&self, units: &[ReplacementUnit], unchanged: usize) -> Result<UpdateReport> {
        let mut run = self.begin_run(UpdateMode::Merge)?;
        let mut report = UpdateReport::new(&run.run_id, UpdateMode::Merge);
        report.unchanged = unchanged;

        let result = (|| -> Result<()> {
            for unit in units {
                let outcome = self.replace_unit(&mut run, unit)?;
                report.outcomes.push(outcome);
            }
            self.cleanup_successful(&mut run, &report)?;
            run.record(&self.layout, "merge_complete", "done", None)?;
            Ok(())
        })();

        self.finish_run(&run, &report, result)?;
        Ok(report)
    }

    /// Copies the new executable into staging and writes the swap plan that
    /// `complete_swap` executes once the running instance has exited.
    pub fn stage_executable(&self, request: StageRequest) -> Result<SwapPlan> {
        let file_name = request
            .live
            .file_name()
            .ok_or_else(|| anyhow!("live executable path has no file name: {}", request.live.display()))?;
        if !request.new_executable.is_file() {
            return Err(anyhow!(
                "new executable not found: {}",
                request.new_executable.display()
            ));
        }

        let plan_id = new_run_id();
        let staging_dir = self.layout.run_staging_path(&plan_id);
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("failed to create {}", staging_dir.display()))?;

        let staged = staging_dir.join(file_name);
        fs::copy(&request.new_executable, &staged).with_context(|| {
            format!(
                "failed to stage {} at {}",
                request.new_executable.display(),
                staged.display()
            )
        })?;
        let expected = file_digest(&request.new_executable)
            .with_context(|| format!("failed to hash {}", request.new_executable.display()))?;
        let actual = file_digest(&staged)
            .with_context(|| format!("failed to hash {}", staged.display()))?;
        if let Some(detail) = actual.mismatch(&expected) {
            return Err(anyhow!(
                "staged executable {} does not match its source: {detail}",
                staged.display()
            ));
        }

        let plan = SwapPlan {
            plan_id,
            staged,
            live: request.live,
            wait_for: request.wait_for,
            companions: request.companions,
            relaunch_args: request.relaunch_args,
        };
        write_swap_plan(&self.layout, &plan)?;
        tracing::info!(plan = %plan.plan_id, live = %plan.live.display(), "staged executable swap");
        Ok(plan)
    }

    /// Waits for the running instance, swaps the executable, merges the
    /// companions and optionally relaunches.
    ///
    /// A failed swap aborts the run before companions are touched, so the
    /// previous executable stays runnable.
    pub fn complete_swap<L: LivenessProbe>(
        &self,
        plan: &SwapPlan,
        waiter: &ProcessWaiter<L>,
        timeout: Duration,
        relaunch_after: bool,
    ) -> Result<UpdateReport> {
        let mut run = self.begin_run(UpdateMode::ExecutableSwap)?;
        let mut report = UpdateReport::new(&run.run_id, UpdateMode::ExecutableSwap);
        let swap_unit = ReplacementUnit::new(&plan.staged, &plan.live, &self.backup_suffix);

        let result = (|| -> Result<()> {
            if !self.wait_for_release(&mut run, plan, waiter, timeout)? {
                let identity = plan
                    .wait_for
                    .as_ref()
                    .map(wait_target_identity)
                    .map(|identity| identity.to_string())
                    .unwrap_or_else(|| plan.live.display().to_string());
                let mut outcome = UpdateOutcome::builder(swap_unit.clone());
                outcome.note(format!(
                    "{identity} still running after {}s; live executable left untouched",
                    timeout.as_secs()
                ));
                report.outcomes.push(outcome.finish(OutcomeResult::Failed, None));
                report.fatal = Some(format!("timed out waiting for {identity} to exit"));
                return Ok(());
            }

            let outcome = self.replace_unit(&mut run, &swap_unit)?;
            let swapped = outcome.is_success();
            report.outcomes.push(outcome);
            if !swapped {
                report.fatal = Some(format!(
                    "executable swap failed; {} was kept",
                    plan.live.display()
                ));
                return Ok(());
            }

            for companion in &plan.companions {
                let outcome = self.replace_unit(&mut run, companion)?;
                report.outcomes.push(outcome);
            }
            self.cleanup_successful(&mut run, &report)?;

            let staging_dir = self.layout.run_staging_path(&plan.plan_id);
            if let Err(err) = remove_path_if_exists(&staging_dir) {
                tracing::warn!(path = %staging_dir.display(), error = %err, "failed to remove swap staging dir");
            }

            if relaunch_after {
                match relaunch(&plan.live, &plan.relaunch_args) {
                    Ok(pid) => {
                        report.relaunched_pid = Some(pid);
                        run.record(&self.layout, "relaunch", "done", Some(&plan.live))?;
                    }
                    Err(err) => {
                        tracing::error!(error = %format!("{err:#}"), "relaunch failed");
                        run.record(&self.layout, "relaunch", "failed", Some(&plan.live))?;
                    }
                }
            }
            run.record(&self.layout, "swap_complete", "done", None)?;
            Ok(())
        })();

        self.finish_run(&run, &report, result)?;
        Ok(report)
    }

    /// Removes the backups of every successful unit in `report`.
    pub fn cleanup(&self, report: &UpdateReport) -> Result<Vec<PathBuf>> {
        let mut run = RunJournal::open(&self.layout, &report.run_id)?;
        self.cleanup_successful(&mut run, report)
    }

    /// Deletes backups a previous run preserved. Returns the removed paths.
    pub fn cleanup_run(&self, run_id: &str) -> Result<Vec<PathBuf>> {
        if read_active_run(&self.layout)?.as_deref() == Some(run_id) {
            return Err(anyhow!("run {run_id} is still active; cannot clean it up"));
        }

        let preserved = preserved_backups(&self.layout, run_id)?;
        let mut run = RunJournal::open(&self.layout, run_id)?;
        let mut removed = Vec::new();
        for backup in preserved {
            if fs::symlink_metadata(&backup).is_err() {
                continue;
            }
            remove_path_if_exists(&backup)
                .with_context(|| format!("failed to remove backup {}", backup.display()))?;
            run.record(&self.layout, "cleanup", "done", Some(&backup))?;
            removed.push(backup);
        }
        Ok(removed)
    }

    /// Clears the active-run marker of a run whose owner process is gone.
    pub fn repair<L: LivenessProbe>(&self, liveness: &L) -> Result<RepairOutcome> {
        let Some(run_id) = read_active_run(&self.layout)? else {
            return Ok(RepairOutcome::NothingToRepair);
        };

        let metadata = read_run_metadata(&self.layout, &run_id)?;
        let owner = metadata
            .as_ref()
            .map(|metadata| metadata.owner_pid)
            .or_else(|| run_owner_pid(&run_id));
        if let Some(pid) = owner {
            let alive = liveness
                .is_running(&ProcessIdentity::Pid(pid))
                .with_context(|| format!("failed to check owner of run {run_id}"))?;
            if alive {
                return Err(anyhow!(
                    "run {run_id} is still owned by running process {pid}"
                ));
            }
        }

        if metadata.is_some_and(|metadata| !metadata.status.is_terminal()) {
            update_run_status(&self.layout, &run_id, RunState::Failed)?;
        }
        clear_active_run(&self.layout)?;
        let preserved = preserved_backups(&self.layout, &run_id)?
            .into_iter()
            .filter(|backup| fs::symlink_metadata(backup).is_ok())
            .count();
        tracing::info!(run = %run_id, preserved, "cleared stale run marker");
        Ok(RepairOutcome::ClearedStaleRun {
            run_id,
            preserved_backups: preserved,
        })
    }

    fn begin_run(&self, mode: UpdateMode) -> Result<RunJournal> {
        let run_id = new_run_id();
        let metadata = RunMetadata {
            version: RUN_METADATA_VERSION,
            run_id: run_id.clone(),
            mode,
            status: RunState::Applying,
            started_at_unix: current_unix_timestamp()?,
            owner_pid: std::process::id(),
        };

        write_run_metadata(&self.layout, &metadata)?;
        if let Err(err) = set_active_run(&self.layout, &run_id) {
            let _ = remove_path_if_exists(&self.layout.run_metadata_path(&run_id));
            return Err(err);
        }
        tracing::debug!(run = %run_id, mode = mode.as_str(), "started update run");
        Ok(RunJournal { run_id, next_seq: 1 })
    }

    fn finish_run(&self, run: &RunJournal, report: &UpdateReport, result: Result<()>) -> Result<()> {
        let status = match (&result, report.status()) {
            (Err(_), _) => RunState::Failed,
            (Ok(()), RunStatus::Succeeded) => RunState::Committed,
            (Ok(()), RunStatus::PartialSuccess) => RunState::Partial,
            (Ok(()), RunStatus::Fatal) => RunState::Failed,
        };
        let recorded = update_run_status(&self.layout, &run.run_id, status);
        clear_active_run(&self.layout)?;
        result?;
        recorded?;
        tracing::info!(
            run = %run.run_id,
            status = status.as_str(),
            succeeded = report.succeeded(),
            rolled_back = report.rolled_back(),
            failed = report.failed(),
            "finished update run"
        );
        Ok(())
    }

    fn replace_unit(&self, run: &mut RunJournal, unit: &ReplacementUnit) -> Result<UpdateOutcome> {
        run.record(&self.layout, "replace", "started", Some(&unit.destination))?;
        let outcome = self.replacer.replace(unit);
        run.record(
            &self.layout,
            "replace",
            outcome.result().as_str(),
            Some(&unit.destination),
        )?;

        let keeps_backup = !outcome.is_success()
            && outcome.error() != Some(ErrorKind::StaleBackup)
            && fs::symlink_metadata(&unit.backup).is_ok();
        if keeps_backup {
            run.record(&self.layout, "backup", "preserved", Some(&unit.backup))?;
        }
        Ok(outcome)
    }

    fn cleanup_successful(&self, run: &mut RunJournal, report: &UpdateReport) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for outcome in report.outcomes.iter().filter(|outcome| outcome.is_success()) {
            let backup = &outcome.unit().backup;
            if fs::symlink_metadata(backup).is_err() {
                continue;
            }
            match remove_path_if_exists(backup) {
                Ok(()) => {
                    run.record(&self.layout, "cleanup", "done", Some(backup))?;
                    removed.push(backup.clone());
                }
                Err(err) => {
                    tracing::warn!(backup = %backup.display(), error = %err, "failed to remove backup");
                    run.record(&self.layout, "backup", "preserved", Some(backup))?;
                }
            }
        }
        Ok(removed)
    }

    fn wait_for_release<L: LivenessProbe>(
        &self,
        run: &mut RunJournal,
        plan: &SwapPlan,
        waiter: &ProcessWaiter<L>,
        timeout: Duration,
    ) -> Result<bool> {
        let Some(target) = &plan.wait_for else {
            // no process named: fall back to waiting for the file itself
            if !waiter.await_release(self.replacer.retry().probe(), &plan.live, timeout) {
                tracing::warn!(live = %plan.live.display(), "live executable may still be in use; relying on retries");
            }
            return Ok(true);
        };

        let identity = wait_target_identity(target);
        run.record(&self.layout, "wait", "started", None)?;
        if waiter.await_termination(&identity, timeout) {
            run.record(&self.layout, "wait", "done", None)?;
            return Ok(true);
        }
        run.record(&self.layout, "wait", "timeout", None)?;
        Ok(false)
    }
}

pub fn wait_target_identity(target: &WaitTarget) -> ProcessIdentity {
    match target {
        WaitTarget::Pid(pid) => ProcessIdentity::Pid(*pid),
        WaitTarget::Name(name) => ProcessIdentity::Name(name.clone()),
    }
}

pub fn write_swap_plan(layout: &StateLayout, plan: &SwapPlan) -> Result<PathBuf> {
    let path = layout.swap_plan_path(&plan.plan_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(plan)
        .with_context(|| format!("failed to serialize swap plan {}", plan.plan_id))?;
    fs::write(&path, raw)
        .with_context(|| format!("failed to write swap plan: {}", path.display()))?;
    Ok(path)
}

pub fn load_swap_plan(path: &Path) -> Result<SwapPlan> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read swap plan: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing swap plan: {}", path.display()))
}

/// Backups a run's journal marks as preserved, deduplicated, in order.
pub fn preserved_backups(layout: &StateLayout, run_id: &str) -> Result<Vec<PathBuf>> {
    let mut backups: Vec<PathBuf> = Vec::new();
    for entry in read_run_journal(layout, run_id)? {
        if entry.step != "backup" || entry.state != "preserved" {
            continue;
        }
        let Some(path) = entry.path else {
            continue;
        };
        let path = PathBuf::from(path);
        if !backups.contains(&path) {
            backups.push(path);
        }
    }
    Ok(backups)
}

struct RunJournal {
    run_id: String,
    next_seq: u64,
}

impl RunJournal {
    fn open(layout: &StateLayout, run_id: &str) -> Result<Self> {
        let next_seq = read_run_journal(layout, run_id)?
            .iter()
            .map(|entry| entry.seq)
            .max()
            .unwrap_or(0)
            + 1;
        Ok(Self {
            run_id: run_id.to_string(),
            next_seq,
        })
    }

    fn record(
        &mut self,
        layout: &StateLayout,
        step: &str,
        state: &str,
        path: Option<&Path>,
    ) -> Result<()> {
        append_run_journal_entry(
            layout,
            &self.run_id,
            &RunJournalEntry {
                seq: self.next_seq,
                step: step.to_string(),
                state: state.to_string(),
                path: path.map(|path| path.display().to_string()),
            },
        )?;
        self.next_seq += 1;
        Ok(())
    }
}
