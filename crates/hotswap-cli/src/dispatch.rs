use std::process::ExitCode;

use anyhow::Result;
use hotswap_installer::StageRequest;
use hotswap_probe::ProcessIdentity;

use crate::command_flows::{
    resolve_settings, run_apply_swap_command, run_cleanup_command, run_merge_command,
    run_probe_command, run_repair_command, run_stage_exe_command, run_status_command,
    run_wait_command, run_who_command, wait_target, MergeSource, Output, Settings, WaitRequest,
};
use crate::render::current_output_style;
use crate::{Cli, Commands};

pub(crate) fn run_cli(cli: Cli) -> Result<ExitCode> {
    let Cli { options, command } = cli;
    let output = Output {
        style: current_output_style(),
        json: options.json,
    };

    let settings = || -> Result<Settings> {
        let settings = resolve_settings(&options)?;
        tracing::debug!(
            state_dir = %settings.layout.state_dir().display(),
            max_attempts = settings.policy.max_attempts(),
            "resolved settings"
        );
        Ok(settings)
    };

    match command {
        Commands::Merge {
            manifest,
            payload,
            target,
        } => {
            let source = match (manifest, payload, target) {
                (Some(manifest), _, _) => MergeSource::Manifest(manifest),
                (None, Some(payload), Some(target)) => MergeSource::Payload { payload, target },
                _ => anyhow::bail!("merge requires --manifest or --payload with --target"),
            };
            run_merge_command(&settings()?, source, output)
        }
        Commands::StageExe {
            new_executable,
            live,
            pid,
            name,
            companions,
            no_spawn,
            relaunch_args,
        } => {
            let request = StageRequest {
                new_executable,
                live,
                wait_for: wait_target(pid, name),
                companions: Vec::new(),
                relaunch_args,
            };
            run_stage_exe_command(&settings()?, request, companions, !no_spawn, output)
        }
        Commands::ApplySwap { plan, no_relaunch } => {
            run_apply_swap_command(&settings()?, &plan, !no_relaunch, output)
        }
        Commands::Probe { path } => run_probe_command(&path, output),
        Commands::Who { path } => run_who_command(&settings()?, &path, output),
        Commands::Wait { pid, name, path } => {
            let request = match (pid, name, path) {
                (Some(pid), _, _) => WaitRequest::Process(ProcessIdentity::Pid(pid)),
                (None, Some(name), _) => WaitRequest::Process(ProcessIdentity::Name(name)),
                (None, None, Some(path)) => WaitRequest::Release(path),
                (None, None, None) => anyhow::bail!("wait requires --pid, --name or --path"),
            };
            run_wait_command(&settings()?, request, output)
        }
        Commands::Cleanup { run } => run_cleanup_command(&settings()?, run, output),
        Commands::Status => run_status_command(&settings()?, output),
        Commands::Repair => run_repair_command(&settings()?, output),
    }
}
