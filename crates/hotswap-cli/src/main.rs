use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

mod command_flows;
mod dispatch;
mod render;

use dispatch::run_cli;
use render::{current_output_style, render_status_line};

#[derive(Parser, Debug)]
#[command(name = "hotswap")]
#[command(about = "Lock-aware file replacement for application self-updates", long_about = None)]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct GlobalOptions {
    /// Config file (default: <prefix>/config.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Emit machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    max_attempts: Option<u32>,
    #[arg(long, global = true)]
    initial_delay_ms: Option<u64>,
    #[arg(long, global = true)]
    backoff_factor: Option<f64>,
    /// Wall-clock limit for process and file waits.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace files listed in a manifest, or every changed file of a payload.
    Merge {
        #[arg(long, required_unless_present = "payload", conflicts_with_all = ["payload", "target"])]
        manifest: Option<PathBuf>,
        #[arg(long, requires = "target")]
        payload: Option<PathBuf>,
        #[arg(long, requires = "payload")]
        target: Option<PathBuf>,
    },
    /// Stage a new executable and hand off to `apply-swap`.
    StageExe {
        #[arg(long = "new")]
        new_executable: PathBuf,
        #[arg(long)]
        live: PathBuf,
        #[arg(long, conflicts_with = "name")]
        pid: Option<u32>,
        #[arg(long)]
        name: Option<String>,
        /// Manifest of files replaced after the executable.
        #[arg(long)]
        companions: Option<PathBuf>,
        /// Only write the swap plan.
        #[arg(long)]
        no_spawn: bool,
        #[arg(last = true)]
        relaunch_args: Vec<String>,
    },
    /// Execute a staged swap plan.
    ApplySwap {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        no_relaunch: bool,
    },
    Probe {
        path: PathBuf,
    },
    /// List processes holding a path open.
    Who {
        path: PathBuf,
    },
    Wait {
        #[arg(long, required_unless_present_any = ["name", "path"], conflicts_with_all = ["name", "path"])]
        pid: Option<u32>,
        #[arg(long, conflicts_with = "path")]
        name: Option<String>,
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Delete backups preserved by earlier runs.
    Cleanup {
        #[arg(long)]
        run: Option<String>,
    },
    Status,
    /// Clear the active-run marker left by a crashed run.
    Repair,
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("HOTSWAP_LOG")
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(current_output_style(), "error", &format!("{err:#}"))
            );
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests;
