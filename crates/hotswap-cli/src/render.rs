use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use hotswap_core::{OutcomeResult, RunStatus, UpdateOutcome, UpdateReport};
use hotswap_installer::RunMetadata;
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use serde::Serialize;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    if std::env::var_os("NO_COLOR").is_some() || !std::io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "error" => "[ERROR]",
        _ => "[..]",
    }
}

/// Spinner shown while a run is in progress; absent in plain mode.
pub(crate) struct RunProgress {
    style: OutputStyle,
    label: String,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

impl RunProgress {
    pub(crate) fn start(style: OutputStyle, label: &str) -> Self {
        let progress_bar = if style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(spinner) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed_precise}") {
                progress_bar.set_style(spinner.tick_chars(progress_tick_chars(label)));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        Self {
            style,
            label: label.to_string(),
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn finish(mut self, report: &UpdateReport) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            report.succeeded() as u64,
            report.outcomes.len() as u64,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "merge" => ".oO@* ",
        "swap" => "<^>v ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}

/// Per-file lines of a report, followed by the summary.
pub(crate) fn format_report_lines(report: &UpdateReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    for outcome in &report.outcomes {
        lines.push(render_status_line(
            style,
            outcome_status(outcome.result()),
            &outcome_headline(outcome),
        ));
        if outcome.is_success() {
            continue;
        }
        for diagnostic in outcome.diagnostics() {
            lines.push(format!("  {}", diagnostic.message));
        }
        let lockers = outcome.locking_processes();
        if !lockers.is_empty() {
            let names = lockers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("  close to continue: {names}"));
        }
    }

    if let Some(fatal) = &report.fatal {
        lines.push(render_status_line(style, "error", fatal));
    }
    if let Some(pid) = report.relaunched_pid {
        lines.push(render_status_line(style, "step", &format!("relaunched (pid {pid})")));
    }

    let status = report.status();
    lines.push(render_status_line(
        style,
        run_status_badge(status),
        &format!(
            "{}: {} succeeded, {} rolled back, {} failed, {} unchanged (run {})",
            status.as_str(),
            report.succeeded(),
            report.rolled_back(),
            report.failed(),
            report.unchanged,
            report.run_id
        ),
    ));
    lines
}

fn outcome_status(result: OutcomeResult) -> &'static str {
    match result {
        OutcomeResult::Success => "ok",
        OutcomeResult::RolledBack => "warn",
        OutcomeResult::Failed => "error",
    }
}

fn outcome_headline(outcome: &UpdateOutcome) -> String {
    let destination = outcome.unit().destination.display();
    let reason = outcome
        .error()
        .map(|kind| format!(" ({})", kind.as_str()))
        .unwrap_or_default();
    match outcome.result() {
        OutcomeResult::Success => format!("replaced {destination}"),
        OutcomeResult::RolledBack => format!("rolled back {destination}{reason}"),
        OutcomeResult::Failed => format!("failed {destination}{reason}"),
    }
}

fn run_status_badge(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Succeeded => "ok",
        RunStatus::PartialSuccess => "warn",
        RunStatus::Fatal => "error",
    }
}

pub(crate) fn format_run_lines(runs: &[RunMetadata], active: Option<&str>) -> Vec<String> {
    if runs.is_empty() {
        return vec!["no update runs recorded".to_string()];
    }
    runs.iter()
        .map(|run| {
            let marker = if active == Some(run.run_id.as_str()) {
                " [active]"
            } else {
                ""
            };
            format!(
                "{} {} {} started_at={} owner_pid={}{marker}",
                run.run_id,
                run.mode.as_str(),
                run.status.as_str(),
                run.started_at_unix,
                run.owner_pid
            )
        })
        .collect()
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    status: RunStatus,
    exit_code: u8,
    #[serde(flatten)]
    report: &'a UpdateReport,
}

pub(crate) fn report_json(report: &UpdateReport) -> serde_json::Result<String> {
    let status = report.status();
    serde_json::to_string_pretty(&ReportDocument {
        status,
        exit_code: status.exit_code(),
        report,
    })
}
