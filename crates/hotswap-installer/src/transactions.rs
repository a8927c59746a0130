use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{RunJournalEntry, RunMetadata, RunState, StateLayout};

/// Claims the state directory for `run_id`. Fails when another run holds it.
pub fn set_active_run(layout: &StateLayout, run_id: &str) -> Result<PathBuf> {
    let path = layout.active_run_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let existing = read_active_run(layout).ok().flatten();
            let detail = existing
                .map(|existing_run| format!(" (run={existing_run})"))
                .unwrap_or_default();
            return Err(anyhow!(
                "another update run is active{detail}; run `hotswap repair` if it is stale"
            ));
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to claim active run marker: {}", path.display())
            });
        }
    };

    file.write_all(format!("{run_id}\n").as_bytes())
        .with_context(|| format!("failed to write active run marker: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush active run marker: {}", path.display()))?;
    Ok(path)
}

pub fn read_active_run(layout: &StateLayout) -> Result<Option<String>> {
    let path = layout.active_run_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read active run marker: {}", path.display())
            });
        }
    };

    let run_id = raw.trim();
    if run_id.is_empty() {
        return Ok(None);
    }
    Ok(Some(run_id.to_string()))
}

pub fn clear_active_run(layout: &StateLayout) -> Result<()> {
    let path = layout.active_run_path();
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to clear active run marker: {}", path.display()))?;
    }
    Ok(())
}

pub fn write_run_metadata(layout: &StateLayout, metadata: &RunMetadata) -> Result<PathBuf> {
    let path = layout.run_metadata_path(&metadata.run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut raw = serde_json::to_string_pretty(metadata)
        .with_context(|| format!("failed to serialize run metadata for {}", metadata.run_id))?;
    raw.push('\n');
    fs::write(&path, raw)
        .with_context(|| format!("failed to write run metadata file: {}", path.display()))?;
    Ok(path)
}

pub fn read_run_metadata(layout: &StateLayout, run_id: &str) -> Result<Option<RunMetadata>> {
    let path = layout.run_metadata_path(run_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read run metadata file: {}", path.display())
            });
        }
    };

    let metadata = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing run metadata file: {}", path.display()))?;
    Ok(Some(metadata))
}

pub fn update_run_status(layout: &StateLayout, run_id: &str, status: RunState) -> Result<()> {
    let mut metadata = read_run_metadata(layout, run_id)?
        .ok_or_else(|| anyhow!("run metadata not found for '{run_id}'"))?;
    metadata.status = status;
    write_run_metadata(layout, &metadata)?;
    Ok(())
}

/// Every recorded run, oldest first.
pub fn list_runs(layout: &StateLayout) -> Result<Vec<RunMetadata>> {
    let dir = layout.runs_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Some(run_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Some(metadata) = read_run_metadata(layout, run_id)? {
            runs.push(metadata);
        }
    }
    runs.sort_by(|left, right| {
        left.started_at_unix
            .cmp(&right.started_at_unix)
            .then_with(|| left.run_id.cmp(&right.run_id))
    });
    Ok(runs)
}

pub fn append_run_journal_entry(
    layout: &StateLayout,
    run_id: &str,
    entry: &RunJournalEntry,
) -> Result<PathBuf> {
    let path = layout.run_journal_path(run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let line = serde_json::to_string(entry)
        .with_context(|| format!("failed to serialize journal entry for {run_id}"))?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open run journal: {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append run journal: {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("failed to append run journal newline: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush run journal: {}", path.display()))?;
    Ok(path)
}

pub fn read_run_journal(layout: &StateLayout, run_id: &str) -> Result<Vec<RunJournalEntry>> {
    let path = layout.run_journal_path(run_id);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read run journal: {}", path.display()));
        }
    };

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line).with_context(|| {
                format!(
                    "failed parsing run journal line {} in {}",
                    index + 1,
                    path.display()
                )
            })
        })
        .collect()
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// `run-<unix millis>-<pid>`; the trailing pid identifies the owner process.
pub fn new_run_id() -> String {
    format!(
        "run-{}-{}",
        hotswap_core::current_unix_millis(),
        std::process::id()
    )
}

pub fn run_owner_pid(run_id: &str) -> Option<u32> {
    run_id.rsplit('-').next()?.parse().ok()
}

pub fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id.starts_with("run-")
        && run_id.len() <= 128
        && run_id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}
