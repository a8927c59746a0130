use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use hotswap_core::{
    ErrorKind, OutcomeBuilder, OutcomeResult, ReplaceError, ReplacementUnit, UpdateOutcome,
};
use hotswap_security::FileDigest;

use crate::fs_utils::{list_files_recursive, remove_path_if_exists};
use crate::{FileOps, FsFileOps, RetryExecutor};

/// Backup, install, verify and roll back one [`ReplacementUnit`].
///
/// Every failure becomes an [`UpdateOutcome`]; nothing here panics or
/// propagates an error past the unit boundary.
pub struct StagedReplacer<O = FsFileOps> {
    retry: RetryExecutor,
    ops: O,
}

impl StagedReplacer<FsFileOps> {
    pub fn new(retry: RetryExecutor) -> Self {
        Self::with_ops(retry, FsFileOps)
    }
}

impl<O: FileOps> StagedReplacer<O> {
    pub fn with_ops(retry: RetryExecutor, ops: O) -> Self {
        Self { retry, ops }
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn replace(&self, unit: &ReplacementUnit) -> UpdateOutcome {
        let mut outcome = PendingOutcome::from(UpdateOutcome::builder(unit.clone()));

        let source_metadata = match fs::metadata(&unit.source) {
            Ok(metadata) => metadata,
            Err(err) => {
                outcome.fail("source", ReplaceError::from_io(&unit.source, err));
                return outcome_from(outcome);
            }
        };
        if fs::symlink_metadata(&unit.backup).is_ok() {
            let err = ReplaceError::StaleBackup {
                backup: unit.backup.clone(),
            };
            outcome.fail("backup", err);
            return outcome_from(outcome);
        }

        if source_metadata.is_dir() {
            self.replace_tree(unit, outcome)
        } else {
            self.replace_file(unit, &mut outcome);
            outcome_from(outcome)
        }
    }

    fn replace_file(&self, unit: &ReplacementUnit, outcome: &mut PendingOutcome) {
        let destination = &unit.destination;
        let original = match self.backup_member(destination, &unit.backup) {
            Ok(original) => original,
            Err(err) => {
                outcome.fail("backup", err);
                return;
            }
        };
        if original.is_some() {
            outcome.note(format!(
                "backed up {} to {}",
                destination.display(),
                unit.backup.display()
            ));
        }

        match self.install_member(&unit.source, destination) {
            Ok(()) => outcome.note(format!("installed and verified {}", destination.display())),
            Err(err) => {
                if !self.member_changed(destination, original.as_ref()) {
                    outcome.note("destination left unchanged");
                    outcome.fail("install", err);
                    return;
                }
                let restore = self.restore_member(destination, &unit.backup, original.as_ref());
                outcome.roll_back("install", destination, err, restore);
            }
        }
    }

    fn replace_tree(&self, unit: &ReplacementUnit, mut outcome: PendingOutcome) -> UpdateOutcome {
        let destination = &unit.destination;
        let had_destination = match fs::symlink_metadata(destination) {
            Ok(metadata) if metadata.is_dir() => true,
            Ok(_) => {
                let err = ReplaceError::Io {
                    path: destination.clone(),
                    source: io::Error::other("destination exists and is not a directory"),
                };
                outcome.fail("install", err);
                return outcome_from(outcome);
            }
            Err(_) => false,
        };

        let source_files = match list_files_recursive(&unit.source) {
            Ok(files) => files,
            Err(err) => {
                let err = ReplaceError::Io {
                    path: unit.source.clone(),
                    source: io::Error::other(format!("{err:#}")),
                };
                outcome.fail("source", err);
                return outcome_from(outcome);
            }
        };

        if had_destination {
            if let Err(err) = self.backup_tree(destination, &unit.backup) {
                if let Err(cleanup) = remove_path_if_exists(&unit.backup) {
                    tracing::warn!(backup = %unit.backup.display(), error = %cleanup, "failed to discard partial tree backup");
                }
                outcome.fail("backup", err);
                return outcome_from(outcome);
            }
            outcome.note(format!(
                "backed up tree {} to {}",
                destination.display(),
                unit.backup.display()
            ));
        }

        let mut touched: Vec<TouchedMember> = Vec::new();
        let mut created_dirs: Vec<PathBuf> = Vec::new();
        for rel in &source_files {
            let member = destination.join(rel);
            let backup = unit.backup.join(rel);
            if had_destination {
                record_missing_dirs(destination, &member, &mut created_dirs);
            }
            let original = if had_destination && backup.is_file() {
                self.ops.digest(&backup).ok()
            } else {
                None
            };

            if let Err(err) = self.install_member(&unit.source.join(rel), &member) {
                if self.member_changed(&member, original.as_ref()) {
                    touched.push(TouchedMember {
                        member,
                        backup,
                        original,
                    });
                }
                let restore =
                    self.restore_tree(&touched, &created_dirs, destination, had_destination);
                outcome.roll_back("install", destination, err, restore);
                return outcome_from(outcome);
            }
            touched.push(TouchedMember {
                member,
                backup,
                original,
            });
        }

        outcome.note(format!(
            "merged {} file(s) into {}",
            source_files.len(),
            destination.display()
        ));
        outcome_from(outcome)
    }

    /// Copies `destination` to `backup`, returning the digest of what was
    /// backed up, or `None` when there was nothing to back up.
    fn backup_member(
        &self,
        destination: &Path,
        backup: &Path,
    ) -> Result<Option<FileDigest>, ReplaceError> {
        if fs::symlink_metadata(destination).is_err() {
            return Ok(None);
        }
        self.retry
            .execute(destination, || self.ops.backup_file(destination, backup))?;
        let original = self
            .ops
            .digest(backup)
            .map_err(|err| ReplaceError::from_io(backup, err))?;
        Ok(Some(original))
    }

    fn backup_tree(&self, destination: &Path, backup: &Path) -> Result<(), ReplaceError> {
        let files = list_files_recursive(destination).map_err(|err| ReplaceError::Io {
            path: destination.to_path_buf(),
            source: io::Error::other(format!("{err:#}")),
        })?;
        fs::create_dir_all(backup).map_err(|err| ReplaceError::from_io(backup, err))?;
        for rel in files {
            let member = destination.join(&rel);
            let member_backup = backup.join(&rel);
            self.retry
                .execute(&member, || self.ops.backup_file(&member, &member_backup))?;
        }
        Ok(())
    }

    fn install_member(&self, source: &Path, destination: &Path) -> Result<(), ReplaceError> {
        self.retry
            .execute(destination, || self.ops.install_file(source, destination))?;
        self.verify(source, destination)
    }

    fn verify(&self, source: &Path, destination: &Path) -> Result<(), ReplaceError> {
        let expected = self
            .ops
            .digest(source)
            .map_err(|err| ReplaceError::from_io(source, err))?;
        self.verify_against(destination, &expected)
    }

    fn verify_against(&self, destination: &Path, expected: &FileDigest) -> Result<(), ReplaceError> {
        let actual = self
            .ops
            .digest(destination)
            .map_err(|err| ReplaceError::from_io(destination, err))?;
        match actual.mismatch(expected) {
            Some(detail) => Err(ReplaceError::VerificationFailed {
                path: destination.to_path_buf(),
                detail,
            }),
            None => Ok(()),
        }
    }

    fn member_changed(&self, destination: &Path, original: Option<&FileDigest>) -> bool {
        match (original, self.ops.digest(destination)) {
            (Some(original), Ok(current)) => current.mismatch(original).is_some(),
            (None, Err(err)) => err.kind() != io::ErrorKind::NotFound,
            _ => true,
        }
    }

    /// Puts the pre-run content back, or removes a member that did not
    /// exist before the run.
    fn restore_member(
        &self,
        destination: &Path,
        backup: &Path,
        original: Option<&FileDigest>,
    ) -> Result<(), ReplaceError> {
        match original {
            Some(original) => {
                self.retry
                    .execute(destination, || self.ops.install_file(backup, destination))?;
                self.verify_against(destination, original)
            }
            None => self
                .retry
                .execute(destination, || self.ops.remove_file(destination)),
        }
    }

    fn restore_tree(
        &self,
        touched: &[TouchedMember],
        created_dirs: &[PathBuf],
        destination: &Path,
        had_destination: bool,
    ) -> Result<(), ReplaceError> {
        let mut first_failure = None;
        for member in touched.iter().rev() {
            if let Err(err) =
                self.restore_member(&member.member, &member.backup, member.original.as_ref())
            {
                tracing::error!(path = %member.member.display(), error = %err, "failed to restore tree member");
                first_failure.get_or_insert(err);
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }
        remove_created_dirs(created_dirs)?;
        if !had_destination {
            remove_path_if_exists(destination)
                .map_err(|err| ReplaceError::from_io(destination, err))?;
        }
        Ok(())
    }
}

/// Records the directories between `destination` and `member` that do not
/// exist yet, so a rollback can remove what the install creates.
fn record_missing_dirs(destination: &Path, member: &Path, created: &mut Vec<PathBuf>) {
    let Some(parent) = member.parent() else {
        return;
    };
    for dir in parent.ancestors() {
        if dir == destination || !dir.starts_with(destination) {
            break;
        }
        if fs::symlink_metadata(dir).is_ok() {
            break;
        }
        if !created.iter().any(|known| known == dir) {
            created.push(dir.to_path_buf());
        }
    }
}

/// Deepest first; directories that still hold other entries are an error.
fn remove_created_dirs(created: &[PathBuf]) -> Result<(), ReplaceError> {
    let mut dirs: Vec<&PathBuf> = created.iter().collect();
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        match fs::remove_dir(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(ReplaceError::from_io(dir, err)),
        }
    }
    Ok(())
}

struct TouchedMember {
    member: PathBuf,
    backup: PathBuf,
    original: Option<FileDigest>,
}

/// Outcome under construction plus the terminal result chosen so far.
struct PendingOutcome {
    builder: OutcomeBuilder,
    terminal: Option<(OutcomeResult, ErrorKind)>,
}

impl PendingOutcome {
    fn note(&mut self, message: impl Into<String>) {
        self.builder.note(message);
    }

    fn fail(&mut self, context: &str, err: ReplaceError) {
        self.builder.note_error(context, &err);
        self.terminal = Some((OutcomeResult::Failed, err.kind()));
    }

    fn roll_back(
        &mut self,
        context: &str,
        destination: &Path,
        cause: ReplaceError,
        restore: Result<(), ReplaceError>,
    ) {
        self.builder.note_error(context, &cause);
        match restore {
            Ok(()) => {
                tracing::warn!(path = %destination.display(), error = %cause, "rolled back replacement");
                self.builder
                    .note(format!("rolled back {}", destination.display()));
                self.terminal = Some((OutcomeResult::RolledBack, cause.kind()));
            }
            Err(rollback) => {
                let err = ReplaceError::RollbackFailed {
                    path: destination.to_path_buf(),
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                };
                tracing::error!(path = %destination.display(), error = %err, "rollback failed");
                self.builder.note_error("rollback", &err);
                self.terminal = Some((OutcomeResult::Failed, ErrorKind::RollbackFailed));
            }
        }
    }
}

impl From<OutcomeBuilder> for PendingOutcome {
    fn from(builder: OutcomeBuilder) -> Self {
        Self {
            builder,
            terminal: None,
        }
    }
}

fn outcome_from(outcome: PendingOutcome) -> UpdateOutcome {
    match outcome.terminal {
        Some((result, kind)) => outcome.builder.finish(result, Some(kind)),
        None => outcome.builder.success(),
    }
}
