use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::*;

fn unit(name: &str) -> ReplacementUnit {
    ReplacementUnit::new(
        format!("/payload/{name}"),
        format!("/app/{name}"),
        DEFAULT_BACKUP_SUFFIX,
    )
}

#[test]
fn retry_policy_rejects_zero_attempts_and_shrinking_backoff() {
    assert!(RetryPolicy::new(0, Duration::from_millis(10), 1.0).is_err());
    assert!(RetryPolicy::new(3, Duration::from_millis(10), 0.5).is_err());
    assert!(RetryPolicy::new(3, Duration::from_millis(10), f64::NAN).is_err());
    assert!(RetryPolicy::new(1, Duration::ZERO, 1.0).is_ok());
}

#[test]
fn retry_policy_delays_grow_geometrically() {
    let policy = RetryPolicy::new(3, Duration::from_millis(100), 2.0).expect("valid policy");
    assert_eq!(
        policy.delays(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );
}

#[test]
fn retry_policy_delays_never_shrink() {
    let policy = RetryPolicy::new(12, Duration::from_millis(7), 1.3).expect("valid policy");
    let delays = policy.delays();
    assert_eq!(delays.len(), 12);
    for pair in delays.windows(2) {
        assert!(pair[1] >= pair[0], "{:?} shrank to {:?}", pair[0], pair[1]);
    }
}

#[test]
fn retry_policy_default_is_linear() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.backoff_factor(), 1.0);
    assert!(policy
        .delays()
        .iter()
        .all(|delay| *delay == policy.initial_delay()));
}

#[test]
fn retry_policy_saturates_instead_of_overflowing() {
    let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1), 10.0).expect("valid policy");
    assert_eq!(policy.delay_after_attempt(5_000), Duration::MAX);
}

#[test]
fn backup_path_is_sibling_with_suffix() {
    let unit = ReplacementUnit::new("/new/app.exe", "/opt/app/app.exe", ".bak");
    assert_eq!(unit.backup, PathBuf::from("/opt/app/app.exe.bak"));
    assert_eq!(
        derive_backup_path(Path::new("/opt/app/assets"), DEFAULT_BACKUP_SUFFIX),
        PathBuf::from("/opt/app/assets.hotswap-bak")
    );
}

#[test]
fn identification_unknown_is_not_an_empty_answer() {
    let unknown = Identification::unknown();
    let none = Identification::supported("lsof", Vec::new());
    assert!(unknown.is_unknown());
    assert!(!none.is_unknown());
    assert_ne!(unknown, none);
    assert_eq!(none.source(), Some("lsof"));
    assert_eq!(unknown.summary(), "locking process: unknown");
}

#[test]
fn identification_drops_duplicate_pids() {
    let identification = Identification::supported(
        "handle",
        vec![
            LockingProcess::new("editor.exe", 10),
            LockingProcess::new("editor.exe", 10),
            LockingProcess::new("av.exe", 11),
        ],
    );
    assert_eq!(identification.processes.len(), 2);
    assert_eq!(
        identification.summary(),
        "locked by editor.exe (pid 10), av.exe (pid 11)"
    );
}

#[test]
fn replace_error_maps_io_kinds_without_retry_classification() {
    let path = Path::new("/app/file");
    let not_found = ReplaceError::from_io(path, io::Error::from(io::ErrorKind::NotFound));
    let denied = ReplaceError::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
    let other = ReplaceError::from_io(path, io::Error::other("disk on fire"));

    assert_eq!(not_found.kind(), ErrorKind::NotFound);
    assert_eq!(denied.kind(), ErrorKind::PermissionDenied);
    assert_eq!(other.kind(), ErrorKind::Io);
    assert_eq!(other.path(), path);
}

#[test]
fn rollback_failed_surfaces_lockers_of_wrapped_error() {
    let lockers = Identification::supported("lsof", vec![LockingProcess::new("app", 42)]);
    let err = ReplaceError::RollbackFailed {
        path: PathBuf::from("/app/file"),
        cause: Box::new(ReplaceError::VerificationFailed {
            path: PathBuf::from("/app/file"),
            detail: "size mismatch".to_string(),
        }),
        rollback: Box::new(ReplaceError::LockTimeout {
            path: PathBuf::from("/app/file"),
            attempts: 3,
            last_status: LockStatus::Locked,
            lockers: lockers.clone(),
        }),
    };

    assert_eq!(err.kind(), ErrorKind::RollbackFailed);
    assert_eq!(err.lockers(), Some(&lockers));
    assert!(err.to_string().contains("rollback also failed"));
}

#[test]
fn outcome_builder_attaches_locking_processes() {
    let mut builder = UpdateOutcome::builder(unit("a.txt"));
    builder.note("backup created");
    builder.note_error(
        "install",
        &ReplaceError::LockTimeout {
            path: PathBuf::from("/app/a.txt"),
            attempts: 3,
            last_status: LockStatus::Locked,
            lockers: Identification::supported(
                "lsof",
                vec![LockingProcess::new("viewer", 7)],
            ),
        },
    );
    let outcome = builder.finish(OutcomeResult::Failed, Some(ErrorKind::LockTimeout));

    assert_eq!(outcome.result(), OutcomeResult::Failed);
    assert_eq!(outcome.diagnostics().len(), 2);
    assert_eq!(outcome.locking_processes().len(), 1);
    assert_eq!(outcome.locking_processes()[0].pid, 7);
    assert!(outcome.diagnostics()[1].message.contains("locked by viewer (pid 7)"));
}

#[test]
fn outcome_serializes_as_structured_data() {
    let mut builder = UpdateOutcome::builder(unit("b.txt"));
    builder.note("verified");
    let outcome = builder.success();

    let value = serde_json::to_value(&outcome).expect("outcome must serialize");
    assert_eq!(value["result"], "success");
    assert_eq!(value["unit"]["destination"], "/app/b.txt");
    assert_eq!(value["unit"]["backup"], "/app/b.txt.hotswap-bak");
    assert!(value.get("error").is_none());
    assert_eq!(value["diagnostics"][0]["message"], "verified");
}

#[test]
fn report_status_distinguishes_partial_and_fatal() {
    let mut report = UpdateReport::new("run-1", UpdateMode::Merge);
    assert_eq!(report.status(), RunStatus::Succeeded);

    report.outcomes.push(UpdateOutcome::builder(unit("a")).success());
    report.outcomes.push(
        UpdateOutcome::builder(unit("b")).finish(OutcomeResult::Failed, Some(ErrorKind::LockTimeout)),
    );
    report.outcomes.push(UpdateOutcome::builder(unit("c")).success());
    assert_eq!(report.status(), RunStatus::PartialSuccess);
    assert_eq!(report.status().exit_code(), 2);
    assert_eq!((report.succeeded(), report.failed()), (2, 1));

    report.fatal = Some("swap aborted".to_string());
    assert_eq!(report.status(), RunStatus::Fatal);
    assert_eq!(report.status().exit_code(), 1);
}

#[test]
fn report_with_no_successful_unit_is_fatal() {
    let mut report = UpdateReport::new("run-2", UpdateMode::Merge);
    report.outcomes.push(
        UpdateOutcome::builder(unit("a"))
            .finish(OutcomeResult::RolledBack, Some(ErrorKind::VerificationFailed)),
    );
    assert_eq!(report.status(), RunStatus::Fatal);
}

#[test]
fn parse_manifest_entries() {
    let manifest = UpdateManifest::from_toml_str(
        r#"
[[entry]]
source = "/payload/src/main.py"
destination = "/app/src/main.py"

[[entry]]
source = "/payload/assets"
destination = "/app/assets"
"#,
    )
    .expect("manifest should parse");

    assert_eq!(manifest.entries.len(), 2);
    manifest
        .validate(DEFAULT_BACKUP_SUFFIX)
        .expect("manifest should validate");
    let units = manifest.units(".old");
    assert_eq!(units[1].backup, PathBuf::from("/app/assets.old"));
}

#[test]
fn manifest_rejects_duplicate_destinations() {
    let manifest = UpdateManifest {
        entries: vec![
            ManifestEntry {
                source: PathBuf::from("/payload/a"),
                destination: PathBuf::from("/app/a"),
            },
            ManifestEntry {
                source: PathBuf::from("/payload/b"),
                destination: PathBuf::from("/app/a"),
            },
        ],
    };
    let err = manifest
        .validate(DEFAULT_BACKUP_SUFFIX)
        .expect_err("duplicates must be rejected");
    assert!(err.to_string().contains("duplicate manifest destination"));
}

#[test]
fn manifest_rejects_destination_that_is_another_backup() {
    let manifest = UpdateManifest {
        entries: vec![
            ManifestEntry {
                source: PathBuf::from("/payload/a"),
                destination: PathBuf::from("/app/a"),
            },
            ManifestEntry {
                source: PathBuf::from("/payload/a.bak"),
                destination: PathBuf::from("/app/a.bak"),
            },
        ],
    };
    assert!(manifest.validate(".bak").is_err());
    assert!(manifest.validate(DEFAULT_BACKUP_SUFFIX).is_ok());
}

#[test]
fn manifest_resolves_relative_paths_against_base() {
    let mut manifest = UpdateManifest::from_toml_str(
        "[[entry]]\nsource = \"payload/a\"\ndestination = \"/app/a\"\n",
    )
    .expect("manifest should parse");
    manifest.resolve_relative(Path::new("/staging"));
    assert_eq!(manifest.entries[0].source, PathBuf::from("/staging/payload/a"));
    assert_eq!(manifest.entries[0].destination, PathBuf::from("/app/a"));
}

#[test]
fn config_defaults_when_sections_missing() {
    let config = HotswapConfig::from_toml_str("").expect("empty config is valid");
    assert_eq!(config, HotswapConfig::default());
    assert_eq!(config.backup_suffix, DEFAULT_BACKUP_SUFFIX);
    assert_eq!(config.retry_policy().expect("policy"), RetryPolicy::default());
    assert_eq!(config.waiter.timeout(), Duration::from_secs(30));
    assert!(config.identify.enabled);
}

#[test]
fn config_reads_retry_and_waiter_sections() {
    let config = HotswapConfig::from_toml_str(
        r#"
backup_suffix = ".old"

[retry]
max_attempts = 3
initial_delay_ms = 100
backoff_factor = 2.0

[waiter]
poll_interval_ms = 250
timeout_secs = 5

[identify]
enabled = false
"#,
    )
    .expect("config should parse");

    let policy = config.retry_policy().expect("policy");
    assert_eq!(policy.max_attempts(), 3);
    assert_eq!(policy.initial_delay(), Duration::from_millis(100));
    assert_eq!(config.waiter.poll_interval(), Duration::from_millis(250));
    assert!(!config.identify.enabled);
    assert_eq!(config.backup_suffix, ".old");
}

#[test]
fn config_rejects_invalid_values() {
    assert!(HotswapConfig::from_toml_str("backup_suffix = \"\"\n").is_err());
    assert!(HotswapConfig::from_toml_str("backup_suffix = \"/x\"\n").is_err());
    assert!(HotswapConfig::from_toml_str("[retry]\nmax_attempts = 0\n").is_err());
    assert!(HotswapConfig::from_toml_str("[waiter]\npoll_interval_ms = 0\n").is_err());
}
