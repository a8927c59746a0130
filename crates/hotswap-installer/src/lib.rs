mod coordinator;
mod fs_utils;
mod launch;
mod layout;
mod ops;
mod payload;
mod replacer;
mod retry;
mod transactions;
mod types;

pub use coordinator::{
    load_swap_plan, preserved_backups, wait_target_identity, write_swap_plan, RepairOutcome,
    StageRequest, UpdateCoordinator,
};
pub use fs_utils::{list_files_recursive, remove_file_if_exists, remove_path_if_exists};
pub use launch::{relaunch, spawn_detached};
pub use layout::{default_user_prefix, StateLayout};
pub use ops::{FileOps, FsFileOps};
pub use payload::{detect_payload_root, scan_changed_files, PayloadScan};
pub use replacer::StagedReplacer;
pub use retry::{FailureClass, RetryExecutor, Sleeper};
pub use transactions::{
    append_run_journal_entry, clear_active_run, current_unix_timestamp, is_valid_run_id,
    list_runs, new_run_id, read_active_run, read_run_journal, read_run_metadata, run_owner_pid,
    set_active_run, update_run_status, write_run_metadata,
};
pub use types::{RunJournalEntry, RunMetadata, RunState, SwapPlan, WaitTarget, RUN_METADATA_VERSION};
