mod identify;
mod liveness;
mod probe;
mod waiter;

pub use identify::{
    escape_ps_single_quote, parse_handle_output, parse_lsof_output, parse_powershell_output,
    run_tool, select_identifier, HandleTool, LockerQuery, Lsof, PowerShellModules, ProcFdScan,
    ProcessIdentifier, QueryChain,
};
pub use liveness::{LivenessProbe, OsLiveness, ProcessIdentity};
pub use probe::{is_lock_contention, probe_path, LockProbe, OsLockProbe};
pub use waiter::ProcessWaiter;

#[cfg(test)]
mod tests;
