//! Orchestration kernel for the cadence loop.
//!
//! Drives SENSE -> ORIENT -> DECIDE -> ACT iterations against a git
//! repository and a `trc` work tracker, delegating real work to
//! language-model agents behind the [`agent::AgentRuntime`] seam.

pub mod act;
pub mod agent;
pub mod decide;
pub mod git;
pub mod milestone;
pub mod orient;
pub mod process;
pub mod project;
pub mod retry;
pub mod runner;
pub mod sense;
pub mod storage;
pub mod tracker;
pub mod worktree;

/// Branch namespace for per-executor branches: `cadence/<run_id>/<item>`.
pub const BRANCH_PREFIX: &str = "cadence";

/// Directory-name prefix for executor worktrees, used both when creating
/// them and when sweeping orphans left by interrupted runs.
pub const WORKTREE_DIR_PREFIX: &str = "cadence-executor-";

/// Prefix for run ids.
pub const RUN_ID_PREFIX: &str = "cadence-";

/// Generate a fresh run id: `cadence-` plus six random lowercase
/// alphanumerics.
pub fn new_run_id() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{RUN_ID_PREFIX}{suffix}")
}
