//! Scoped worktree acquisition for executor isolation.
//!
//! Each executor works on a `{branch, worktree}` pair keyed by
//! `(run_id, work_item_id)`. The pair is released on every exit path:
//! [`WorktreeScope`] removes the worktree and force-deletes the branch in
//! `Drop`, so a panicking executor task still leaves the repository clean.
//! Branches from interrupted processes are reclaimed by [`sweep_orphans`].

use crate::git::{self, GitError};
use crate::{BRANCH_PREFIX, WORKTREE_DIR_PREFIX};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("worktree path has no parent: {0}")]
    NoParent(String),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Branch name for a work item under a run: `cadence/<run_id>/<item>`.
pub fn branch_name(run_id: &str, work_item_id: &str) -> String {
    format!("{BRANCH_PREFIX}/{run_id}/{work_item_id}")
}

/// Worktree directory for a work item: a sibling of the repo root named
/// `cadence-executor-<run_id>-<item>`.
pub fn worktree_path(repo_root: &Path, run_id: &str, work_item_id: &str) -> Result<PathBuf> {
    let parent = repo_root
        .parent()
        .ok_or_else(|| WorktreeError::NoParent(repo_root.display().to_string()))?;
    Ok(parent.join(format!("{WORKTREE_DIR_PREFIX}{run_id}-{work_item_id}")))
}

/// An acquired `{branch, worktree}` pair, released on drop.
#[derive(Debug)]
pub struct WorktreeScope {
    repo_root: PathBuf,
    branch: String,
    path: PathBuf,
}

impl WorktreeScope {
    /// Acquire a worktree for `(run_id, work_item_id)`.
    ///
    /// The branch is created from `base_branch` (current HEAD when `None`).
    /// An existing branch with the same name is reused: it means an earlier
    /// attempt at this work item was interrupted. If worktree creation
    /// fails after the branch was created, the branch is deleted before the
    /// error propagates, so no half-acquired state survives.
    pub fn acquire(
        repo_root: &Path,
        run_id: &str,
        work_item_id: &str,
        base_branch: Option<&str>,
    ) -> Result<Self> {
        let branch = branch_name(run_id, work_item_id);
        let path = worktree_path(repo_root, run_id, work_item_id)?;

        let mut branch_created = false;
        if !git::branch_exists(repo_root, &branch)? {
            // Exact name required here, so no collision-suffix helper: the
            // (run_id, work_item_id) key already guarantees uniqueness.
            let created = git::create_branch(repo_root, &branch, base_branch)?;
            debug_assert_eq!(created, branch);
            branch_created = true;
        } else {
            debug!(branch = %branch, "reusing existing executor branch");
        }

        if let Err(e) = git::worktree_add(repo_root, &path, &branch) {
            if branch_created {
                if let Err(del) = git::delete_branch(repo_root, &branch, true) {
                    warn!(branch = %branch, error = %del, "rollback branch delete failed");
                }
            }
            return Err(e.into());
        }

        info!(branch = %branch, path = %path.display(), "acquired executor worktree");
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            branch,
            path,
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge this scope's branch into `target`.
    ///
    /// Called by the executor orchestration before the scope is dropped,
    /// and only when the executor reported success. Returns
    /// `(true, "")` or `(false, error)` per the git adapter's merge
    /// contract.
    pub fn merge_to_target(&self, target: &str) -> Result<(bool, String)> {
        Ok(git::merge_branch(&self.repo_root, &self.branch, target)?)
    }
}

impl Drop for WorktreeScope {
    fn drop(&mut self) {
        // Force removal on both steps: the branch may hold unmerged work
        // from a blocked or failed executor, which is abandoned here.
        if let Err(e) = git::worktree_remove(&self.repo_root, &self.path) {
            warn!(path = %self.path.display(), error = %e, "worktree removal failed");
        }
        if let Err(e) = git::delete_branch(&self.repo_root, &self.branch, true) {
            warn!(branch = %self.branch, error = %e, "branch delete failed");
        }
        debug!(branch = %self.branch, "released executor worktree");
    }
}

/// Remove worktrees and branches left behind by interrupted runs.
///
/// Any worktree whose directory name matches the executor naming
/// convention, and any branch under the `cadence/` namespace, is assumed
/// abandoned: live scopes only exist inside a running process. Returns the
/// number of worktrees removed.
pub fn sweep_orphans(repo_root: &Path) -> Result<usize> {
    let mut removed = 0;

    for wt in git::list_worktrees(repo_root)? {
        let path = PathBuf::from(&wt.path);
        let is_executor_dir = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(WORKTREE_DIR_PREFIX));
        if !is_executor_dir {
            continue;
        }
        match git::worktree_remove(repo_root, &path) {
            Ok(()) => {
                info!(path = %wt.path, "removed orphaned worktree");
                removed += 1;
            }
            Err(e) => warn!(path = %wt.path, error = %e, "orphan worktree removal failed"),
        }
    }

    let pattern = format!("{BRANCH_PREFIX}/*");
    for branch in git::list_branches(repo_root, &pattern)? {
        match git::delete_branch(repo_root, &branch, true) {
            Ok(()) => info!(branch = %branch, "deleted orphaned executor branch"),
            Err(e) => warn!(branch = %branch, error = %e, "orphan branch delete failed"),
        }
    }

    Ok(removed)
}
