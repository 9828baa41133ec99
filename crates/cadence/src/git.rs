//! Git adapter.
//!
//! Every operation is parameterized by the repository root; nothing here
//! reads or changes the process cwd. Branch creation resolves name
//! collisions with a numeric suffix and reports the name actually used.
//! Merges into a shared target are serialized by a process-wide lock
//! because parallel executors all land on the same milestone branch.

use crate::process::{run_command, CommandOutput, ProcessError};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Serializes merges into shared target branches across executor tasks.
static MERGE_LOCK: Mutex<()> = Mutex::new(());

/// Information about a git commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: String,
}

/// Information about a git worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
}

fn git(repo_root: &Path, args: &[&str]) -> Result<CommandOutput> {
    Ok(run_command("git", args, repo_root)?)
}

fn git_checked(repo_root: &Path, args: &[&str]) -> Result<CommandOutput> {
    let out = git(repo_root, args)?;
    if !out.success() {
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            out.stderr.trim()
        )));
    }
    Ok(out)
}

/// Locate the repository root containing `start`, if any.
pub fn find_repo_root(start: &Path) -> Result<PathBuf> {
    let out = git(start, &["rev-parse", "--show-toplevel"])?;
    if !out.success() {
        return Err(GitError::NotARepo(start.display().to_string()));
    }
    Ok(PathBuf::from(out.stdout.trim()))
}

/// Detect the repository's default branch.
///
/// Tries the remote HEAD first, then local `main`, then `master`, and
/// reports `main` when nothing else answers.
pub fn detect_default_branch(repo_root: &Path) -> Result<String> {
    let out = git(repo_root, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
    if out.success() {
        if let Some(branch) = out.stdout.trim().strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        if branch_exists(repo_root, candidate)? {
            return Ok(candidate.to_string());
        }
    }
    Ok("main".to_string())
}

/// Name of the currently checked-out branch.
pub fn current_branch(repo_root: &Path) -> Result<String> {
    let out = git_checked(repo_root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(out.stdout.trim().to_string())
}

/// True if there are staged, unstaged, or untracked changes.
pub fn has_uncommitted_changes(repo_root: &Path) -> Result<bool> {
    let out = git_checked(repo_root, &["status", "--porcelain"])?;
    Ok(!out.stdout.trim().is_empty())
}

/// Commits on HEAD since `base`, most recent first.
pub fn commits_since(repo_root: &Path, base: &str) -> Result<Vec<CommitInfo>> {
    let range = format!("{base}..HEAD");
    let out = git(repo_root, &["log", &range, "--format=%H|%s|%an|%aI"])?;
    if !out.success() {
        // An unknown base ref just means no commits to report.
        return Ok(Vec::new());
    }

    let mut commits = Vec::new();
    for line in out.stdout.lines() {
        let parts: Vec<&str> = line.splitn(4, '|').collect();
        if parts.len() == 4 {
            commits.push(CommitInfo {
                sha: parts[0].to_string(),
                message: parts[1].to_string(),
                author: parts[2].to_string(),
                timestamp: parts[3].to_string(),
            });
        }
    }
    Ok(commits)
}

/// `git diff --stat` summary of changes since `base`, empty on errors.
pub fn diff_stat_since(repo_root: &Path, base: &str) -> Result<String> {
    let range = format!("{base}..HEAD");
    let out = git(repo_root, &["diff", "--stat", &range])?;
    if !out.success() {
        return Ok(String::new());
    }
    Ok(out.stdout.trim().to_string())
}

/// Whether a local branch exists.
pub fn branch_exists(repo_root: &Path, branch: &str) -> Result<bool> {
    let refname = format!("refs/heads/{branch}");
    let out = git(repo_root, &["rev-parse", "--verify", &refname])?;
    Ok(out.success())
}

/// Create a branch from `base` (HEAD when `None`) without checking it out.
///
/// If the name is taken, `-2`, `-3`, ... suffixes are tried in order.
/// Returns the name actually created.
pub fn create_branch(repo_root: &Path, name: &str, base: Option<&str>) -> Result<String> {
    let mut actual = name.to_string();
    let mut suffix = 1u32;

    loop {
        if !branch_exists(repo_root, &actual)? {
            match base {
                Some(base) => git_checked(repo_root, &["branch", &actual, base])?,
                None => git_checked(repo_root, &["branch", &actual])?,
            };
            return Ok(actual);
        }
        suffix += 1;
        actual = format!("{name}-{suffix}");
    }
}

/// Checkout a branch in the primary working tree.
pub fn checkout_branch(repo_root: &Path, branch: &str) -> Result<()> {
    git_checked(repo_root, &["checkout", branch])?;
    Ok(())
}

/// Merge `source` into `target` with `--no-edit`.
///
/// Checks out the target first. Returns `(true, "")` on success and
/// `(false, error)` on any failure. A conflicted merge is aborted before
/// returning, while the merge lock is still held, so the shared tree is
/// never left mid-merge for a concurrent caller; the source branch is
/// untouched and the caller decides whether to resolve or discard it.
pub fn merge_branch(repo_root: &Path, source: &str, target: &str) -> Result<(bool, String)> {
    let _guard = MERGE_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    let checkout = git(repo_root, &["checkout", target])?;
    if !checkout.success() {
        return Ok((
            false,
            format!("checkout {target} failed: {}", checkout.stderr.trim()),
        ));
    }

    let merge = git(repo_root, &["merge", source, "--no-edit"])?;
    if !merge.success() {
        let abort = git(repo_root, &["merge", "--abort"])?;
        if !abort.success() {
            warn!(stderr = %abort.stderr.trim(), "git merge --abort failed");
        }
        let detail = if merge.stderr.trim().is_empty() {
            merge.stdout.trim().to_string()
        } else {
            merge.stderr.trim().to_string()
        };
        return Ok((false, detail));
    }
    Ok((true, String::new()))
}

/// Delete a local branch. `force` uses `-D` (unmerged branches included).
pub fn delete_branch(repo_root: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    git_checked(repo_root, &["branch", flag, branch])?;
    Ok(())
}

/// Add a worktree at `path` checked out to `branch`.
pub fn worktree_add(repo_root: &Path, path: &Path, branch: &str) -> Result<()> {
    let path_str = path.to_string_lossy();
    git_checked(repo_root, &["worktree", "add", path_str.as_ref(), branch])?;
    Ok(())
}

/// Remove a worktree, discarding local changes.
pub fn worktree_remove(repo_root: &Path, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    let out = git(repo_root, &["worktree", "remove", "--force", path_str.as_ref()])?;
    // Already-gone worktrees count as removed.
    if !out.success() && !out.stderr.contains("is not a working tree") {
        return Err(GitError::CommandFailed(format!(
            "git worktree remove {}: {}",
            path_str,
            out.stderr.trim()
        )));
    }
    Ok(())
}

/// List all worktrees of the repository.
pub fn list_worktrees(repo_root: &Path) -> Result<Vec<WorktreeInfo>> {
    let out = git_checked(repo_root, &["worktree", "list", "--porcelain"])?;

    let mut worktrees = Vec::new();
    let mut path: Option<String> = None;
    let mut commit: Option<String> = None;
    let mut branch: Option<String> = None;

    for line in out.stdout.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (path.take(), commit.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    commit,
                    branch: branch.take(),
                });
            }
            path = Some(p.to_string());
        } else if let Some(c) = line.strip_prefix("HEAD ") {
            commit = Some(c.to_string());
        } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
            branch = Some(b.to_string());
        }
    }
    if let (Some(path), Some(commit)) = (path, commit) {
        worktrees.push(WorktreeInfo {
            path,
            commit,
            branch,
        });
    }

    Ok(worktrees)
}

/// List local branch names matching a glob pattern.
pub fn list_branches(repo_root: &Path, pattern: &str) -> Result<Vec<String>> {
    let out = git_checked(
        repo_root,
        &["branch", "--list", pattern, "--format=%(refname:short)"],
    )?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Stage all changes including untracked files.
pub fn stage_all(repo_root: &Path) -> Result<()> {
    git_checked(repo_root, &["add", "-A"])?;
    Ok(())
}

/// Commit staged changes, returning the new HEAD sha.
pub fn commit(repo_root: &Path, message: &str) -> Result<String> {
    git_checked(repo_root, &["commit", "-m", message])?;
    head_sha(repo_root)
}

/// Full sha of HEAD.
pub fn head_sha(repo_root: &Path) -> Result<String> {
    let out = git_checked(repo_root, &["rev-parse", "HEAD"])?;
    Ok(out.stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    pub(crate) fn setup_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .output()
                .unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "Initial commit"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    fn commit_file(repo: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(repo.join(name), content).unwrap();
        Command::new("git")
            .args(["add", "."])
            .current_dir(repo)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(repo)
            .output()
            .unwrap();
    }

    #[test]
    fn detect_default_branch_finds_main() {
        let dir = setup_test_repo();
        assert_eq!(detect_default_branch(dir.path()).unwrap(), "main");
    }

    #[test]
    fn current_branch_and_dirtiness() {
        let dir = setup_test_repo();
        assert_eq!(current_branch(dir.path()).unwrap(), "main");
        assert!(!has_uncommitted_changes(dir.path()).unwrap());

        std::fs::write(dir.path().join("untracked.txt"), "data").unwrap();
        assert!(has_uncommitted_changes(dir.path()).unwrap());
    }

    #[test]
    fn find_repo_root_resolves_subdirs() {
        let dir = setup_test_repo();
        let sub = dir.path().join("a/b");
        std::fs::create_dir_all(&sub).unwrap();
        let root = find_repo_root(&sub).unwrap();
        assert_eq!(
            root.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn find_repo_root_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            find_repo_root(dir.path()),
            Err(GitError::NotARepo(_))
        ));
    }

    #[test]
    fn commits_since_parses_log_format() {
        let dir = setup_test_repo();
        let base = head_sha(dir.path()).unwrap();
        commit_file(dir.path(), "one.txt", "1", "Add one");
        commit_file(dir.path(), "two.txt", "2", "Add two");

        let commits = commits_since(dir.path(), &base).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "Add two");
        assert_eq!(commits[1].message, "Add one");
        assert_eq!(commits[0].author, "Test");
    }

    #[test]
    fn commits_since_unknown_base_is_empty() {
        let dir = setup_test_repo();
        let commits = commits_since(dir.path(), "no-such-ref").unwrap();
        assert!(commits.is_empty());
    }

    #[test]
    fn diff_stat_reports_changed_files() {
        let dir = setup_test_repo();
        let base = head_sha(dir.path()).unwrap();
        commit_file(dir.path(), "feature.txt", "content", "Add feature");

        let stat = diff_stat_since(dir.path(), &base).unwrap();
        assert!(stat.contains("feature.txt"));
    }

    #[test]
    fn create_branch_avoids_collisions_with_suffix() {
        let dir = setup_test_repo();
        assert_eq!(
            create_branch(dir.path(), "feature/x", None).unwrap(),
            "feature/x"
        );
        assert_eq!(
            create_branch(dir.path(), "feature/x", None).unwrap(),
            "feature/x-2"
        );
        assert_eq!(
            create_branch(dir.path(), "feature/x", None).unwrap(),
            "feature/x-3"
        );
    }

    #[test]
    fn create_branch_from_base() {
        let dir = setup_test_repo();
        let base = head_sha(dir.path()).unwrap();
        commit_file(dir.path(), "later.txt", "x", "Later commit");

        let name = create_branch(dir.path(), "from-base", Some(&base)).unwrap();
        checkout_branch(dir.path(), &name).unwrap();
        assert!(!dir.path().join("later.txt").exists());
    }

    #[test]
    fn merge_branch_success_advances_target() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", None).unwrap();
        checkout_branch(dir.path(), "feature").unwrap();
        commit_file(dir.path(), "feature.txt", "feature", "Add feature");

        let (ok, err) = merge_branch(dir.path(), "feature", "main").unwrap();
        assert!(ok, "merge failed: {err}");
        assert_eq!(current_branch(dir.path()).unwrap(), "main");
        assert!(dir.path().join("feature.txt").exists());
    }

    #[test]
    fn merge_branch_conflict_reported_not_raised() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "feature", None).unwrap();

        // Diverge the same file on both branches.
        commit_file(dir.path(), "shared.txt", "main version", "Main edit");
        checkout_branch(dir.path(), "feature").unwrap();
        commit_file(dir.path(), "shared.txt", "feature version", "Feature edit");

        let (ok, err) = merge_branch(dir.path(), "feature", "main").unwrap();
        assert!(!ok);
        assert!(!err.is_empty());
        // The conflicted merge was aborted; the shared tree is clean again.
        assert!(!has_uncommitted_changes(dir.path()).unwrap());
    }

    #[test]
    fn worktree_add_and_remove() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "wt-branch", None).unwrap();
        let wt_path = dir.path().parent().unwrap().join("cadence-test-worktree");

        worktree_add(dir.path(), &wt_path, "wt-branch").unwrap();
        assert!(wt_path.exists());

        let listed = list_worktrees(dir.path()).unwrap();
        assert!(listed
            .iter()
            .any(|w| w.branch.as_deref() == Some("wt-branch")));

        worktree_remove(dir.path(), &wt_path).unwrap();
        assert!(!wt_path.exists());

        // Removing again is fine.
        worktree_remove(dir.path(), &wt_path).unwrap();
    }

    #[test]
    fn stage_and_commit_returns_sha() {
        let dir = setup_test_repo();
        std::fs::write(dir.path().join("new.txt"), "new").unwrap();
        stage_all(dir.path()).unwrap();
        let sha = commit(dir.path(), "Add new file").unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(sha, head_sha(dir.path()).unwrap());
    }

    #[test]
    fn list_branches_matches_pattern() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "cadence/run-1/task-aa1", None).unwrap();
        create_branch(dir.path(), "cadence/run-1/task-bb2", None).unwrap();
        create_branch(dir.path(), "other", None).unwrap();

        let branches = list_branches(dir.path(), "cadence/*").unwrap();
        assert_eq!(branches.len(), 2);
        assert!(branches.iter().all(|b| b.starts_with("cadence/")));
    }

    #[test]
    fn delete_branch_force_removes_unmerged() {
        let dir = setup_test_repo();
        create_branch(dir.path(), "doomed", None).unwrap();
        checkout_branch(dir.path(), "doomed").unwrap();
        commit_file(dir.path(), "doomed.txt", "x", "Unmerged work");
        checkout_branch(dir.path(), "main").unwrap();

        // Merged-only delete refuses.
        assert!(delete_branch(dir.path(), "doomed", false).is_err());
        delete_branch(dir.path(), "doomed", true).unwrap();
        assert!(!branch_exists(dir.path(), "doomed").unwrap());
    }
}
