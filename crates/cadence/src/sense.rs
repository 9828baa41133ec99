//! SENSE phase: claim collection without judgment.
//!
//! Gathers what the git repository, the tracker, and the project memory
//! currently say, into one serializable bundle for ORIENT. No writes, no
//! interpretation. Tracker misses degrade to empty lists rather than
//! failing the phase.

use crate::git;
use crate::project::ProjectContext;
use crate::tracker::TrackerClient;
use cadence_core::{WorkItem, WorkItemComment};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Comments are gathered for the root and this many ready children.
const COMMENT_ITEM_LIMIT: usize = 5;

#[derive(Debug, Error)]
pub enum SenseError {
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Project(#[from] crate::project::ProjectError),
}

pub type Result<T> = std::result::Result<T, SenseError>;

#[derive(Debug, Clone, Serialize)]
pub struct GitClaims {
    pub current_branch: String,
    pub has_uncommitted_changes: bool,
    /// Commit subjects since the milestone base, most recent first.
    pub commits_since_base: Vec<String>,
    pub diff_stat: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemComments {
    pub work_item_id: String,
    pub comments: Vec<WorkItemComment>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TrackerClaims {
    pub ready: Vec<WorkItem>,
    pub blocked: Vec<WorkItem>,
    pub closed: Vec<WorkItem>,
    pub recent_comments: Vec<ItemComments>,
}

/// Everything SENSE observed, JSON-serializable for the planner prompt.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    pub git: GitClaims,
    pub tracker: TrackerClaims,
    pub memory: String,
}

/// Collect claims for one iteration.
///
/// `base_ref` is the ref executor commits accumulate against (normally the
/// base the milestone branch was cut from, so the diff shows this run's
/// work).
pub fn sense(
    repo_root: &Path,
    tracker: &TrackerClient,
    project: &ProjectContext,
    root_work_item_id: Option<&str>,
    base_ref: &str,
) -> Result<Claims> {
    let git_claims = GitClaims {
        current_branch: git::current_branch(repo_root)?,
        has_uncommitted_changes: git::has_uncommitted_changes(repo_root)?,
        commits_since_base: git::commits_since(repo_root, base_ref)?
            .into_iter()
            .map(|c| c.message)
            .collect(),
        diff_stat: git::diff_stat_since(repo_root, base_ref)?,
    };

    let tracker_claims = collect_tracker_claims(tracker, root_work_item_id);
    let memory = project.read_memory()?;

    debug!(
        ready = tracker_claims.ready.len(),
        blocked = tracker_claims.blocked.len(),
        closed = tracker_claims.closed.len(),
        commits = git_claims.commits_since_base.len(),
        "sense complete"
    );

    Ok(Claims {
        git: git_claims,
        tracker: tracker_claims,
        memory,
    })
}

fn collect_tracker_claims(tracker: &TrackerClient, root_id: Option<&str>) -> TrackerClaims {
    let mut claims = TrackerClaims::default();

    match tracker.ready_items(root_id) {
        Ok(items) => claims.ready = items,
        Err(e) => warn!(error = %e, "could not list ready items"),
    }
    match tracker.blocked_items(root_id) {
        Ok(items) => claims.blocked = items,
        Err(e) => warn!(error = %e, "could not list blocked items"),
    }
    match tracker.closed_items(root_id) {
        Ok(items) => claims.closed = items,
        Err(e) => warn!(error = %e, "could not list closed items"),
    }

    let mut comment_targets: Vec<String> = Vec::new();
    if let Some(root) = root_id {
        comment_targets.push(root.to_string());
    }
    comment_targets.extend(
        claims
            .ready
            .iter()
            .take(COMMENT_ITEM_LIMIT)
            .map(|t| t.id.clone()),
    );

    for item_id in comment_targets {
        match tracker.show(&item_id) {
            Ok(Some((_, comments))) if !comments.is_empty() => {
                claims.recent_comments.push(ItemComments {
                    work_item_id: item_id,
                    comments,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(item = %item_id, error = %e, "could not read comments"),
        }
    }

    claims
}
