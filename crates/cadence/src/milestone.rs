//! Milestone lifecycle: branch naming at run start, work-item
//! reorganization at DONE.
//!
//! The milestone branch collects all executor merges for one run. When
//! the planner declares DONE, surviving open children of the root work
//! item are regrouped under fresh category parents and the root is
//! closed. Nothing in the completion flow may prevent the run from
//! finishing; every error is logged and skipped.

use crate::git;
use crate::tracker::TrackerClient;
use cadence_core::{slugify, WorkItem};
use std::path::Path;
use tracing::{info, warn};

/// Category buckets for reorganized children, in assignment priority
/// order. `backlog` is the fallback for unclassifiable items.
const CATEGORIES: [&str; 6] = ["feature", "bug", "refactor", "docs", "tests", "backlog"];

/// At most this many category parents are created per completion.
const MAX_CATEGORIES: usize = 5;

/// Derive the milestone branch name from the spec's first `# ` heading:
/// `feature/<slug>`. Collision suffixes come from branch creation.
pub fn milestone_branch_name(spec_content: &str) -> String {
    let heading = spec_content
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .unwrap_or("milestone");
    let slug = slugify(heading);
    let slug = if slug.is_empty() {
        "milestone".to_string()
    } else {
        slug
    };
    format!("feature/{slug}")
}

/// Create and check out the milestone branch for a new run, resolving
/// name collisions. Returns the branch name actually created.
pub fn setup_milestone_branch(
    repo_root: &Path,
    spec_content: &str,
    base: Option<&str>,
) -> git::Result<String> {
    let desired = milestone_branch_name(spec_content);
    let actual = git::create_branch(repo_root, &desired, base)?;
    git::checkout_branch(repo_root, &actual)?;
    info!(branch = %actual, "milestone branch ready");
    Ok(actual)
}

/// Classify a child into one of the category buckets by title and
/// description keywords.
fn categorize(item: &WorkItem) -> &'static str {
    let haystack = format!(
        "{} {}",
        item.title.to_lowercase(),
        item.description.as_deref().unwrap_or("").to_lowercase()
    );

    const KEYWORDS: [(&str, &[&str]); 5] = [
        ("bug", &["bug", "fix", "broken", "crash", "error", "regression"]),
        ("tests", &["test", "coverage", "flaky"]),
        ("docs", &["doc", "readme", "comment", "documentation"]),
        ("refactor", &["refactor", "cleanup", "clean up", "simplify", "rename"]),
        ("feature", &["feature", "add", "implement", "support", "new"]),
    ];

    for (category, keywords) in KEYWORDS {
        if keywords.iter().any(|k| haystack.contains(k)) {
            return category;
        }
    }
    "backlog"
}

/// Reorganize still-open children of the root and close it.
///
/// Returns the ids of the category parents created. Every tracker failure
/// is logged and skipped; the run's completion never hinges on this flow.
pub fn complete_milestone(tracker: &TrackerClient, root_work_item_id: &str) -> Vec<String> {
    let children = match tracker.children(root_work_item_id) {
        Ok(children) => children,
        Err(e) => {
            warn!(root = %root_work_item_id, error = %e, "could not list children for completion");
            close_root(tracker, root_work_item_id);
            return Vec::new();
        }
    };

    let open_children: Vec<WorkItem> = children
        .into_iter()
        .filter(|c| c.status == "open")
        .collect();

    if open_children.is_empty() {
        close_root(tracker, root_work_item_id);
        return Vec::new();
    }

    // Bucket the children, then cap the bucket count: when more than
    // MAX_CATEGORIES are non-empty, overflow buckets fold into backlog.
    let mut buckets: Vec<(&'static str, Vec<WorkItem>)> =
        CATEGORIES.iter().map(|c| (*c, Vec::new())).collect();
    for child in open_children {
        let category = categorize(&child);
        let bucket = buckets
            .iter_mut()
            .find(|(name, _)| *name == category)
            .expect("categorize returns a known category");
        bucket.1.push(child);
    }

    let non_empty = buckets.iter().filter(|(_, v)| !v.is_empty()).count();
    if non_empty > MAX_CATEGORIES {
        let mut folded = Vec::new();
        let mut kept = 0;
        for (name, items) in &mut buckets {
            if items.is_empty() || *name == "backlog" {
                continue;
            }
            kept += 1;
            if kept > MAX_CATEGORIES - 1 {
                folded.append(items);
            }
        }
        buckets
            .iter_mut()
            .find(|(name, _)| *name == "backlog")
            .expect("backlog bucket exists")
            .1
            .append(&mut folded);
    }

    let mut created_parents = Vec::new();
    for (category, items) in buckets {
        if items.is_empty() {
            continue;
        }
        let title = format!("{category} follow-ups");
        let description = format!("Open work reorganized from completed milestone {root_work_item_id}");
        let parent_id = match tracker.create(&title, &description, None) {
            Ok(id) => id,
            Err(e) => {
                warn!(category = %category, error = %e, "category parent creation failed");
                continue;
            }
        };
        for item in items {
            if let Err(e) = tracker.reparent(&item.id, &parent_id) {
                warn!(item = %item.id, parent = %parent_id, error = %e, "reparent failed");
            }
        }
        info!(category = %category, parent = %parent_id, "category parent created");
        created_parents.push(parent_id);
    }

    close_root(tracker, root_work_item_id);
    created_parents
}

fn close_root(tracker: &TrackerClient, root_work_item_id: &str) {
    if let Err(e) = tracker.close(root_work_item_id, Some("milestone complete")) {
        warn!(root = %root_work_item_id, error = %e, "closing root work item failed");
    }
}
