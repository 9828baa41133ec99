//! ACT phase: parallel executor fan-out, verification, specialist
//! feedback.
//!
//! Each planned work item gets its own executor task running in an
//! isolated worktree branched from the milestone branch. Successful work
//! merges back; a merge conflict earns one agent-assisted resolution
//! attempt before the branch is discarded. The gather never short-circuits
//! on a single failure, so every scope exits and every worktree is
//! released. The verifier runs serially after all executors join; if it
//! crashes past its retry budget the iteration gets an explicit UNCERTAIN
//! assessment, never a silent pass.

use crate::agent::stream::StreamCallback;
use crate::agent::{AgentError, AgentRequest, AgentShim};
use crate::git;
use crate::retry::RetryPolicy;
use crate::tracker::TrackerClient;
use crate::worktree::WorktreeScope;
use cadence_core::{
    ExecutorReport, ExecutorStatus, IterationPlan, PlannedWorkItem, RunConfig, SpecialistReport,
    VerifierReport,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Terminal state of one executor's work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorTaskStatus {
    /// Executor completed and its branch merged into the milestone branch.
    Merged,
    /// Executor reported Blocked, or its merge stayed conflicted; the
    /// branch was discarded.
    Blocked,
    /// The invocation itself failed.
    Failed,
}

/// Per-work-item result of the fan-out.
#[derive(Debug, Clone)]
pub struct ExecutorResult {
    pub work_item_id: String,
    pub status: ExecutorTaskStatus,
    pub summary: Option<String>,
    pub blockers: Option<String>,
    pub capture_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Everything ACT produced for iteration persistence and the next ORIENT.
#[derive(Debug)]
pub struct ActOutput {
    pub executors: Vec<ExecutorResult>,
    pub verifier: VerifierReport,
    pub verifier_capture: Option<PathBuf>,
    pub specialist_feedback: Vec<String>,
    pub feedback_items_created: Vec<String>,
}

impl ActOutput {
    /// One-line-per-executor summary handed to the next ORIENT.
    pub fn executor_summary(&self) -> String {
        self.executors
            .iter()
            .map(|r| {
                let state = match r.status {
                    ExecutorTaskStatus::Merged => "merged",
                    ExecutorTaskStatus::Blocked => "blocked",
                    ExecutorTaskStatus::Failed => "failed",
                };
                match (&r.summary, &r.error) {
                    (Some(summary), _) => format!("{} [{state}]: {summary}", r.work_item_id),
                    (None, Some(error)) => format!("{} [{state}]: {error}", r.work_item_id),
                    (None, None) => format!("{} [{state}]", r.work_item_id),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct ActParams<'a> {
    pub shim: &'a AgentShim,
    pub tracker: &'a TrackerClient,
    pub policy: &'a RetryPolicy,
    pub config: &'a RunConfig,
    pub repo_root: &'a Path,
    pub run_id: &'a str,
    pub milestone_branch: &'a str,
    pub spec_content: &'a str,
    pub intent: &'a str,
    pub root_work_item_id: Option<&'a str>,
    pub plan: &'a IterationPlan,
    pub events: Option<StreamCallback>,
}

impl std::fmt::Debug for ActParams<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActParams")
            .field("run_id", &self.run_id)
            .field("milestone_branch", &self.milestone_branch)
            .field("executors", &self.plan.executor_count)
            .finish_non_exhaustive()
    }
}

/// Drive the fan-out for one iteration plan.
pub async fn act(params: ActParams<'_>) -> ActOutput {
    // Spawn every executor before waiting on any of them. Adapter calls
    // are blocking, so each executor gets a blocking-pool thread.
    let mut handles = Vec::with_capacity(params.plan.work_items.len());
    for item in &params.plan.work_items {
        let shim = params.shim.clone();
        let repo_root = params.repo_root.to_path_buf();
        let run_id = params.run_id.to_string();
        let milestone = params.milestone_branch.to_string();
        let spec = params.spec_content.to_string();
        let intent = params.intent.to_string();
        let model = params.config.model_for("executor").to_string();
        let events = params.events.clone();
        let item = item.clone();
        let item_id = item.work_item_id.clone();

        let handle = tokio::task::spawn_blocking(move || {
            run_one_executor(
                &shim, &repo_root, &run_id, &milestone, &spec, &intent, &item, &model, events,
            )
        });
        handles.push((item_id, handle));
    }

    let mut executors = Vec::with_capacity(handles.len());
    for (item_id, handle) in handles {
        match handle.await {
            Ok(result) => executors.push(result),
            // A panicked task already released its scope via Drop during
            // unwind; record the failure and keep gathering.
            Err(join_error) => executors.push(ExecutorResult {
                work_item_id: item_id,
                status: ExecutorTaskStatus::Failed,
                summary: None,
                blockers: None,
                capture_path: None,
                error: Some(format!("executor task failed: {join_error}")),
            }),
        }
    }

    let (verifier, verifier_capture) = run_verifier(&params, &executors).await;

    let mut specialist_feedback = Vec::new();
    let mut feedback_items_created = Vec::new();
    for specialist in &params.config.specialists {
        match run_specialist(&params, specialist, &verifier) {
            Ok(items) => {
                let created = file_feedback(
                    params.tracker,
                    params.root_work_item_id,
                    specialist,
                    &items,
                );
                feedback_items_created.extend(created);
                specialist_feedback.extend(items);
            }
            Err(e) => warn!(specialist = %specialist, error = %e, "specialist invocation failed"),
        }
    }

    ActOutput {
        executors,
        verifier,
        verifier_capture,
        specialist_feedback,
        feedback_items_created,
    }
}

/// One executor: acquire worktree scope, invoke the agent, merge or
/// discard. Runs on a blocking-pool thread; the scope is released on every
/// exit path by Drop.
fn run_one_executor(
    shim: &AgentShim,
    repo_root: &Path,
    run_id: &str,
    milestone_branch: &str,
    spec_content: &str,
    intent: &str,
    item: &PlannedWorkItem,
    model: &str,
    events: Option<StreamCallback>,
) -> ExecutorResult {
    let fail = |error: String, capture: Option<PathBuf>| ExecutorResult {
        work_item_id: item.work_item_id.clone(),
        status: ExecutorTaskStatus::Failed,
        summary: None,
        blockers: None,
        capture_path: capture,
        error: Some(error),
    };

    let scope = match WorktreeScope::acquire(
        repo_root,
        run_id,
        &item.work_item_id,
        Some(milestone_branch),
    ) {
        Ok(scope) => scope,
        Err(e) => return fail(format!("worktree acquisition failed: {e}"), None),
    };

    let request = AgentRequest {
        agent_type: "executor".to_string(),
        prompt: build_executor_prompt(spec_content, intent, item),
        model: model.to_string(),
        working_dir: Some(scope.path().to_path_buf()),
        schema: ExecutorReport::schema(),
    };

    let (report, capture_path): (ExecutorReport, _) =
        match shim.invoke(request, events.clone()) {
            Ok(result) => result,
            Err(e) => return fail(e.to_string(), None),
        };

    if report.status == ExecutorStatus::Blocked {
        info!(item = %item.work_item_id, blockers = report.blockers.as_deref().unwrap_or(""),
            "executor blocked, discarding branch");
        return ExecutorResult {
            work_item_id: item.work_item_id.clone(),
            status: ExecutorTaskStatus::Blocked,
            summary: Some(report.what_was_done),
            blockers: report.blockers,
            capture_path,
            error: None,
        };
    }

    // Agents are asked to commit their own work; pick up anything left
    // behind so the merge sees it.
    if !report.work_committed {
        if let Ok(true) = git::has_uncommitted_changes(scope.path()) {
            let message = format!("cadence: {}", item.work_item_id);
            if let Err(e) = git::stage_all(scope.path())
                .and_then(|()| git::commit(scope.path(), &message))
            {
                warn!(item = %item.work_item_id, error = %e, "auto-commit failed");
            }
        }
    }

    let merged = merge_with_conflict_retry(shim, &scope, milestone_branch, item, model, events);

    ExecutorResult {
        work_item_id: item.work_item_id.clone(),
        status: if merged {
            ExecutorTaskStatus::Merged
        } else {
            ExecutorTaskStatus::Blocked
        },
        summary: Some(report.what_was_done),
        blockers: report.blockers,
        capture_path,
        error: None,
    }
}

/// Merge the scope's branch into the milestone branch. On conflict, abort
/// the merge, hand the executor one conflict-resolution invocation in its
/// worktree, and retry exactly once.
fn merge_with_conflict_retry(
    shim: &AgentShim,
    scope: &WorktreeScope,
    milestone_branch: &str,
    item: &PlannedWorkItem,
    model: &str,
    events: Option<StreamCallback>,
) -> bool {
    match scope.merge_to_target(milestone_branch) {
        Ok((true, _)) => return true,
        Ok((false, error)) => {
            warn!(item = %item.work_item_id, error = %error, "merge conflict, attempting resolution");

            let request = AgentRequest {
                agent_type: "executor".to_string(),
                prompt: build_conflict_prompt(item, milestone_branch, &error),
                model: model.to_string(),
                working_dir: Some(scope.path().to_path_buf()),
                schema: ExecutorReport::schema(),
            };
            if let Err(e) = shim.invoke::<ExecutorReport>(request, events) {
                warn!(item = %item.work_item_id, error = %e, "conflict resolution invocation failed");
                return false;
            }
        }
        Err(e) => {
            warn!(item = %item.work_item_id, error = %e, "merge failed");
            return false;
        }
    }

    match scope.merge_to_target(milestone_branch) {
        Ok((true, _)) => true,
        Ok((false, error)) => {
            warn!(item = %item.work_item_id, error = %error,
                "merge still conflicted after resolution, discarding branch");
            false
        }
        Err(e) => {
            warn!(item = %item.work_item_id, error = %e, "merge retry failed");
            false
        }
    }
}

/// Serial verifier invocation with retry; exhaustion synthesizes
/// UNCERTAIN.
async fn run_verifier(
    params: &ActParams<'_>,
    executors: &[ExecutorResult],
) -> (VerifierReport, Option<PathBuf>) {
    let prompt = build_verifier_prompt(params.spec_content, params.intent, executors);
    let model = params.config.model_for("verifier").to_string();
    let repo_root = params.repo_root.to_path_buf();

    let result = params
        .policy
        .execute_async(AgentError::retry_class, || {
            let shim = params.shim.clone();
            let prompt = prompt.clone();
            let model = model.clone();
            let events = params.events.clone();
            let repo_root = repo_root.clone();
            async move {
                let request = AgentRequest {
                    agent_type: "verifier".to_string(),
                    prompt,
                    model,
                    working_dir: Some(repo_root),
                    schema: VerifierReport::schema(),
                };
                tokio::task::spawn_blocking(move || shim.invoke::<VerifierReport>(request, events))
                    .await
                    .map_err(|e| AgentError::Isolation(e.to_string()))?
            }
        })
        .await;

    match result {
        Ok((report, capture)) => (report, capture),
        Err(failure) => {
            warn!(error = %failure, "verifier unavailable, synthesizing UNCERTAIN");
            (VerifierReport::uncertain(&failure.to_string()), None)
        }
    }
}

fn run_specialist(
    params: &ActParams<'_>,
    specialist: &str,
    verifier: &VerifierReport,
) -> Result<Vec<String>, AgentError> {
    let request = AgentRequest {
        agent_type: "specialist".to_string(),
        prompt: build_specialist_prompt(params.spec_content, specialist, verifier),
        model: params.config.model_for("specialist").to_string(),
        working_dir: Some(params.repo_root.to_path_buf()),
        schema: SpecialistReport::schema(),
    };
    let (report, _): (SpecialistReport, _) = params.shim.invoke(request, params.events.clone())?;
    Ok(report.feedback_items)
}

/// True when a candidate feedback title duplicates an existing child
/// title: equal, or either contains the other, case-insensitively.
pub fn is_duplicate_feedback(candidate: &str, existing_titles: &HashSet<String>) -> bool {
    let candidate = candidate.to_lowercase();
    existing_titles
        .iter()
        .any(|existing| existing.contains(&candidate) || candidate.contains(existing.as_str()))
}

/// File specialist feedback as new work items under the root, skipping
/// duplicates. When the children listing fails the check fails open:
/// better a duplicate item than lost feedback.
fn file_feedback(
    tracker: &TrackerClient,
    root_work_item_id: Option<&str>,
    specialist: &str,
    items: &[String],
) -> Vec<String> {
    let Some(root) = root_work_item_id else {
        return Vec::new();
    };

    let existing: HashSet<String> = match tracker.children(root) {
        Ok(children) => children.into_iter().map(|c| c.title.to_lowercase()).collect(),
        Err(e) => {
            warn!(error = %e, "children listing failed, filing feedback without dedup");
            HashSet::new()
        }
    };

    let mut created = Vec::new();
    for item in items {
        if is_duplicate_feedback(item, &existing) {
            info!(title = %item, "skipping duplicate feedback item");
            continue;
        }
        let description = format!("Feedback from {specialist}");
        match tracker.create(item, &description, Some(root)) {
            Ok(id) => created.push(id),
            Err(e) => warn!(title = %item, error = %e, "feedback item creation failed"),
        }
    }
    created
}

fn build_executor_prompt(spec_content: &str, intent: &str, item: &PlannedWorkItem) -> String {
    format!(
        "You are an executor in an autonomous engineering loop, working in an \
         isolated git worktree (your current directory).\n\n\
         # Specification\n{spec_content}\n\n\
         # Iteration intent\n{intent}\n\n\
         # Your work item\n{}: {}\n\n\
         Implement the work item with a test-first cycle, commit your work on \
         the current branch, and report status Completed, or Blocked with \
         blockers if you cannot proceed.",
        item.work_item_id, item.description
    )
}

fn build_conflict_prompt(item: &PlannedWorkItem, milestone_branch: &str, error: &str) -> String {
    format!(
        "Your branch for work item {} no longer merges cleanly into \
         {milestone_branch}:\n{error}\n\n\
         In your current worktree, merge {milestone_branch} into your branch, \
         resolve every conflict preserving both intents, commit the merge, \
         and report status Completed.",
        item.work_item_id
    )
}

fn build_verifier_prompt(
    spec_content: &str,
    intent: &str,
    executors: &[ExecutorResult],
) -> String {
    let results = executors
        .iter()
        .map(|r| {
            format!(
                "- {} ({:?}): {}",
                r.work_item_id,
                r.status,
                r.summary.as_deref().or(r.error.as_deref()).unwrap_or("no detail")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are the verifier for an autonomous engineering loop.\n\n\
         # Specification\n{spec_content}\n\n\
         # Iteration intent\n{intent}\n\n\
         # Executor results\n{results}\n\n\
         Inspect the repository and judge the iteration: outcome DONE when the \
         specification is fully satisfied, CONTINUE when more work remains, \
         UNCERTAIN when you cannot tell. Explain in the assessment."
    )
}

fn build_specialist_prompt(
    spec_content: &str,
    specialist: &str,
    verifier: &VerifierReport,
) -> String {
    format!(
        "You are the {specialist} specialist reviewing the current state of \
         the repository.\n\n\
         # Specification\n{spec_content}\n\n\
         # Verifier assessment\n{}\n\n\
         Return feedback_items: short, actionable work item titles for \
         problems worth tracking. Return an empty list when there is nothing \
         worth filing.",
        verifier.assessment
    )
}
