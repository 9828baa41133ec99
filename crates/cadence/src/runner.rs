//! The iteration loop.
//!
//! Resume-or-create the run, then drive SENSE -> ORIENT -> DECIDE -> ACT
//! until the planner declares DONE or STUCK, the operator aborts, or the
//! iteration budget runs out. Iterations are strictly serial; the runner
//! is the only writer of the runs and iterations tables. Whatever happens,
//! the run row never stays `running` after this function returns.

use crate::act::{act, ActOutput, ActParams};
use crate::agent::stream::StreamCallback;
use crate::agent::{AgentError, AgentShim};
use crate::decide::{decide, DecideOutcome};
use crate::git;
use crate::milestone::{complete_milestone, setup_milestone_branch};
use crate::orient::{orient, IterationFeedback, OrientError};
use crate::project::ProjectContext;
use crate::retry::{RetryFailure, RetryPolicy};
use crate::sense::sense;
use crate::storage::Storage;
use crate::tracker::TrackerClient;
use crate::worktree::sweep_orphans;
use cadence_core::{
    is_valid_work_item_id, AgentKind, HumanInputKind, IterationOutcome, IterationPlan, Run,
    RunConfig, RunStatus,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// How often the paused loop polls for a resume input.
const PAUSE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("bootstrap error: {0}")]
    Bootstrap(String),
    #[error("Invalid work item ID format: {0}")]
    InvalidWorkItemId(String),
    #[error("fatal agent error: {0}")]
    FatalAgent(String),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Project(#[from] crate::project::ProjectError),
    #[error(transparent)]
    Sense(#[from] crate::sense::SenseError),
    #[error(transparent)]
    Tracker(#[from] crate::tracker::TrackerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// How a `run` invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTermination {
    Done,
    Stuck,
    Aborted,
    MaxIterations,
}

/// Construction-time options, mostly from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Overrides the spec's configured iteration budget.
    pub max_iterations: Option<u32>,
    /// Use this root work item instead of creating one.
    pub root_work_item_id: Option<String>,
    /// Resume this specific run (for `resume --run-id`).
    pub resume_run_id: Option<String>,
}

pub struct Runner {
    project: ProjectContext,
    storage: Storage,
    tracker: TrackerClient,
    shim: AgentShim,
    policy: RetryPolicy,
    repo_root: PathBuf,
    spec_path: PathBuf,
    config: RunConfig,
    options: RunnerOptions,
    events: Option<StreamCallback>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("repo_root", &self.repo_root)
            .field("spec_path", &self.spec_path)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Build a runner. Work item ids from the caller are validated here,
    /// before anything touches git or the tracker.
    pub async fn new(
        project: ProjectContext,
        shim: AgentShim,
        spec_path: PathBuf,
        config: RunConfig,
        options: RunnerOptions,
        events: Option<StreamCallback>,
    ) -> Result<Self> {
        if let Some(id) = &options.root_work_item_id {
            if !is_valid_work_item_id(id) {
                return Err(RunnerError::InvalidWorkItemId(id.clone()));
            }
        }

        let repo_root = git::find_repo_root(&project.project_root)
            .map_err(|e| RunnerError::Bootstrap(e.to_string()))?;
        let storage = Storage::open(&project.db_path()).await?;
        let tracker = TrackerClient::new(&project.project_root);
        let policy = RetryPolicy::from_config(&config);

        Ok(Self {
            project,
            storage,
            tracker,
            shim,
            policy,
            repo_root,
            spec_path,
            config,
            options,
            events,
        })
    }

    /// Drive the loop to a terminal outcome.
    pub async fn run(&mut self) -> Result<RunTermination> {
        self.preflight()?;

        if let Err(e) = crate::project::ensure_marker_in_gitignore(&self.project.project_root) {
            warn!(error = %e, "could not update .gitignore");
        }
        if let Err(e) = sweep_orphans(&self.repo_root) {
            warn!(error = %e, "orphan sweep failed");
        }

        let run = self.resume_or_create_run().await?;
        let root_work_item_id = self.ensure_root_work_item(&run).await?;
        let milestone_branch = self.ensure_milestone_branch(&run).await?;

        let result = self
            .iteration_loop(&run, root_work_item_id.as_deref(), &milestone_branch)
            .await;

        // Whatever happened above, never leave the run stranded in
        // `running`.
        if let Err(e) = &result {
            error!(run = %run.id, error = %e, "run loop failed");
            if let Ok(current) = self.storage.get_run(&run.id).await {
                if current.status == RunStatus::Running {
                    let _ = self.storage.update_run_status(&run.id, RunStatus::Paused).await;
                }
            }
        }
        result
    }

    /// Pre-flight health check: spec readable, tracker reachable. The git
    /// repository was verified at construction.
    fn preflight(&self) -> Result<()> {
        if !self.spec_path.exists() {
            return Err(RunnerError::Bootstrap(format!(
                "spec file not found: {}",
                self.spec_path.display()
            )));
        }
        if !self.tracker.is_available() {
            return Err(RunnerError::Bootstrap(
                "work tracker (trc) is not available in this project".to_string(),
            ));
        }
        Ok(())
    }

    async fn resume_or_create_run(&self) -> Result<Run> {
        if let Some(run_id) = &self.options.resume_run_id {
            let run = self.storage.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Err(RunnerError::Bootstrap(format!(
                    "run {run_id} already ended with status {}",
                    run.status.as_str()
                )));
            }
            self.storage.update_run_status(run_id, RunStatus::Running).await?;
            info!(run = %run_id, "resuming run by id");
            return self.storage.get_run(run_id).await.map_err(Into::into);
        }

        if let Some(latest) = self.storage.latest_run().await? {
            if latest.status == RunStatus::Running {
                info!(run = %latest.id, "re-attaching to interrupted run");
                return Ok(latest);
            }
        }

        let spec_content = std::fs::read_to_string(&self.spec_path)?;
        let mut config = self.config.clone();
        if let Some(max) = self.options.max_iterations {
            config.max_iterations = max;
        }
        let run = Run {
            id: crate::new_run_id(),
            spec_path: self.spec_path.display().to_string(),
            spec_content,
            status: RunStatus::Running,
            config,
            started_at: Utc::now(),
            ended_at: None,
            root_work_item_id: None,
            milestone_branch: None,
        };
        self.storage.insert_run(&run).await?;
        info!(run = %run.id, "created new run");
        Ok(run)
    }

    /// Make sure a root work item exists and is known to the tracker.
    ///
    /// A stored id that the tracker no longer recognizes is replaced with
    /// a fresh item; verification failures other than "not found" are
    /// logged and also lead to a fresh item rather than a dead reference.
    async fn ensure_root_work_item(&self, run: &Run) -> Result<Option<String>> {
        let candidate = self
            .options
            .root_work_item_id
            .clone()
            .or_else(|| run.root_work_item_id.clone());

        if let Some(id) = candidate {
            if !is_valid_work_item_id(&id) {
                return Err(RunnerError::InvalidWorkItemId(id));
            }
            match self.tracker.show(&id) {
                Ok(Some(_)) => {
                    self.storage.set_root_work_item(&run.id, &id).await?;
                    return Ok(Some(id));
                }
                Ok(None) => {
                    info!(item = %id, "stored root work item no longer exists, creating fresh");
                }
                Err(e) => {
                    warn!(item = %id, error = %e, "could not verify existing root work item");
                }
            }
        }

        let title = run
            .spec_content
            .lines()
            .find_map(|l| l.strip_prefix("# "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("Milestone")
            .to_string();
        let description = format!("Root work item for run {}", run.id);
        match self.tracker.create(&title, &description, None) {
            Ok(id) => {
                info!(item = %id, "created root work item");
                self.storage.set_root_work_item(&run.id, &id).await?;
                Ok(Some(id))
            }
            Err(e) => {
                warn!(error = %e, "root work item creation failed, continuing without one");
                Ok(None)
            }
        }
    }

    /// Create the milestone branch for new runs; re-check it out for
    /// resumed ones.
    async fn ensure_milestone_branch(&self, run: &Run) -> Result<String> {
        if let Some(branch) = &run.milestone_branch {
            if git::branch_exists(&self.repo_root, branch)? {
                git::checkout_branch(&self.repo_root, branch)?;
                return Ok(branch.clone());
            }
            warn!(branch = %branch, "stored milestone branch is gone, recreating");
        }

        let branch = setup_milestone_branch(
            &self.repo_root,
            &run.spec_content,
            run.config.base_branch.as_deref(),
        )?;
        self.storage.set_milestone_branch(&run.id, &branch).await?;
        Ok(branch)
    }

    async fn iteration_loop(
        &self,
        run: &Run,
        root_work_item_id: Option<&str>,
        milestone_branch: &str,
    ) -> Result<RunTermination> {
        let max_iterations = self
            .options
            .max_iterations
            .unwrap_or(run.config.max_iterations);
        let base_ref = match run.config.base_branch.clone() {
            Some(base) => base,
            None => git::detect_default_branch(&self.repo_root)?,
        };

        let mut feedback = IterationFeedback::default();

        loop {
            if self.consume_human_inputs(&run.id, &mut feedback).await? {
                self.storage.update_run_status(&run.id, RunStatus::Aborted).await?;
                info!(run = %run.id, "run aborted by operator");
                return Ok(RunTermination::Aborted);
            }

            let number = self.storage.next_iteration_number(&run.id).await?;
            if number > max_iterations {
                info!(run = %run.id, budget = max_iterations, "iteration budget exhausted");
                self.storage.update_run_status(&run.id, RunStatus::Paused).await?;
                return Ok(RunTermination::MaxIterations);
            }

            info!(run = %run.id, iteration = number, "iteration start");
            let iteration_id = self.storage.insert_iteration(&run.id, number, "").await?;

            let claims = match sense(
                &self.repo_root,
                &self.tracker,
                &self.project,
                root_work_item_id,
                &base_ref,
            ) {
                Ok(claims) => claims,
                Err(e) => {
                    // Close the iteration row before propagating so no
                    // iteration is left without an end time.
                    self.storage
                        .finish_iteration(iteration_id, IterationOutcome::Continue)
                        .await?;
                    return Err(e.into());
                }
            };

            let planner = orient(
                &self.shim,
                &self.policy,
                &run.config,
                &run.spec_content,
                &self.project.memory_path(),
                &claims,
                &feedback,
                self.events.clone(),
            )
            .await;
            feedback = IterationFeedback::default();

            let planner_output = match planner {
                Ok((output, capture)) => {
                    self.storage
                        .set_iteration_intent(iteration_id, &output.intent)
                        .await?;
                    self.record_output(
                        iteration_id,
                        AgentKind::Planner,
                        capture.as_deref(),
                        &output.intent,
                    )
                    .await;
                    output
                }
                Err(e) => {
                    if let OrientError::Agent(RetryFailure::Fatal(AgentError::Runtime {
                        ..
                    })) = &e
                    {
                        // A fatal runtime error (bad credentials, missing
                        // binary) recurs until a human acts; pausing keeps
                        // the run resumable once the environment is fixed.
                        self.storage
                            .finish_iteration(iteration_id, IterationOutcome::Continue)
                            .await?;
                        self.storage.update_run_status(&run.id, RunStatus::Paused).await?;
                        return Err(RunnerError::FatalAgent(e.to_string()));
                    }
                    warn!(iteration = number, error = %e, "planner failed, noting for next iteration");
                    feedback.protocol_error = Some(e.to_string());
                    self.storage
                        .finish_iteration(iteration_id, IterationOutcome::Continue)
                        .await?;
                    continue;
                }
            };

            let decision = match planner_output.validate() {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(iteration = number, error = %e, "planner output violates protocol");
                    feedback.protocol_error = Some(e.to_string());
                    self.storage
                        .finish_iteration(iteration_id, IterationOutcome::Continue)
                        .await?;
                    continue;
                }
            };

            match decide(&decision, planner_output.iteration_plan.as_ref()) {
                DecideOutcome::Done { summary } => {
                    info!(run = %run.id, iteration = number, summary = %summary, "run complete");
                    self.storage
                        .finish_iteration(iteration_id, IterationOutcome::Done)
                        .await?;
                    if let Some(root) = root_work_item_id {
                        complete_milestone(&self.tracker, root);
                    }
                    self.storage.update_run_status(&run.id, RunStatus::Done).await?;
                    self.write_summary(number, &planner_output.intent, "done", &summary);
                    return Ok(RunTermination::Done);
                }
                DecideOutcome::Stuck { reason } => {
                    info!(run = %run.id, iteration = number, reason = %reason, "run stuck");
                    self.storage
                        .finish_iteration(iteration_id, IterationOutcome::Stuck)
                        .await?;
                    self.storage.update_run_status(&run.id, RunStatus::Stuck).await?;
                    self.write_summary(number, &planner_output.intent, "stuck", &reason);
                    return Ok(RunTermination::Stuck);
                }
                DecideOutcome::Continue => {}
            }

            // DECIDE guarantees a non-empty plan on Continue.
            let plan = planner_output
                .iteration_plan
                .as_ref()
                .expect("continue outcome implies a plan");
            if let Some(bad) = plan
                .work_items
                .iter()
                .find(|w| !is_valid_work_item_id(&w.work_item_id))
            {
                warn!(item = %bad.work_item_id, "planner emitted an invalid work item id");
                feedback.protocol_error = Some(format!(
                    "Invalid work item ID format: {}",
                    bad.work_item_id
                ));
                self.storage
                    .finish_iteration(iteration_id, IterationOutcome::Continue)
                    .await?;
                continue;
            }

            let act_output = self
                .act_phase(run, root_work_item_id, milestone_branch, &planner_output.intent, plan)
                .await;
            self.persist_act_outputs(iteration_id, &act_output).await;

            // A verifier DONE completes the run in this iteration. Any
            // other verdict (including synthesized UNCERTAIN) feeds the
            // next ORIENT instead.
            if act_output.verifier.outcome == cadence_core::VerifierOutcome::Done {
                info!(run = %run.id, iteration = number, "verifier confirmed completion");
                self.storage
                    .finish_iteration(iteration_id, IterationOutcome::Done)
                    .await?;
                if let Some(root) = root_work_item_id {
                    complete_milestone(&self.tracker, root);
                }
                self.storage.update_run_status(&run.id, RunStatus::Done).await?;
                self.write_summary(
                    number,
                    &planner_output.intent,
                    "done",
                    &act_output.verifier.assessment,
                );
                return Ok(RunTermination::Done);
            }

            feedback.executor_summary = Some(act_output.executor_summary());
            feedback.verifier_assessment = Some(act_output.verifier.assessment.clone());
            feedback.specialist_feedback = act_output.specialist_feedback.clone();

            self.storage
                .finish_iteration(iteration_id, IterationOutcome::Continue)
                .await?;
            self.write_summary(
                number,
                &planner_output.intent,
                "continue",
                &act_output.executor_summary(),
            );
            info!(run = %run.id, iteration = number, "iteration complete");
        }
    }

    async fn act_phase(
        &self,
        run: &Run,
        root_work_item_id: Option<&str>,
        milestone_branch: &str,
        intent: &str,
        plan: &IterationPlan,
    ) -> ActOutput {
        act(ActParams {
            shim: &self.shim,
            tracker: &self.tracker,
            policy: &self.policy,
            config: &run.config,
            repo_root: &self.repo_root,
            run_id: &run.id,
            milestone_branch,
            spec_content: &run.spec_content,
            intent,
            root_work_item_id,
            plan,
            events: self.events.clone(),
        })
        .await
    }

    async fn persist_act_outputs(&self, iteration_id: i64, output: &ActOutput) {
        for result in &output.executors {
            let summary = result
                .summary
                .clone()
                .or_else(|| result.error.clone())
                .unwrap_or_default();
            self.record_output(
                iteration_id,
                AgentKind::Executor,
                result.capture_path.as_deref(),
                &format!("{}: {}", result.work_item_id, summary),
            )
            .await;
        }
        self.record_output(
            iteration_id,
            AgentKind::Verifier,
            output.verifier_capture.as_deref(),
            &output.verifier.assessment,
        )
        .await;
        for item in &output.specialist_feedback {
            self.record_output(iteration_id, AgentKind::Specialist, None, item)
                .await;
        }
    }

    async fn record_output(
        &self,
        iteration_id: i64,
        kind: AgentKind,
        capture_path: Option<&Path>,
        summary: &str,
    ) {
        let path = capture_path
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let summary: String = summary.chars().take(200).collect();
        if let Err(e) = self
            .storage
            .insert_agent_output(iteration_id, kind, &path, &summary)
            .await
        {
            warn!(error = %e, "agent output row insertion failed");
        }
    }

    /// Drain queued operator inputs. Returns true when the run must
    /// abort. Pause blocks here, polling, until resume or abort arrives.
    async fn consume_human_inputs(
        &self,
        run_id: &str,
        feedback: &mut IterationFeedback,
    ) -> Result<bool> {
        loop {
            let Some(input) = self.storage.pop_unconsumed_input(run_id).await? else {
                return Ok(false);
            };
            match input.kind {
                HumanInputKind::Abort => return Ok(true),
                HumanInputKind::Comment => feedback.operator_comments.push(input.content),
                HumanInputKind::Resume => {}
                HumanInputKind::Pause => {
                    info!(run = %run_id, "run paused, waiting for resume");
                    self.storage.update_run_status(run_id, RunStatus::Paused).await?;
                    loop {
                        if let Some(next) = self.storage.pop_unconsumed_input(run_id).await? {
                            match next.kind {
                                HumanInputKind::Resume => {
                                    self.storage
                                        .update_run_status(run_id, RunStatus::Running)
                                        .await?;
                                    info!(run = %run_id, "run resumed");
                                    break;
                                }
                                HumanInputKind::Abort => return Ok(true),
                                HumanInputKind::Comment => {
                                    feedback.operator_comments.push(next.content);
                                }
                                HumanInputKind::Pause => {}
                            }
                        } else {
                            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
                        }
                    }
                }
            }
        }
    }

    /// Best-effort human-readable iteration summary.
    fn write_summary(&self, number: u32, intent: &str, outcome: &str, detail: &str) {
        let dir = self.project.summaries_dir();
        let result = std::fs::create_dir_all(&dir).and_then(|()| {
            std::fs::write(
                dir.join(format!("iter-{number}.md")),
                format!(
                    "# Iteration {number}\n\n- Intent: {intent}\n- Outcome: {outcome}\n\n{detail}\n"
                ),
            )
        });
        if let Err(e) = result {
            warn!(error = %e, "iteration summary write failed");
        }
    }
}
