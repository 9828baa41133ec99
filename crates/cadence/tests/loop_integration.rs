//! End-to-end loop scenarios: a real git repository, a stub `trc` CLI on
//! PATH, and a scripted agent runtime standing in for the language-model
//! agents.

use async_trait::async_trait;
use cadence::agent::capture::OutputCapture;
use cadence::agent::stream::StreamCallback;
use cadence::agent::{AgentError, AgentRequest, AgentRuntime, AgentShim};
use cadence::milestone::complete_milestone;
use cadence::project::ProjectContext;
use cadence::runner::{Runner, RunnerOptions, RunTermination};
use cadence::storage::Storage;
use cadence::tracker::TrackerClient;
use cadence::{git, worktree};
use cadence_core::{IterationOutcome, Run, RunConfig, RunStatus};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

const SPEC: &str = "# Add greeting\nWrite a script that prints Hello.\n";

/// Stub `trc` storing items in `$PWD/.trc-state`, one `id|status|priority|title|parent`
/// line per item, speaking the same line format the adapter parses.
const TRC_STUB: &str = r#"#!/bin/sh
STATE="$PWD/.trc-state"
touch "$STATE"
cmd="$1"; [ $# -gt 0 ] && shift
case "$cmd" in
  init) : > "$STATE" ;;
  list)
    if [ "$1" = "--status" ] && [ "$2" = "closed" ]; then
      awk -F'|' '$2=="closed" {printf "● %s [P%s] %s\n", $1, $3, $4}' "$STATE"
    else
      awk -F'|' '$2=="open" {printf "○ %s [P%s] %s\n", $1, $3, $4}' "$STATE"
    fi ;;
  ready)
    awk -F'|' '$2=="open" {printf "○ %s [P%s] %s\n", $1, $3, $4; if ($5 != "") printf "   └─ child of: %s - parent\n", $5}' "$STATE" ;;
  children)
    p="$1"
    awk -F'|' -v p="$p" '$5==p {mark = ($2=="open") ? "○" : "●"; printf "%s %s [P%s] %s\n", mark, $1, $3, $4}' "$STATE" ;;
  show)
    id="$1"
    line=$(grep "^$id|" "$STATE")
    if [ -z "$line" ]; then echo "Error: item not found" >&2; exit 1; fi
    echo "$line" | awk -F'|' '{mark = ($2=="open") ? "○" : "●"; printf "%s %s [P%s] %s\nStatus: %s\nParent: %s\n", mark, $1, $3, $4, $2, $5}' ;;
  create)
    title="$1"; [ $# -gt 0 ] && shift
    parent=""
    while [ $# -gt 0 ]; do
      case "$1" in
        --description) shift ;;
        --parent) shift; parent="$1" ;;
      esac
      [ $# -gt 0 ] && shift
    done
    n=$(($(wc -l < "$STATE") + 1))
    id="stub-item$n"
    echo "$id|open|2|$title|$parent" >> "$STATE"
    echo "Created issue $id: $title" ;;
  close)
    id="$1"
    awk -F'|' -v id="$id" 'BEGIN{OFS="|"} $1==id {$2="closed"} {print}' "$STATE" > "$STATE.tmp" && mv "$STATE.tmp" "$STATE" ;;
  comment) : ;;
  update)
    id="$1"; shift
    if [ "$1" = "--parent" ]; then
      awk -F'|' -v id="$id" -v p="$2" 'BEGIN{OFS="|"} $1==id {$5=p} {print}' "$STATE" > "$STATE.tmp" && mv "$STATE.tmp" "$STATE"
    fi ;;
  *) : ;;
esac
"#;

/// Install the stub `trc` on PATH once for the whole test binary.
fn install_stub_trc() {
    static INSTALLED: OnceLock<PathBuf> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let dir = TempDir::new().unwrap().keep();
        let trc = dir.join("trc");
        std::fs::write(&trc, TRC_STUB).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&trc, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.display(), path));
        dir
    });
}

fn sh(dir: &Path, cmd: &str) {
    let out = Command::new("sh")
        .args(["-c", cmd])
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "command failed: {cmd}\n{}",
        String::from_utf8_lossy(&out.stderr)
    );
}

struct Fixture {
    repo: TempDir,
    home: TempDir,
    repo_root: PathBuf,
}

fn setup_project() -> Fixture {
    install_stub_trc();
    let repo = TempDir::new().unwrap();
    sh(repo.path(), "git init -b main -q");
    sh(repo.path(), "git config user.email test@test.com");
    sh(repo.path(), "git config user.name Test");
    std::fs::write(repo.path().join("Cadencefile"), SPEC).unwrap();
    sh(repo.path(), "git add -A && git commit -q -m 'Initial commit'");
    sh(repo.path(), "trc init");
    let repo_root = repo.path().canonicalize().unwrap();
    Fixture {
        repo,
        home: TempDir::new().unwrap(),
        repo_root,
    }
}

/// Agent runtime scripted with queued planner and verifier payloads.
/// Executors write a file and commit, like the real agent would.
struct LoopRuntime {
    planner_outputs: Mutex<VecDeque<Value>>,
    verifier_outputs: Mutex<VecDeque<Result<Value, String>>>,
    planner_prompts: Mutex<Vec<String>>,
    executor_invocations: Mutex<u32>,
}

impl LoopRuntime {
    fn new(
        planner: Vec<Value>,
        verifier: Vec<Result<Value, String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            planner_outputs: Mutex::new(planner.into()),
            verifier_outputs: Mutex::new(verifier.into()),
            planner_prompts: Mutex::new(Vec::new()),
            executor_invocations: Mutex::new(0),
        })
    }

    fn continue_with_plan(items: &[&str]) -> Value {
        json!({
            "intent": "implement the plan",
            "decision": { "decision": "CONTINUE" },
            "iteration_plan": {
                "executor_count": items.len(),
                "work_items": items.iter().enumerate().map(|(i, id)| json!({
                    "work_item_id": id,
                    "description": format!("implement {id}"),
                    "executor_number": i + 1
                })).collect::<Vec<_>>()
            },
            "messages": []
        })
    }

    fn done(summary: &str) -> Value {
        json!({
            "intent": "wrap up",
            "decision": { "decision": "DONE", "reason": summary },
            "iteration_plan": null,
            "messages": []
        })
    }

    fn verifier_done() -> Result<Value, String> {
        Ok(json!({"outcome": "DONE", "assessment": "spec satisfied"}))
    }

    fn verifier_continue() -> Result<Value, String> {
        Ok(json!({"outcome": "CONTINUE", "assessment": "more to do"}))
    }
}

#[async_trait]
impl AgentRuntime for LoopRuntime {
    async fn invoke(
        &self,
        request: &AgentRequest,
        _events: Option<StreamCallback>,
    ) -> Result<Value, AgentError> {
        match request.agent_type.as_str() {
            "planner" => {
                self.planner_prompts
                    .lock()
                    .unwrap()
                    .push(request.prompt.clone());
                self.planner_outputs
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| AgentError::runtime("planner script exhausted"))
            }
            "executor" => {
                let mut count = self.executor_invocations.lock().unwrap();
                *count += 1;
                let n = *count;
                drop(count);
                let dir = request.working_dir.clone().expect("executor needs a cwd");
                std::fs::write(dir.join(format!("work-{n}.txt")), "done").unwrap();
                sh(&dir, "git add -A && git commit -q -m 'executor work'");
                Ok(json!({
                    "status": "Completed",
                    "what_was_done": format!("wrote work-{n}.txt"),
                    "work_committed": true,
                    "traces_updated": true
                }))
            }
            "verifier" => match self.verifier_outputs.lock().unwrap().pop_front() {
                Some(Ok(value)) => Ok(value),
                Some(Err(message)) => Err(AgentError::runtime(message)),
                None => Ok(json!({"outcome": "CONTINUE", "assessment": "default"})),
            },
            other => Err(AgentError::runtime(format!("unexpected agent {other}"))),
        }
    }
}

async fn build_runner(
    fixture: &Fixture,
    runtime: Arc<dyn AgentRuntime>,
    options: RunnerOptions,
) -> Runner {
    let project = ProjectContext::resolve_in(fixture.repo.path(), fixture.home.path()).unwrap();
    let shim = AgentShim::new(runtime, OutputCapture::new(&project.outputs_dir()));
    let mut config = RunConfig::default();
    // Keep agent retries fast in tests.
    config.retry_base_delay_ms = 1;
    config.retry_max_delay_ms = 2;
    Runner::new(
        project,
        shim,
        fixture.repo.path().join("Cadencefile"),
        config,
        options,
        None,
    )
    .await
    .unwrap()
}

async fn open_storage(fixture: &Fixture) -> Storage {
    let project = ProjectContext::resolve_in(fixture.repo.path(), fixture.home.path()).unwrap();
    Storage::open(&project.db_path()).await.unwrap()
}

fn trc_state(fixture: &Fixture) -> String {
    std::fs::read_to_string(fixture.repo.path().join(".trc-state")).unwrap_or_default()
}

fn assert_no_residual_worktrees(repo_root: &Path) {
    let residue: Vec<_> = git::list_worktrees(repo_root)
        .unwrap()
        .into_iter()
        .filter(|w| w.path.contains("cadence-executor-"))
        .collect();
    assert!(residue.is_empty(), "residual worktrees: {residue:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_single_iteration() {
    let fixture = setup_project();
    let runtime = LoopRuntime::new(
        vec![LoopRuntime::continue_with_plan(&["task-xyz"])],
        vec![LoopRuntime::verifier_done()],
    );

    let mut runner = build_runner(&fixture, runtime, RunnerOptions::default()).await;
    let termination = runner.run().await.unwrap();
    assert_eq!(termination, RunTermination::Done);

    let storage = open_storage(&fixture).await;
    let run = storage.latest_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert!(run.ended_at.is_some());
    assert_eq!(run.milestone_branch.as_deref(), Some("feature/add-greeting"));

    let iterations = storage.list_iterations(&run.id).await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].number, 1);
    assert_eq!(iterations[0].outcome, IterationOutcome::Done);

    // Exactly one merged commit on the milestone branch.
    git::checkout_branch(&fixture.repo_root, "feature/add-greeting").unwrap();
    let commits = git::commits_since(&fixture.repo_root, "main").unwrap();
    assert_eq!(commits.len(), 1);
    assert!(fixture.repo_root.join("work-1.txt").exists());

    assert_no_residual_worktrees(&fixture.repo_root);
    assert!(git::list_branches(&fixture.repo_root, "cadence/*")
        .unwrap()
        .is_empty());

    // The root work item was created and closed at completion.
    assert!(trc_state(&fixture).contains("stub-item1|closed"));

    // Planner and verifier outputs were recorded against the iteration.
    let outputs = storage.list_agent_outputs(iterations[0].id).await.unwrap();
    assert!(outputs.len() >= 3, "expected planner+executor+verifier rows");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_on_empty_plan() {
    let fixture = setup_project();
    let planner_output = json!({
        "intent": "no work found",
        "decision": { "decision": "CONTINUE" },
        "iteration_plan": { "executor_count": 0, "work_items": [] },
        "messages": []
    });
    let runtime = LoopRuntime::new(vec![planner_output], vec![]);
    let executor_counter = Arc::clone(&runtime);

    let mut runner = build_runner(&fixture, runtime, RunnerOptions::default()).await;
    let termination = runner.run().await.unwrap();
    assert_eq!(termination, RunTermination::Stuck);

    let storage = open_storage(&fixture).await;
    let run = storage.latest_run().await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Stuck);

    let iterations = storage.list_iterations(&run.id).await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].outcome, IterationOutcome::Stuck);

    // No executor was ever invoked.
    assert_eq!(*executor_counter.executor_invocations.lock().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verifier_crash_feeds_uncertain_into_next_iteration() {
    let fixture = setup_project();
    let runtime = LoopRuntime::new(
        vec![
            LoopRuntime::continue_with_plan(&["task-one1"]),
            LoopRuntime::done("verified manually"),
        ],
        vec![
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
            Err("connection reset".to_string()),
        ],
    );
    let prompts = Arc::clone(&runtime);

    let mut runner = build_runner(&fixture, runtime, RunnerOptions::default()).await;
    let termination = runner.run().await.unwrap();
    assert_eq!(termination, RunTermination::Done);

    let storage = open_storage(&fixture).await;
    let run = storage.latest_run().await.unwrap().unwrap();
    let iterations = storage.list_iterations(&run.id).await.unwrap();
    assert_eq!(iterations.len(), 2);
    // The crashed verifier did not end the run; the iteration continued.
    assert_eq!(iterations[0].outcome, IterationOutcome::Continue);
    assert_eq!(iterations[1].outcome, IterationOutcome::Done);

    // The second planner invocation saw the synthesized UNCERTAIN text.
    let planner_prompts = prompts.planner_prompts.lock().unwrap();
    assert_eq!(planner_prompts.len(), 2);
    assert!(planner_prompts[1].contains("UNCERTAIN"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_reattaches_and_sweeps() {
    let fixture = setup_project();

    // Seed an interrupted run with two finished iterations.
    let storage = open_storage(&fixture).await;
    let interrupted = Run {
        id: "cadence-int3rr".to_string(),
        spec_path: fixture.repo.path().join("Cadencefile").display().to_string(),
        spec_content: SPEC.to_string(),
        status: RunStatus::Running,
        config: RunConfig::default(),
        started_at: chrono::Utc::now(),
        ended_at: None,
        root_work_item_id: None,
        milestone_branch: None,
    };
    storage.insert_run(&interrupted).await.unwrap();
    for n in 1..=2 {
        let id = storage
            .insert_iteration(&interrupted.id, n, "earlier work")
            .await
            .unwrap();
        storage
            .finish_iteration(id, IterationOutcome::Continue)
            .await
            .unwrap();
    }

    // Stray branch and worktree left behind by the killed process.
    git::create_branch(&fixture.repo_root, "cadence/cadence-int3rr/task-old1", None).unwrap();
    let stray_path = worktree::worktree_path(&fixture.repo_root, "cadence-int3rr", "task-old1")
        .unwrap();
    git::worktree_add(
        &fixture.repo_root,
        &stray_path,
        "cadence/cadence-int3rr/task-old1",
    )
    .unwrap();

    let runtime = LoopRuntime::new(vec![LoopRuntime::done("resumed and finished")], vec![]);
    let mut runner = build_runner(&fixture, runtime, RunnerOptions::default()).await;
    let termination = runner.run().await.unwrap();
    assert_eq!(termination, RunTermination::Done);

    // Same run, not a new one; iteration numbers stayed contiguous.
    let runs = storage.list_runs(None).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, "cadence-int3rr");
    assert_eq!(runs[0].status, RunStatus::Done);

    let iterations = storage.list_iterations("cadence-int3rr").await.unwrap();
    let numbers: Vec<u32> = iterations.iter().map(|i| i.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    // The stray branch and worktree were swept before iteration 3.
    assert!(!stray_path.exists());
    assert!(git::list_branches(&fixture.repo_root, "cadence/*")
        .unwrap()
        .is_empty());
    assert_no_residual_worktrees(&fixture.repo_root);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_input_terminates_gracefully() {
    let fixture = setup_project();

    // Seed the run so the abort can be queued before the loop starts.
    let storage = open_storage(&fixture).await;
    let run = Run {
        id: "cadence-ab0rt1".to_string(),
        spec_path: fixture.repo.path().join("Cadencefile").display().to_string(),
        spec_content: SPEC.to_string(),
        status: RunStatus::Running,
        config: RunConfig::default(),
        started_at: chrono::Utc::now(),
        ended_at: None,
        root_work_item_id: None,
        milestone_branch: None,
    };
    storage.insert_run(&run).await.unwrap();
    storage
        .push_human_input(&run.id, cadence_core::HumanInputKind::Abort, "stop now")
        .await
        .unwrap();

    let runtime = LoopRuntime::new(vec![], vec![]);
    let mut runner = build_runner(&fixture, runtime, RunnerOptions::default()).await;
    let termination = runner.run().await.unwrap();
    assert_eq!(termination, RunTermination::Aborted);

    let reloaded = storage.get_run(&run.id).await.unwrap();
    assert_eq!(reloaded.status, RunStatus::Aborted);
    assert!(reloaded.ended_at.is_some());
    // No iteration ever started.
    assert!(storage.list_iterations(&run.id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn iteration_budget_pauses_run() {
    let fixture = setup_project();
    let runtime = LoopRuntime::new(
        vec![
            LoopRuntime::continue_with_plan(&["task-one1"]),
            LoopRuntime::continue_with_plan(&["task-two2"]),
        ],
        vec![LoopRuntime::verifier_continue(), LoopRuntime::verifier_continue()],
    );

    let mut runner = build_runner(
        &fixture,
        runtime,
        RunnerOptions {
            max_iterations: Some(2),
            ..Default::default()
        },
    )
    .await;
    let termination = runner.run().await.unwrap();
    assert_eq!(termination, RunTermination::MaxIterations);

    let storage = open_storage(&fixture).await;
    let run = storage.latest_run().await.unwrap().unwrap();
    // Budget exhaustion is a resumable stop, never a stranded `running`.
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(storage.list_iterations(&run.id).await.unwrap().len(), 2);
    assert_no_residual_worktrees(&fixture.repo_root);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn milestone_completion_reorganizes_children() {
    let fixture = setup_project();
    let tracker = TrackerClient::new(fixture.repo.path());

    let root = tracker.create("Add greeting", "root", None).unwrap();
    tracker
        .create("Fix crash in merge path", "", Some(&root))
        .unwrap();
    tracker
        .create("Add retries to tracker adapter", "", Some(&root))
        .unwrap();
    tracker.create("Assorted mysteries", "", Some(&root)).unwrap();

    let parents = complete_milestone(&tracker, &root);
    assert!(!parents.is_empty());
    assert!(parents.len() <= 5);

    let state = trc_state(&fixture);
    // The root closed.
    assert!(state.contains(&format!("{root}|closed")));
    // Every previously-open child is still open, under a new parent.
    for line in state.lines() {
        let fields: Vec<&str> = line.split('|').collect();
        let (id, status, parent) = (fields[0], fields[1], fields[4]);
        if id == root || parents.iter().any(|p| p == id) {
            continue;
        }
        assert_eq!(status, "open", "child {id} should remain open");
        assert_ne!(parent, root, "child {id} should be reparented off the root");
        assert!(
            parents.iter().any(|p| p == parent),
            "child {id} has unknown parent {parent}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn protocol_violation_marks_iteration_continue() {
    let fixture = setup_project();
    // First planner output violates the protocol (DONE without a reason),
    // second one ends the run cleanly.
    let bad = json!({
        "intent": "confused",
        "decision": { "decision": "DONE" },
        "iteration_plan": null,
        "messages": []
    });
    let runtime = LoopRuntime::new(vec![bad, LoopRuntime::done("recovered")], vec![]);
    let prompts = Arc::clone(&runtime);

    let mut runner = build_runner(&fixture, runtime, RunnerOptions::default()).await;
    let termination = runner.run().await.unwrap();
    assert_eq!(termination, RunTermination::Done);

    let storage = open_storage(&fixture).await;
    let run = storage.latest_run().await.unwrap().unwrap();
    let iterations = storage.list_iterations(&run.id).await.unwrap();
    assert_eq!(iterations.len(), 2);
    assert_eq!(iterations[0].outcome, IterationOutcome::Continue);
    assert_eq!(iterations[1].outcome, IterationOutcome::Done);

    // The failure was surfaced to the next ORIENT.
    let planner_prompts = prompts.planner_prompts.lock().unwrap();
    assert!(planner_prompts[1].contains("Previous iteration failed"));
}
