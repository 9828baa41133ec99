//! cadence - autonomous engineering loop orchestrator.

use cadence::agent::capture::OutputCapture;
use cadence::agent::claude::ClaudeCliRuntime;
use cadence::agent::stream::tracing_callback;
use cadence::agent::AgentShim;
use cadence::project::{find_project_root, ProjectContext, SPEC_FILENAME};
use cadence::runner::{Runner, RunnerOptions, RunTermination};
use cadence::storage::Storage;
use cadence_core::RunConfig;
use clap::{Parser, Subcommand};
use eyre::WrapErr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "cadence", about = "Autonomous engineering loop orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or auto-resume) a run against the spec.
    Run {
        /// Spec file; defaults to Cadencefile at the project root.
        #[arg(long)]
        spec: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Attach to an existing tracker work item as the root.
        #[arg(long)]
        root_work_item: Option<String>,
    },
    /// Show the latest run.
    Status,
    /// Show recent runs.
    History {
        #[arg(long, default_value_t = 10)]
        runs: u32,
    },
    /// Resume an interrupted or paused run.
    Resume {
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
}

/// Exit codes: 0 normal termination, 1 bootstrap/environment error,
/// 2 aborted, 3 stuck.
fn exit_code(termination: RunTermination) -> i32 {
    match termination {
        RunTermination::Done | RunTermination::MaxIterations => 0,
        RunTermination::Aborted => 2,
        RunTermination::Stuck => 3,
    }
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(async {
        match dispatch(cli).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                1
            }
        }
    });
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> eyre::Result<i32> {
    let cwd = std::env::current_dir().wrap_err("cannot read current directory")?;
    let project_root = find_project_root(&cwd).wrap_err("no cadence project here")?;
    let project = ProjectContext::resolve(&project_root)?;

    match cli.command {
        Commands::Run {
            spec,
            max_iterations,
            root_work_item,
        } => {
            let options = RunnerOptions {
                max_iterations,
                root_work_item_id: root_work_item,
                resume_run_id: None,
            };
            run_loop(project, &project_root, spec, options).await
        }
        Commands::Resume {
            run_id,
            max_iterations,
        } => {
            let options = RunnerOptions {
                max_iterations,
                root_work_item_id: None,
                resume_run_id: run_id,
            };
            run_loop(project, &project_root, None, options).await
        }
        Commands::Status => {
            let storage = Storage::open(&project.db_path()).await?;
            match storage.latest_run().await? {
                Some(run) => {
                    println!(
                        "{}  {}  started {}  spec {}",
                        run.id,
                        run.status.as_str(),
                        run.started_at.format("%Y-%m-%d %H:%M:%S"),
                        run.spec_path
                    );
                    for iteration in storage.list_iterations(&run.id).await? {
                        println!(
                            "  iteration {:>3}  {}  {}",
                            iteration.number,
                            iteration.outcome.as_str(),
                            iteration.intent
                        );
                    }
                }
                None => println!("no runs yet"),
            }
            Ok(0)
        }
        Commands::History { runs } => {
            let storage = Storage::open(&project.db_path()).await?;
            for run in storage.list_runs(Some(runs)).await? {
                let ended = run
                    .ended_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:8}  started {}  ended {}",
                    run.id,
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    ended
                );
            }
            Ok(0)
        }
    }
}

async fn run_loop(
    project: ProjectContext,
    project_root: &std::path::Path,
    spec: Option<PathBuf>,
    options: RunnerOptions,
) -> eyre::Result<i32> {
    let spec_path = spec.unwrap_or_else(|| project_root.join(SPEC_FILENAME));

    let mut config = RunConfig::default();
    let config_path = project_root.join(".cadence/config");
    if config_path.exists() {
        config
            .load_file(&config_path)
            .wrap_err("invalid .cadence/config")?;
    }

    let shim = AgentShim::new(
        Arc::new(ClaudeCliRuntime::new()),
        OutputCapture::new(&project.outputs_dir()),
    );

    let mut runner = Runner::new(
        project,
        shim,
        spec_path,
        config,
        options,
        Some(tracing_callback()),
    )
    .await?;
    let termination = runner.run().await?;
    Ok(exit_code(termination))
}
