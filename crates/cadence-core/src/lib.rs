pub mod config;
pub mod plan;
pub mod types;
pub mod validation;

pub use config::RunConfig;
pub use plan::{
    Decision, ExecutorReport, ExecutorStatus, IterationPlan, PlannedWorkItem, PlannerOutput,
    SpecialistReport, VerifierOutcome, VerifierReport,
};
pub use types::{
    AgentKind, AgentOutput, HumanInput, HumanInputKind, Iteration, IterationOutcome, Run,
    RunStatus, WorkItem, WorkItemComment,
};
pub use validation::{is_valid_work_item_id, slugify};
