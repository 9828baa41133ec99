//! ORIENT phase: delegate judgment to the planner agent.
//!
//! All interpretation of the SENSE claims happens in the planner. The
//! orchestrator hands it the spec, the memory, the claims, and the prior
//! iteration's feedback, then validates the structured output it returns.
//! The planner has direct write access to the memory file; curation is
//! its job, we only record that it ran.

use crate::agent::stream::StreamCallback;
use crate::agent::{AgentError, AgentRequest, AgentShim};
use crate::retry::{RetryFailure, RetryPolicy};
use crate::sense::Claims;
use cadence_core::{PlannerOutput, RunConfig};
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum OrientError {
    #[error(transparent)]
    Agent(#[from] RetryFailure<AgentError>),
    #[error("claims serialization failed: {0}")]
    Claims(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrientError>;

/// What the previous iteration left for the planner to consider.
#[derive(Debug, Clone, Default)]
pub struct IterationFeedback {
    pub executor_summary: Option<String>,
    pub verifier_assessment: Option<String>,
    pub specialist_feedback: Vec<String>,
    /// Recorded when the previous iteration failed on a protocol
    /// violation; the planner sees it instead of executor results.
    pub protocol_error: Option<String>,
    /// Operator comments consumed at the iteration boundary.
    pub operator_comments: Vec<String>,
}

impl IterationFeedback {
    pub fn is_empty(&self) -> bool {
        self.executor_summary.is_none()
            && self.verifier_assessment.is_none()
            && self.specialist_feedback.is_empty()
            && self.protocol_error.is_none()
            && self.operator_comments.is_empty()
    }
}

/// Invoke the planner with retry and return its raw structured output.
///
/// Validation of the decision and plan is the caller's next step; this
/// function only guarantees the payload parsed into the planner schema.
pub async fn orient(
    shim: &AgentShim,
    policy: &RetryPolicy,
    config: &RunConfig,
    spec_content: &str,
    memory_path: &std::path::Path,
    claims: &Claims,
    feedback: &IterationFeedback,
    events: Option<StreamCallback>,
) -> Result<(PlannerOutput, Option<PathBuf>)> {
    let prompt = build_planner_prompt(spec_content, memory_path, claims, feedback)?;
    let model = config.model_for("planner").to_string();

    let result = policy
        .execute_async(AgentError::retry_class, || {
            let shim = shim.clone();
            let prompt = prompt.clone();
            let model = model.clone();
            let events = events.clone();
            async move {
                let request = AgentRequest {
                    agent_type: "planner".to_string(),
                    prompt,
                    model,
                    working_dir: None,
                    schema: PlannerOutput::schema(),
                };
                tokio::task::spawn_blocking(move || shim.invoke::<PlannerOutput>(request, events))
                    .await
                    .map_err(|e| AgentError::Isolation(e.to_string()))?
            }
        })
        .await?;

    let (output, capture_path) = result;
    info!(intent = %output.intent, decision = %output.decision.decision, "planner returned");
    Ok((output, capture_path))
}

fn build_planner_prompt(
    spec_content: &str,
    memory_path: &std::path::Path,
    claims: &Claims,
    feedback: &IterationFeedback,
) -> std::result::Result<String, serde_json::Error> {
    let claims_json = serde_json::to_string_pretty(claims)?;

    let mut prompt = format!(
        "You are the planner for an autonomous engineering loop.\n\n\
         # Specification\n{spec_content}\n\n\
         # Observed state\n{claims_json}\n\n\
         # Memory\nThe project memory file is at {} and its current content \
         is included in the observed state. You may edit that file directly \
         to preserve durable lessons; keep it curated.\n",
        memory_path.display()
    );

    if !feedback.is_empty() {
        prompt.push_str("\n# Feedback from the previous iteration\n");
        if let Some(error) = &feedback.protocol_error {
            prompt.push_str(&format!("Previous iteration failed: {error}\n"));
        }
        if let Some(summary) = &feedback.executor_summary {
            prompt.push_str(&format!("Executor summary: {summary}\n"));
        }
        if let Some(assessment) = &feedback.verifier_assessment {
            prompt.push_str(&format!("Verifier assessment: {assessment}\n"));
        }
        for item in &feedback.specialist_feedback {
            prompt.push_str(&format!("Specialist feedback: {item}\n"));
        }
        for comment in &feedback.operator_comments {
            prompt.push_str(&format!("Operator comment: {comment}\n"));
        }
    }

    prompt.push_str(
        "\nAssess whether the specification is satisfied, then respond with your \
         intent for this iteration, a decision signal (CONTINUE, DONE with a \
         reason summarizing completion, or STUCK with a reason), and on \
         CONTINUE an iteration_plan assigning ready work items to executors.",
    );
    Ok(prompt)
}
