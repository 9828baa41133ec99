//! Structured agent output types.
//!
//! Agents emit JSON conforming to a declared schema; these types are the
//! typed side of that contract. Deserialization alone is not enough: the
//! planner wire format allows combinations the kernel must reject (DONE
//! without a summary, duplicate work items), so each type carries a
//! `validate` step invoked by the agent shim after parsing.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("DONE decision requires a summary")]
    DoneWithoutSummary,
    #[error("STUCK decision requires a reason")]
    StuckWithoutReason,
    #[error("unknown decision signal: {0}")]
    UnknownSignal(String),
    #[error("executor_count is {count} but plan lists {items} work items")]
    CountMismatch { count: u32, items: usize },
    #[error("executor numbers must form the contiguous sequence 1..={0}")]
    NonContiguousExecutors(u32),
    #[error("duplicate work item in plan: {0}")]
    DuplicateWorkItem(String),
}

/// Raw decision signal as the planner emits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDecision {
    pub decision: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub blocker: Option<String>,
}

/// Validated decision signal.
///
/// DONE carries the planner's final assessment; STUCK carries the blocking
/// reason; CONTINUE carries nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Done { summary: String },
    Stuck { reason: String },
    Continue,
}

impl Decision {
    /// Build a validated decision from the wire format.
    ///
    /// STUCK prefers `reason`, falling back to `blocker`.
    pub fn from_wire(raw: &RawDecision) -> Result<Self, PlanError> {
        match raw.decision.as_str() {
            "DONE" => match raw.reason.clone().filter(|s| !s.trim().is_empty()) {
                Some(summary) => Ok(Self::Done { summary }),
                None => Err(PlanError::DoneWithoutSummary),
            },
            "STUCK" => {
                let reason = raw
                    .reason
                    .clone()
                    .or_else(|| raw.blocker.clone())
                    .filter(|s| !s.trim().is_empty());
                match reason {
                    Some(reason) => Ok(Self::Stuck { reason }),
                    None => Err(PlanError::StuckWithoutReason),
                }
            }
            "CONTINUE" => Ok(Self::Continue),
            other => Err(PlanError::UnknownSignal(other.to_string())),
        }
    }
}

/// One work item assignment inside an iteration plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedWorkItem {
    pub work_item_id: String,
    pub description: String,
    /// 1-based executor slot.
    pub executor_number: u32,
}

/// The planner's assignment of work items to parallel executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationPlan {
    pub executor_count: u32,
    pub work_items: Vec<PlannedWorkItem>,
}

impl IterationPlan {
    pub fn is_empty(&self) -> bool {
        self.executor_count == 0 || self.work_items.is_empty()
    }

    /// Check structural invariants: one item per executor slot, executor
    /// numbers forming 1..=count, all work item ids distinct.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.work_items.len() != self.executor_count as usize {
            return Err(PlanError::CountMismatch {
                count: self.executor_count,
                items: self.work_items.len(),
            });
        }

        let mut numbers: Vec<u32> = self.work_items.iter().map(|w| w.executor_number).collect();
        numbers.sort_unstable();
        if numbers != (1..=self.executor_count).collect::<Vec<_>>() {
            return Err(PlanError::NonContiguousExecutors(self.executor_count));
        }

        let mut seen = std::collections::HashSet::new();
        for item in &self.work_items {
            if !seen.insert(item.work_item_id.as_str()) {
                return Err(PlanError::DuplicateWorkItem(item.work_item_id.clone()));
            }
        }
        Ok(())
    }
}

/// Full structured output from one planner invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerOutput {
    pub intent: String,
    pub decision: RawDecision,
    #[serde(default)]
    pub iteration_plan: Option<IterationPlan>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl PlannerOutput {
    /// Validate the wire payload: the decision signal must be well-formed
    /// and a non-null plan must satisfy its invariants.
    pub fn validate(&self) -> Result<Decision, PlanError> {
        let decision = Decision::from_wire(&self.decision)?;
        if let Some(plan) = &self.iteration_plan {
            if !plan.is_empty() {
                plan.validate()?;
            }
        }
        Ok(decision)
    }

    /// JSON schema the planner is asked to conform to.
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["intent", "decision"],
            "properties": {
                "intent": { "type": "string" },
                "decision": {
                    "type": "object",
                    "required": ["decision"],
                    "properties": {
                        "decision": { "enum": ["CONTINUE", "DONE", "STUCK"] },
                        "reason": { "type": ["string", "null"] },
                        "blocker": { "type": ["string", "null"] }
                    }
                },
                "iteration_plan": {
                    "type": ["object", "null"],
                    "required": ["executor_count", "work_items"],
                    "properties": {
                        "executor_count": { "type": "integer", "minimum": 0 },
                        "work_items": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["work_item_id", "description", "executor_number"],
                                "properties": {
                                    "work_item_id": { "type": "string" },
                                    "description": { "type": "string" },
                                    "executor_number": { "type": "integer", "minimum": 1 }
                                }
                            }
                        }
                    }
                },
                "messages": { "type": "array" }
            }
        })
    }
}

/// Executor terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorStatus {
    Completed,
    Blocked,
}

/// Structured output from one executor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorReport {
    pub status: ExecutorStatus,
    pub what_was_done: String,
    #[serde(default)]
    pub blockers: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub efficiency_notes: Option<String>,
    pub work_committed: bool,
    pub traces_updated: bool,
}

impl ExecutorReport {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["status", "what_was_done", "work_committed", "traces_updated"],
            "properties": {
                "status": { "enum": ["Completed", "Blocked"] },
                "what_was_done": { "type": "string" },
                "blockers": { "type": ["string", "null"] },
                "notes": { "type": ["string", "null"] },
                "efficiency_notes": { "type": ["string", "null"] },
                "work_committed": { "type": "boolean" },
                "traces_updated": { "type": "boolean" }
            }
        })
    }
}

/// Verifier judgment on the iteration's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifierOutcome {
    Done,
    Continue,
    Uncertain,
}

/// Structured output from a verifier invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierReport {
    pub outcome: VerifierOutcome,
    pub assessment: String,
}

impl VerifierReport {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["outcome", "assessment"],
            "properties": {
                "outcome": { "enum": ["DONE", "CONTINUE", "UNCERTAIN"] },
                "assessment": { "type": "string" }
            }
        })
    }

    /// Assessment substituted when the verifier crashes past its retry
    /// budget. Never silently treated as DONE.
    pub fn uncertain(detail: &str) -> Self {
        Self {
            outcome: VerifierOutcome::Uncertain,
            assessment: format!("UNCERTAIN: verifier unavailable ({detail})"),
        }
    }
}

/// Structured output from a specialist invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistReport {
    #[serde(default)]
    pub feedback_items: Vec<String>,
}

impl SpecialistReport {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["feedback_items"],
            "properties": {
                "feedback_items": { "type": "array", "items": { "type": "string" } }
            }
        })
    }
}
