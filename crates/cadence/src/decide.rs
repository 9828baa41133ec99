//! DECIDE phase: deterministic routing from the planner's decision.
//!
//! Pure orchestrator code, no agent involvement. Replaying the same
//! decision always yields the same outcome.

use cadence_core::{Decision, IterationPlan};

/// Terminal or continuation outcome for the iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecideOutcome {
    Done { summary: String },
    Stuck { reason: String },
    Continue,
}

/// Route a validated decision.
///
/// DONE and STUCK pass through. CONTINUE requires an actionable plan: a
/// missing or empty plan means the planner wants to keep going but has
/// nothing to hand out, which is STUCK.
pub fn decide(decision: &Decision, plan: Option<&IterationPlan>) -> DecideOutcome {
    match decision {
        Decision::Done { summary } => DecideOutcome::Done {
            summary: summary.clone(),
        },
        Decision::Stuck { reason } => DecideOutcome::Stuck {
            reason: reason.clone(),
        },
        Decision::Continue => match plan {
            Some(plan) if !plan.is_empty() => DecideOutcome::Continue,
            _ => DecideOutcome::Stuck {
                reason: "no actionable work".to_string(),
            },
        },
    }
}
