//! Core entity types for the orchestration kernel.
//!
//! A run owns its iterations, which own their agent outputs. Work items
//! live in the external tracker; a run references its root work item by
//! id only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;

/// Run lifecycle status.
///
/// Status is monotone except for `Paused` <-> `Running`. `ended_at` is set
/// exactly when the status becomes terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Stuck,
    Paused,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Stuck => "stuck",
            Self::Paused => "paused",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "stuck" => Some(Self::Stuck),
            "paused" => Some(Self::Paused),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Stuck | Self::Aborted)
    }
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Continue,
    Done,
    Stuck,
}

impl IterationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Done => "done",
            Self::Stuck => "stuck",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(Self::Continue),
            "done" => Some(Self::Done),
            "stuck" => Some(Self::Stuck),
            _ => None,
        }
    }
}

/// Which agent produced a captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Planner,
    Executor,
    Verifier,
    Specialist,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Verifier => "verifier",
            Self::Specialist => "specialist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planner" => Some(Self::Planner),
            "executor" => Some(Self::Executor),
            "verifier" => Some(Self::Verifier),
            "specialist" => Some(Self::Specialist),
            _ => None,
        }
    }
}

/// Kind of an operator-supplied input record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanInputKind {
    Comment,
    Pause,
    Resume,
    Abort,
}

impl HumanInputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Abort => "abort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "comment" => Some(Self::Comment),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// One run: a sequence of iterations driving a single spec to a terminal
/// outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Opaque id with prefix, e.g. `cadence-k3x9p2`.
    pub id: String,
    pub spec_path: String,
    /// Snapshot of the spec at run creation; iterations see this, not the
    /// live file.
    pub spec_content: String,
    pub status: RunStatus,
    pub config: RunConfig,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Tracker id of the work item representing the whole spec.
    pub root_work_item_id: Option<String>,
    /// Long-lived feature branch that collects executor merges.
    pub milestone_branch: Option<String>,
}

/// One pass of SENSE -> ORIENT -> DECIDE -> ACT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    /// Autoincrement row id; 0 before insertion.
    pub id: i64,
    pub run_id: String,
    /// 1-based, dense per run.
    pub number: u32,
    /// Planner's stated intent for this iteration.
    pub intent: String,
    pub outcome: IterationOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Pointer to a captured raw agent output. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub id: i64,
    pub iteration_id: i64,
    pub agent_kind: AgentKind,
    pub raw_output_path: String,
    pub summary: String,
}

/// An operator input queued against a run, consumed at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanInput {
    pub id: i64,
    pub run_id: String,
    pub kind: HumanInputKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// A work item mirrored from the tracker. The tracker owns its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    /// "open" or "closed", as reported by the tracker.
    pub status: String,
    /// 0..=4, lower is more urgent.
    pub priority: u8,
    pub description: Option<String>,
    pub parent_id: Option<String>,
}

/// A comment on a tracker work item. Ordering is tracker-assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemComment {
    pub timestamp: String,
    pub source: String,
    pub text: String,
}
