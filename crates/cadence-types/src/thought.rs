//! Reasoning records for the adaptive (ReAct) planning loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The planner's reasoning for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtStep {
    /// Why this action was chosen.
    pub rationale: String,
    /// Other actions the planner weighed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives_considered: Vec<String>,
    /// What the planner expects the action to produce.
    #[serde(default)]
    pub expected_outcome: String,
    /// 1-based planning iteration this thought belongs to (set by the engine).
    #[serde(default)]
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
}

impl ThoughtStep {
    pub fn new(rationale: impl Into<String>) -> Self {
        Self {
            rationale: rationale.into(),
            alternatives_considered: Vec::new(),
            expected_outcome: String::new(),
            iteration: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives_considered = alternatives.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_expected_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.expected_outcome = outcome.into();
        self
    }
}

/// One action proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    /// Optional explicit step ID; the engine assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub agent_type: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Steps (already in the plan, or earlier in the same turn) this reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Advisory only: IDs of same-turn actions this may run alongside.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub can_run_parallel_with: Vec<String>,
    #[serde(default)]
    pub is_final: bool,
}

impl NextAction {
    pub fn new(agent_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            step_id: None,
            agent_type: agent_type.into(),
            action: action.into(),
            parameters: Map::new(),
            depends_on: Vec::new(),
            can_run_parallel_with: Vec::new(),
            is_final: false,
        }
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Replace the parameter payload. Non-object values are stored under `"value"`.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = match parameters {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel_with<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.can_run_parallel_with = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn final_action(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// `agent_type/action`, used in logs and error messages.
    pub fn capability(&self) -> String {
        format!("{}/{}", self.agent_type, self.action)
    }
}

/// Everything the planner emits in one reasoning turn.
///
/// `actions[0]` is the primary action. Further actions are candidates for
/// batching with it; the engine validates every parallel hint against the
/// dependency structure before acting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerTurn {
    pub thought: ThoughtStep,
    pub actions: Vec<NextAction>,
}

impl PlannerTurn {
    /// A turn with a single action.
    pub fn single(thought: ThoughtStep, action: NextAction) -> Self {
        Self {
            thought,
            actions: vec![action],
        }
    }
}

/// Why an adaptive run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The executed action was marked `is_final`.
    FinalAction,
    /// The planner's completeness check returned true.
    Complete,
    /// The hard iteration ceiling was reached.
    IterationLimit,
    /// Too many consecutive proposals were rejected as repeats.
    LoopDetected,
    /// The planner itself failed.
    PlannerFailed,
    /// The run was cancelled between iterations.
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminationReason::FinalAction => "final_action",
            TerminationReason::Complete => "complete",
            TerminationReason::IterationLimit => "iteration_limit",
            TerminationReason::LoopDetected => "loop_detected",
            TerminationReason::PlannerFailed => "planner_failed",
            TerminationReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
