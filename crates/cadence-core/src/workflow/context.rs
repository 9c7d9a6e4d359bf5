//! Execution context: the single shared state object for one user query.
//!
//! `ExecutionContext` owns the plan, every recorded `StepResult`, the
//! completed/failed sets, accumulated insights, the reasoning trace and a
//! memo cache. All mutable state sits behind one mutex and is only changed
//! through whole operations (`record_result`, `append_step`,
//! `record_thought`), so concurrent workers never observe a partial update.
//! Step executors receive a read-only `PriorOutputs` snapshot instead of the
//! context itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cadence_types::insight::Insight;
use cadence_types::plan::{ExecutionPlan, PlanStep};
use cadence_types::result::{StepFailure, StepResult, StepStatus};
use cadence_types::thought::ThoughtStep;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::definition::{append_step, WorkflowError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// ContextError
// ---------------------------------------------------------------------------

/// Errors from context mutations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Results are append-only: a step resolves exactly once.
    #[error("step '{step_id}' has already been resolved")]
    AlreadyResolved { step_id: String },

    /// The result belongs to a step that is not in the plan.
    #[error("step '{step_id}' is not part of the plan")]
    UnknownStep { step_id: String },

    /// Plan growth was rejected.
    #[error(transparent)]
    Plan(#[from] WorkflowError),
}

// ---------------------------------------------------------------------------
// Guarded state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ContextState {
    plan: ExecutionPlan,
    agent_outputs: HashMap<String, StepResult>,
    /// Completed step IDs in resolution order.
    completed_steps: Vec<String>,
    /// Failed step IDs in resolution order.
    failed_order: Vec<String>,
    failed_steps: HashMap<String, StepFailure>,
    insights: Vec<Insight>,
    thoughts: Vec<ThoughtStep>,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Shared, lock-protected state scoped to one query's plan execution.
///
/// Created once per query, shared via `Arc` with concurrent workers, then
/// handed off (usually as a `ContextSnapshot`). Never reused across queries.
#[derive(Debug)]
pub struct ExecutionContext {
    query_id: Uuid,
    query: String,
    session_id: Option<String>,
    created_at: DateTime<Utc>,
    state: Mutex<ContextState>,
    cache: DashMap<String, Value>,
}

impl ExecutionContext {
    /// Create a context for a query with a fixed (static) plan.
    pub fn new(query: impl Into<String>, plan: ExecutionPlan) -> Self {
        Self {
            query_id: Uuid::now_v7(),
            query: query.into(),
            session_id: None,
            created_at: Utc::now(),
            state: Mutex::new(ContextState {
                plan,
                ..ContextState::default()
            }),
            cache: DashMap::new(),
        }
    }

    /// Create a context with an empty plan (adaptive mode).
    pub fn for_query(query: impl Into<String>) -> Self {
        let query = query.into();
        let name = format!("adaptive: {}", query);
        Self::new(query, ExecutionPlan::empty(name))
    }

    /// Attach the owning session identifier.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Wrap in an `Arc` for sharing with workers.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        // A panicking holder cannot leave the state half-written: every
        // mutation below completes before any call that could panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Plan ---------------------------------------------------------------

    /// Clone of the current plan.
    pub fn plan(&self) -> ExecutionPlan {
        self.lock().plan.clone()
    }

    /// Number of steps currently in the plan.
    pub fn plan_len(&self) -> usize {
        self.lock().plan.len()
    }

    /// Append a step to the plan (adaptive growth; no forward references).
    pub fn append_step(&self, step: PlanStep) -> Result<(), ContextError> {
        let mut state = self.lock();
        append_step(&mut state.plan, step)?;
        Ok(())
    }

    // -- Results ------------------------------------------------------------

    /// Record a resolved step in one critical section.
    ///
    /// Writes the result into `agent_outputs`, adds the ID to exactly one of
    /// the completed/failed sets, and appends the step's insights (stamped
    /// with its ID). Outputs above `MAX_STEP_OUTPUT_SIZE` are replaced by a
    /// truncation marker.
    pub fn record_result(&self, mut result: StepResult) -> Result<(), ContextError> {
        cap_output_size(&mut result);
        for insight in &mut result.insights {
            insight.source_step = Some(result.step_id.clone());
        }

        let mut state = self.lock();
        if !state.plan.contains(&result.step_id) {
            return Err(ContextError::UnknownStep {
                step_id: result.step_id,
            });
        }
        if state.agent_outputs.contains_key(&result.step_id) {
            return Err(ContextError::AlreadyResolved {
                step_id: result.step_id,
            });
        }

        let step_id = result.step_id.clone();
        state.insights.extend(result.insights.iter().cloned());
        match &result.error {
            Some(failure) if !result.success => {
                state.failed_steps.insert(step_id.clone(), failure.clone());
                state.failed_order.push(step_id.clone());
            }
            _ if !result.success => {
                state.failed_steps.insert(
                    step_id.clone(),
                    StepFailure {
                        kind: cadence_types::result::ErrorKind::Execution,
                        message: "step failed without an error".to_string(),
                    },
                );
                state.failed_order.push(step_id.clone());
            }
            _ => state.completed_steps.push(step_id.clone()),
        }
        state.agent_outputs.insert(step_id, result);
        Ok(())
    }

    /// Append a planner thought to the reasoning trace.
    pub fn record_thought(&self, thought: ThoughtStep) {
        self.lock().thoughts.push(thought);
    }

    /// Resolution status of a step, or `None` if it is not in the plan.
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        let state = self.lock();
        if state.failed_steps.contains_key(step_id) {
            Some(StepStatus::Failed)
        } else if state.agent_outputs.contains_key(step_id) {
            Some(StepStatus::Completed)
        } else if state.plan.contains(step_id) {
            Some(StepStatus::Pending)
        } else {
            None
        }
    }

    pub fn is_resolved(&self, step_id: &str) -> bool {
        self.lock().agent_outputs.contains_key(step_id)
    }

    /// Clone of one step's recorded result.
    pub fn result(&self, step_id: &str) -> Option<StepResult> {
        self.lock().agent_outputs.get(step_id).cloned()
    }

    /// Plan steps that have not resolved, in plan order.
    pub fn unresolved_steps(&self) -> Vec<String> {
        let state = self.lock();
        state
            .plan
            .steps
            .iter()
            .filter(|s| !state.agent_outputs.contains_key(&s.step_id))
            .map(|s| s.step_id.clone())
            .collect()
    }

    pub fn completed_steps(&self) -> Vec<String> {
        self.lock().completed_steps.clone()
    }

    pub fn failed_steps(&self) -> HashMap<String, StepFailure> {
        self.lock().failed_steps.clone()
    }

    /// (completed, failed) counts read under one lock.
    pub fn resolution_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.completed_steps.len(), state.failed_steps.len())
    }

    pub fn insights(&self) -> Vec<Insight> {
        self.lock().insights.clone()
    }

    pub fn thoughts(&self) -> Vec<ThoughtStep> {
        self.lock().thoughts.clone()
    }

    /// Read-only view of every result recorded so far.
    pub fn prior_outputs(&self) -> PriorOutputs {
        PriorOutputs {
            results: Arc::new(self.lock().agent_outputs.clone()),
        }
    }

    /// A consistent, serializable copy of the whole context.
    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.lock();
        ContextSnapshot {
            query_id: self.query_id,
            query: self.query.clone(),
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            plan: state.plan.clone(),
            agent_outputs: state.agent_outputs.clone(),
            completed_steps: state.completed_steps.clone(),
            failed_steps: state
                .failed_order
                .iter()
                .filter_map(|id| state.failed_steps.get(id).map(|f| (id.clone(), f.clone())))
                .collect(),
            insights: state.insights.clone(),
            thoughts: state.thoughts.clone(),
        }
    }

    // -- Memo cache -----------------------------------------------------------

    /// Look up a memoized intermediate result.
    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).map(|v| v.value().clone())
    }

    /// Store a memoized intermediate result.
    pub fn cache_insert(&self, key: impl Into<String>, value: Value) {
        self.cache.insert(key.into(), value);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

/// Replace oversized outputs with a marker.
fn cap_output_size(result: &mut StepResult) {
    let size = serde_json::to_string(&result.output).map(|s| s.len()).unwrap_or(0);
    if size > MAX_STEP_OUTPUT_SIZE {
        tracing::warn!(
            step_id = result.step_id.as_str(),
            size,
            max = MAX_STEP_OUTPUT_SIZE,
            "step output exceeds size limit, truncating"
        );
        result.output = json!({
            "_truncated": true,
            "_original_size": size,
            "_message": format!(
                "output exceeded {} byte limit and was truncated",
                MAX_STEP_OUTPUT_SIZE
            ),
        });
    }
}

// ---------------------------------------------------------------------------
// PriorOutputs
// ---------------------------------------------------------------------------

/// Immutable view of results recorded before a level started.
///
/// Cheap to clone; shared between all steps of one level.
#[derive(Debug, Clone, Default)]
pub struct PriorOutputs {
    results: Arc<HashMap<String, StepResult>>,
}

impl PriorOutputs {
    /// Build a view from explicit results.
    pub fn from_results<I: IntoIterator<Item = StepResult>>(results: I) -> Self {
        Self {
            results: Arc::new(
                results
                    .into_iter()
                    .map(|r| (r.step_id.clone(), r))
                    .collect(),
            ),
        }
    }

    /// The full result for a step, successful or not.
    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    /// The output of a step, only if it succeeded.
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.results
            .get(step_id)
            .filter(|r| r.success)
            .map(|r| &r.output)
    }

    /// Outputs of the given dependencies that succeeded, in the given order.
    pub fn successful_outputs<'a>(&'a self, step_ids: &'a [String]) -> Vec<(&'a str, &'a Value)> {
        step_ids
            .iter()
            .filter_map(|id| self.output(id).map(|v| (id.as_str(), v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ContextSnapshot
// ---------------------------------------------------------------------------

/// Serializable copy of an `ExecutionContext` for hand-off and planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub query_id: Uuid,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub plan: ExecutionPlan,
    pub agent_outputs: HashMap<String, StepResult>,
    pub completed_steps: Vec<String>,
    /// Failed steps in resolution order.
    pub failed_steps: Vec<(String, StepFailure)>,
    pub insights: Vec<Insight>,
    pub thoughts: Vec<ThoughtStep>,
}

impl ContextSnapshot {
    /// Serialize for persistence.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(json!({}))
    }

    /// Results in plan order (resolved steps only).
    pub fn results_in_plan_order(&self) -> Vec<&StepResult> {
        self.plan
            .steps
            .iter()
            .filter_map(|s| self.agent_outputs.get(&s.step_id))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
