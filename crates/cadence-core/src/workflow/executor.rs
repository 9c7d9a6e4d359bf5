//! Orchestrator: the static plan driver.
//!
//! Execution flow:
//! 1. Validate the plan (structure, registered capabilities, acyclicity).
//!    Any plan-level error aborts here, before a single step runs.
//! 2. Build levels once via the level builder.
//! 3. Run levels in strict sequence; steps inside a level run concurrently
//!    through the `ParallelDispatcher`.
//! 4. Check for cancellation between levels.
//! 5. Aggregate the context into an `ExecutionResult`.
//!
//! Partial success is a normal outcome: failed steps are reported in the
//! result, and their dependents still run with whatever succeeded.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use cadence_types::config::EngineConfig;
use cadence_types::event::{EngineEvent, RunMode};
use cadence_types::insight::Insight;
use cadence_types::plan::{ExecutionPlan, PlanStep};
use cadence_types::result::{RunStatus, StepFailure, StepResult};
use cadence_types::thought::{TerminationReason, ThoughtStep};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::dag::{build_levels, level_ids};
use super::definition::{validate_plan, WorkflowError};
use super::dispatcher::ParallelDispatcher;
use super::registry::ExecutorRegistry;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// OrchestratorError
// ---------------------------------------------------------------------------

/// Errors that abort a run before any step executes.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Plan-level error (malformed plan, unknown dependency, cycle).
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Steps reference capabilities with no registered executor.
    #[error("no executor registered for: {}", .0.join(", "))]
    UnknownCapability(Vec<String>),
}

impl OrchestratorError {
    /// Whether this is the dependency-cycle error.
    pub fn is_cycle(&self) -> bool {
        matches!(self, OrchestratorError::Workflow(e) if e.is_cycle())
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Aggregated outcome of one plan execution, static or adaptive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub query_id: Uuid,
    pub query: String,
    pub mode: RunMode,
    pub status: RunStatus,
    /// The plan as executed (adaptive runs: as grown).
    pub plan: ExecutionPlan,
    pub outputs: HashMap<String, StepResult>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<(String, StepFailure)>,
    pub insights: Vec<Insight>,
    /// Step IDs per executed level, in execution order.
    pub levels: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thoughts: Vec<ThoughtStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<TerminationReason>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub(crate) fn from_context(
        ctx: &ExecutionContext,
        mode: RunMode,
        status: RunStatus,
        levels: Vec<Vec<String>>,
        termination: Option<TerminationReason>,
        elapsed: Duration,
    ) -> Self {
        let snapshot = ctx.snapshot();
        Self {
            query_id: snapshot.query_id,
            query: snapshot.query,
            mode,
            status,
            plan: snapshot.plan,
            outputs: snapshot.agent_outputs,
            completed_steps: snapshot.completed_steps,
            failed_steps: snapshot.failed_steps,
            insights: snapshot.insights,
            levels,
            thoughts: snapshot.thoughts,
            termination,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// Results in plan order (resolved steps only).
    pub fn results_in_plan_order(&self) -> Vec<&StepResult> {
        self.plan
            .steps
            .iter()
            .filter_map(|s| self.outputs.get(&s.step_id))
            .collect()
    }

    /// Outputs of steps that succeeded, in plan order.
    pub fn successful_outputs(&self) -> Vec<&StepResult> {
        self.results_in_plan_order()
            .into_iter()
            .filter(|r| r.success)
            .collect()
    }

    pub fn is_partial(&self) -> bool {
        self.status == RunStatus::PartialSuccess
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs plans against a registry of step executors.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<ExecutorRegistry>,
    events: EventBus,
    dispatcher: ParallelDispatcher,
}

impl Orchestrator {
    /// Create an orchestrator with its own event bus.
    pub fn new(config: EngineConfig, registry: ExecutorRegistry) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self::with_event_bus(config, registry, events)
    }

    /// Create an orchestrator publishing to an existing event bus.
    pub fn with_event_bus(config: EngineConfig, registry: ExecutorRegistry, events: EventBus) -> Self {
        let config = config.normalized();
        let registry = Arc::new(registry);
        let dispatcher = ParallelDispatcher::new(&config, Arc::clone(&registry), events.clone());
        Self {
            config,
            registry,
            events,
            dispatcher,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn dispatcher(&self) -> &ParallelDispatcher {
        &self.dispatcher
    }

    /// Run every plan-level check and return the level partition.
    pub fn validate(&self, plan: &ExecutionPlan) -> Result<Vec<Vec<String>>, OrchestratorError> {
        validate_plan(plan)?;
        let levels = build_levels(plan)?;

        let missing: BTreeSet<String> = plan
            .steps
            .iter()
            .filter(|s| !self.registry.contains(&s.agent_type, &s.action))
            .map(PlanStep::capability)
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::UnknownCapability(missing.into_iter().collect()));
        }
        Ok(level_ids(&levels))
    }

    /// Execute a complete static plan held by `ctx`.
    ///
    /// Plan-level errors abort with zero step executions. Otherwise the run
    /// always yields an `ExecutionResult`, whose status reflects how many
    /// steps succeeded. Cancellation is checked between levels; a level
    /// that has started always resolves fully.
    pub async fn execute_plan(
        &self,
        ctx: Arc<ExecutionContext>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let started = Instant::now();
        let plan = ctx.plan();
        let query_id = ctx.query_id();

        if let Err(e) = self.validate(&plan) {
            tracing::warn!(query_id = %query_id, plan = plan.name.as_str(), error = %e, "plan rejected");
            return Err(e);
        }

        // Owned levels so spawned tasks don't borrow from `plan`.
        let waves: Vec<Vec<PlanStep>> = build_levels(&plan)?
            .into_iter()
            .map(|wave| wave.into_iter().cloned().collect())
            .collect();

        tracing::info!(
            query_id = %query_id,
            plan = plan.name.as_str(),
            steps = plan.len(),
            levels = waves.len(),
            "executing plan"
        );
        self.events.publish(EngineEvent::RunStarted {
            query_id,
            plan_name: plan.name.clone(),
            mode: RunMode::Static,
            steps: plan.len(),
        });

        let mut executed_levels: Vec<Vec<String>> = Vec::with_capacity(waves.len());
        let mut cancelled = false;

        for (level, wave) in waves.into_iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(query_id = %query_id, level, "run cancelled between levels");
                cancelled = true;
                break;
            }

            // Steps already resolved in this context are not re-run.
            let pending: Vec<PlanStep> = wave
                .into_iter()
                .filter(|s| {
                    let resolved = ctx.is_resolved(&s.step_id);
                    if resolved {
                        tracing::debug!(step_id = s.step_id.as_str(), "skipping resolved step");
                    }
                    !resolved
                })
                .collect();
            if pending.is_empty() {
                continue;
            }

            let step_ids: Vec<String> = pending.iter().map(|s| s.step_id.clone()).collect();
            tracing::debug!(query_id = %query_id, level, steps = pending.len(), "processing level");
            self.events.publish(EngineEvent::LevelStarted {
                query_id,
                level,
                step_ids: step_ids.clone(),
            });

            let results = self.dispatcher.execute_level(&ctx, &pending, cancel).await;
            let failed = results.values().filter(|r| !r.success).count();
            if failed > 0 {
                tracing::warn!(query_id = %query_id, level, failed, "level finished with failures");
            }
            executed_levels.push(step_ids);
        }

        let (completed, failed) = ctx.resolution_counts();
        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::from_counts(completed, failed)
        };
        let elapsed = started.elapsed();

        tracing::info!(
            query_id = %query_id,
            status = %status,
            completed,
            failed,
            duration_ms = elapsed.as_millis() as u64,
            "plan finished"
        );
        self.events.publish(EngineEvent::RunFinished {
            query_id,
            status,
            completed,
            failed,
            duration_ms: elapsed.as_millis() as u64,
            termination: None,
        });

        Ok(ExecutionResult::from_context(
            &ctx,
            RunMode::Static,
            status,
            executed_levels,
            None,
            elapsed,
        ))
    }

    /// Convenience: create a context for `query` and execute `plan`.
    pub async fn run(
        &self,
        query: impl Into<String>,
        plan: ExecutionPlan,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let ctx = ExecutionContext::new(query, plan).shared();
        self.execute_plan(ctx, &CancellationToken::new()).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::workflow::step::{StepError, StepExecutor, StepOutput, StepRequest};
    use cadence_types::insight::Severity;
    use cadence_types::plan::RetryConfig;
    use serde_json::{json, Value};

    /// Counts executions; echoes dependency outputs back.
    struct Collect(Arc<AtomicUsize>);

    impl StepExecutor for Collect {
        async fn execute(&self, request: &StepRequest) -> Result<StepOutput, StepError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let deps: Vec<Value> = request
                .dependency_outputs()
                .into_iter()
                .map(|(id, v)| json!({ "from": id, "value": v }))
                .collect();
            Ok(StepOutput::new(json!({ "step": request.step_id, "deps": deps })))
        }
    }

    struct Fail;

    impl StepExecutor for Fail {
        async fn execute(&self, _request: &StepRequest) -> Result<StepOutput, StepError> {
            Err(StepError::Execution("broken".into()))
        }
    }

    struct Finding;

    impl StepExecutor for Finding {
        async fn execute(&self, _request: &StepRequest) -> Result<StepOutput, StepError> {
            Ok(StepOutput::new(json!({"score": 0.9}))
                .with_insight(Insight::new("Spike detected", Severity::High, 0.9)))
        }
    }

    /// Cancels the run while executing.
    struct CancelOnRun(CancellationToken);

    impl StepExecutor for CancelOnRun {
        async fn execute(&self, _request: &StepRequest) -> Result<StepOutput, StepError> {
            self.0.cancel();
            Ok(StepOutput::new(json!("stopping")))
        }
    }

    fn orchestrator(calls: &Arc<AtomicUsize>) -> Orchestrator {
        let mut reg = ExecutorRegistry::new();
        reg.register("demo", "collect", Collect(Arc::clone(calls)))
            .register("demo", "fail", Fail)
            .register("demo", "finding", Finding);
        let config = EngineConfig {
            retry: RetryConfig::no_retry(),
            ..EngineConfig::default()
        };
        Orchestrator::new(config, reg)
    }

    fn step(id: &str, action: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(id, "demo", action).with_depends_on(deps.iter().copied())
    }

    #[tokio::test]
    async fn test_cycle_aborts_with_zero_executions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps(
            "cyclic",
            vec![step("a", "collect", &["b"]), step("b", "collect", &["a"])],
        );
        let ctx = ExecutionContext::new("q", plan).shared();

        let err = orch
            .execute_plan(Arc::clone(&ctx), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_cycle());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(ctx.snapshot().agent_outputs.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_capability_rejected_up_front() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps(
            "p",
            vec![step("a", "collect", &[]), PlanStep::new("b", "ghost", "walk")],
        );
        let err = orch.run("q", plan).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownCapability(ref caps) if caps == &["ghost/walk"]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cycle_reported_before_unknown_capability() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps(
            "p",
            vec![
                step("a", "collect", &["b"]),
                PlanStep::new("b", "ghost", "walk").with_depends_on(["a"]),
            ],
        );
        let err = orch.validate(&plan).unwrap_err();
        assert!(err.is_cycle(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_levels_run_in_sequence_and_see_prior_outputs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps(
            "diamond",
            vec![
                step("a", "collect", &[]),
                step("b", "collect", &["a"]),
                step("c", "collect", &["a"]),
                step("d", "collect", &["b", "c"]),
            ],
        );

        let result = orch.run("q", plan).await.unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.levels, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let d = &result.outputs["d"].output;
        assert_eq!(d["deps"].as_array().unwrap().len(), 2);
        assert_eq!(d["deps"][0]["from"], json!("b"));
    }

    #[tokio::test]
    async fn test_partial_success_is_not_an_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps(
            "partial",
            vec![
                step("fetch", "collect", &[]),
                step("broken", "fail", &["fetch"]),
                step("ok", "collect", &["fetch"]),
                step("summary", "collect", &["broken", "ok"]),
            ],
        );

        let result = orch.run("q", plan).await.unwrap();

        assert!(result.is_partial());
        assert_eq!(result.failed_steps.len(), 1);
        assert_eq!(result.failed_steps[0].0, "broken");
        // The dependent still runs and sees only what succeeded.
        let summary = &result.outputs["summary"];
        assert!(summary.success);
        assert_eq!(summary.output["deps"].as_array().unwrap().len(), 1);
        assert_eq!(result.successful_outputs().len(), 3);
    }

    #[tokio::test]
    async fn test_all_failed_status() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps("f", vec![step("x", "fail", &[])]);
        let result = orch.run("q", plan).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_insights_aggregated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps(
            "i",
            vec![step("anomaly", "finding", &[]), step("other", "collect", &[])],
        );
        let result = orch.run("q", plan).await.unwrap();
        assert_eq!(result.insights.len(), 1);
        assert_eq!(result.insights[0].source_step.as_deref(), Some("anomaly"));
    }

    #[tokio::test]
    async fn test_cancellation_checked_between_levels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let mut reg = ExecutorRegistry::new();
        reg.register("demo", "collect", Collect(Arc::clone(&calls)))
            .register("demo", "stop", CancelOnRun(cancel.clone()));
        let orch = Orchestrator::new(EngineConfig::default(), reg);

        let plan = ExecutionPlan::with_steps(
            "c",
            vec![step("first", "stop", &[]), step("second", "collect", &["first"])],
        );
        let ctx = ExecutionContext::new("q", plan).shared();
        let result = orch.execute_plan(ctx, &cancel).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.completed_steps, vec!["first".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolved_steps_are_not_rerun() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let plan = ExecutionPlan::with_steps(
            "resume",
            vec![step("a", "collect", &[]), step("b", "collect", &["a"])],
        );
        let ctx = ExecutionContext::new("q", plan).shared();
        ctx.record_result(StepResult::succeeded("a", json!("cached"), vec![], Duration::ZERO, 1))
            .unwrap();

        let result = orch.execute_plan(ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.levels, vec![vec!["b"]]);
        assert_eq!(result.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_run_events_bracket_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(&calls);
        let mut rx = orch.events().subscribe();
        let plan = ExecutionPlan::with_steps("e", vec![step("a", "collect", &[])]);

        orch.run("q", plan).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                EngineEvent::RunStarted { .. } => "run_started",
                EngineEvent::LevelStarted { .. } => "level_started",
                EngineEvent::StepStarted { .. } => "step_started",
                EngineEvent::StepResolved { .. } => "step_resolved",
                EngineEvent::RunFinished { .. } => "run_finished",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["run_started", "level_started", "step_started", "step_resolved", "run_finished"]
        );
    }
}
