//! Adaptive planner: the iterative ReAct driver.
//!
//! Instead of executing a fixed plan, the `AdaptiveRunner` grows the plan
//! one turn at a time. Each turn the `Planner` sees a snapshot of the
//! context and the latest results, emits a `ThoughtStep` plus one primary
//! `NextAction` (optionally with secondary actions), the actions are
//! appended to the plan and executed through the parallel dispatcher, and
//! the planner is consulted again.
//!
//! The loop is an explicit state machine (`Planning` -> `Executing` ->
//! `Planning` ... -> `Done`) and always terminates: on a final action, when
//! the planner reports completion, at the iteration ceiling, when the loop
//! guard keeps rejecting proposals, on planner failure, or on cancellation.
//!
//! `can_run_parallel_with` is only a hint. A secondary action joins the
//! primary's level when a hint links them and no structural dependency
//! forbids it; otherwise it runs after the batch in its own level.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use cadence_types::config::AdaptiveConfig;
use cadence_types::event::{EngineEvent, RunMode};
use cadence_types::plan::PlanStep;
use cadence_types::result::{RunStatus, StepResult};
use cadence_types::thought::{NextAction, PlannerTurn, TerminationReason};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::{ContextSnapshot, ExecutionContext};
use super::executor::{ExecutionResult, Orchestrator};
use super::loop_guard::{ActionSignature, LoopCheck, LoopGuard};

// ---------------------------------------------------------------------------
// Planner contract
// ---------------------------------------------------------------------------

/// Errors a planner can raise. Any of them ends the run.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// The planner backend could not be reached.
    #[error("planner unavailable: {0}")]
    Unavailable(String),

    /// The planner answered with something unusable.
    #[error("invalid planner response: {0}")]
    InvalidResponse(String),
}

/// A proposal the loop guard refused, fed back on the next consultation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedAction {
    pub action: NextAction,
    pub reason: String,
}

/// Everything the planner sees when deciding the next turn.
#[derive(Debug, Clone)]
pub struct PlannerInput {
    /// 1-based consultation number.
    pub iteration: u32,
    pub snapshot: ContextSnapshot,
    /// Results of the steps executed since the previous consultation.
    pub last_results: Vec<StepResult>,
    /// Set when the previous proposal was rejected.
    pub rejected: Option<RejectedAction>,
}

/// Decides what to do next, one turn at a time.
pub trait Planner: Send {
    /// Produce the next thought and action(s).
    fn next_turn(
        &mut self,
        input: &PlannerInput,
    ) -> impl Future<Output = Result<PlannerTurn, PlannerError>> + Send;

    /// Explicit completeness check, evaluated before every consultation.
    fn is_complete(&self, _snapshot: &ContextSnapshot) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// AdaptiveRunner
// ---------------------------------------------------------------------------

/// One admitted step and its loop-guard signature.
struct Admitted {
    step: PlanStep,
    signature: ActionSignature,
}

enum LoopState {
    Planning,
    Executing {
        levels: VecDeque<Vec<Admitted>>,
        is_final: bool,
    },
    Done(TerminationReason),
}

/// Outcome of turning a planner turn into executable levels.
enum Admission {
    Levels {
        levels: VecDeque<Vec<Admitted>>,
        is_final: bool,
    },
    Rejected(RejectedAction),
    NothingProposed,
}

/// Drives a `Planner` against an `Orchestrator`'s executors.
pub struct AdaptiveRunner<'a, P> {
    orchestrator: &'a Orchestrator,
    planner: P,
    config: AdaptiveConfig,
}

impl Orchestrator {
    /// Create an adaptive runner using this orchestrator's executors.
    pub fn adaptive<P: Planner>(&self, planner: P) -> AdaptiveRunner<'_, P> {
        AdaptiveRunner::new(self, planner)
    }
}

impl<'a, P: Planner> AdaptiveRunner<'a, P> {
    pub fn new(orchestrator: &'a Orchestrator, planner: P) -> Self {
        Self {
            config: orchestrator.config().adaptive.clone(),
            orchestrator,
            planner,
        }
    }

    /// Hand the planner back (e.g. to inspect a test stub).
    pub fn into_planner(self) -> P {
        self.planner
    }

    /// Run the loop on `ctx` until a termination condition fires.
    ///
    /// Never fails: planner errors and loop detection end the run with the
    /// corresponding `TerminationReason`, and whatever ran is reported.
    pub async fn run(
        &mut self,
        ctx: Arc<ExecutionContext>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let query_id = ctx.query_id();
        let events = self.orchestrator.events().clone();

        info!(query_id = %query_id, max_iterations = self.config.max_iterations, "starting adaptive run");
        events.publish(EngineEvent::RunStarted {
            query_id,
            plan_name: ctx.plan().name,
            mode: RunMode::Adaptive,
            steps: ctx.plan_len(),
        });

        let mut guard = LoopGuard::with_threshold(self.config.max_repeated_actions);
        let mut iteration: u32 = 0;
        let mut consecutive_rejections: u32 = 0;
        let mut rejected: Option<RejectedAction> = None;
        let mut last_results: Vec<StepResult> = Vec::new();
        let mut executed_levels: Vec<Vec<String>> = Vec::new();
        let mut state = LoopState::Planning;

        let reason = loop {
            state = match state {
                LoopState::Planning => {
                    if cancel.is_cancelled() {
                        LoopState::Done(TerminationReason::Cancelled)
                    } else if self.planner.is_complete(&ctx.snapshot()) {
                        LoopState::Done(TerminationReason::Complete)
                    } else if iteration >= self.config.max_iterations {
                        LoopState::Done(TerminationReason::IterationLimit)
                    } else {
                        iteration += 1;
                        let input = PlannerInput {
                            iteration,
                            snapshot: ctx.snapshot(),
                            last_results: std::mem::take(&mut last_results),
                            rejected: rejected.take(),
                        };
                        match self.planner.next_turn(&input).await {
                            Err(e) => {
                                warn!(query_id = %query_id, iteration, error = %e, "planner failed");
                                LoopState::Done(TerminationReason::PlannerFailed)
                            }
                            Ok(mut turn) => {
                                turn.thought.iteration = iteration;
                                ctx.record_thought(turn.thought.clone());
                                events.publish(EngineEvent::ThoughtRecorded {
                                    query_id,
                                    thought: turn.thought.clone(),
                                });

                                match self.admit(&ctx, turn.actions, &mut guard) {
                                    Admission::Levels { levels, is_final } => {
                                        consecutive_rejections = 0;
                                        guard.begin_turn();
                                        LoopState::Executing { levels, is_final }
                                    }
                                    Admission::NothingProposed => {
                                        debug!(query_id = %query_id, iteration, "planner proposed no action");
                                        LoopState::Done(TerminationReason::Complete)
                                    }
                                    Admission::Rejected(rejection) => {
                                        consecutive_rejections += 1;
                                        warn!(
                                            query_id = %query_id,
                                            iteration,
                                            consecutive_rejections,
                                            reason = rejection.reason.as_str(),
                                            "planner action rejected"
                                        );
                                        events.publish(EngineEvent::ActionRejected {
                                            query_id,
                                            capability: rejection.action.capability(),
                                            reason: rejection.reason.clone(),
                                        });
                                        if consecutive_rejections >= self.config.max_consecutive_rejections {
                                            LoopState::Done(TerminationReason::LoopDetected)
                                        } else {
                                            rejected = Some(rejection);
                                            LoopState::Planning
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                LoopState::Executing { mut levels, is_final } => {
                    match levels.pop_front() {
                        Some(level) => {
                            let steps: Vec<PlanStep> = level.iter().map(|a| a.step.clone()).collect();
                            let step_ids: Vec<String> =
                                steps.iter().map(|s| s.step_id.clone()).collect();
                            events.publish(EngineEvent::LevelStarted {
                                query_id,
                                level: executed_levels.len(),
                                step_ids: step_ids.clone(),
                            });

                            let results = self
                                .orchestrator
                                .dispatcher()
                                .execute_level(&ctx, &steps, cancel)
                                .await;

                            for admitted in &level {
                                if let Some(result) = results.get(&admitted.step.step_id) {
                                    guard.record_outcome(&admitted.signature, result);
                                    last_results.push(result.clone());
                                }
                            }
                            executed_levels.push(step_ids);

                            if levels.is_empty() {
                                if is_final {
                                    LoopState::Done(TerminationReason::FinalAction)
                                } else {
                                    LoopState::Planning
                                }
                            } else if cancel.is_cancelled() {
                                LoopState::Done(TerminationReason::Cancelled)
                            } else {
                                LoopState::Executing { levels, is_final }
                            }
                        }
                        None if is_final => LoopState::Done(TerminationReason::FinalAction),
                        None => LoopState::Planning,
                    }
                }

                LoopState::Done(reason) => break reason,
            };
        };

        let (completed, failed) = ctx.resolution_counts();
        let status = if reason == TerminationReason::Cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::from_counts(completed, failed)
        };
        let elapsed = started.elapsed();

        info!(
            query_id = %query_id,
            status = %status,
            termination = %reason,
            iterations = iteration,
            completed,
            failed,
            "adaptive run finished"
        );
        events.publish(EngineEvent::RunFinished {
            query_id,
            status,
            completed,
            failed,
            duration_ms: elapsed.as_millis() as u64,
            termination: Some(reason),
        });

        ExecutionResult::from_context(
            &ctx,
            RunMode::Adaptive,
            status,
            executed_levels,
            Some(reason),
            elapsed,
        )
    }

    /// Validate a turn's actions, append them to the plan and group them
    /// into levels.
    ///
    /// The primary action (index 0) decides the turn: if it is refused the
    /// whole turn is rejected. Refused secondary actions are dropped.
    fn admit(
        &self,
        ctx: &ExecutionContext,
        actions: Vec<NextAction>,
        guard: &mut LoopGuard,
    ) -> Admission {
        let mut actions = actions.into_iter();
        let Some(primary) = actions.next() else {
            return Admission::NothingProposed;
        };

        let primary_hints: HashSet<String> = primary.can_run_parallel_with.iter().cloned().collect();
        let mut is_final = primary.is_final;
        let first = match self.admit_one(ctx, primary, guard) {
            Ok(admitted) => admitted,
            Err(rejection) => return Admission::Rejected(rejection),
        };

        let mut batch_ids: HashSet<String> = HashSet::from([first.step.step_id.clone()]);
        let mut batch = vec![first];
        let mut deferred: Vec<Admitted> = Vec::new();

        for action in actions {
            let hints: HashSet<String> = action.can_run_parallel_with.iter().cloned().collect();
            let action_final = action.is_final;
            let admitted = match self.admit_one(ctx, action, guard) {
                Ok(admitted) => admitted,
                Err(rejection) => {
                    warn!(
                        capability = rejection.action.capability().as_str(),
                        reason = rejection.reason.as_str(),
                        "dropping secondary action"
                    );
                    self.orchestrator.events().publish(EngineEvent::ActionRejected {
                        query_id: ctx.query_id(),
                        capability: rejection.action.capability(),
                        reason: rejection.reason,
                    });
                    continue;
                }
            };
            is_final |= action_final;

            let id = &admitted.step.step_id;
            let hinted = hints.iter().any(|h| batch_ids.contains(h)) || primary_hints.contains(id);
            let independent = admitted.step.depends_on.iter().all(|d| !batch_ids.contains(d))
                && deferred.is_empty();

            if hinted && independent && batch.len() < self.config.max_parallel_actions {
                batch_ids.insert(id.clone());
                batch.push(admitted);
            } else {
                if hinted {
                    warn!(
                        step_id = id.as_str(),
                        "discarding parallel hint that conflicts with dependencies or batch size"
                    );
                }
                deferred.push(admitted);
            }
        }

        let mut levels = VecDeque::with_capacity(1 + deferred.len());
        levels.push_back(batch);
        levels.extend(deferred.into_iter().map(|a| vec![a]));
        Admission::Levels { levels, is_final }
    }

    /// Loop-guard check, step ID assignment and plan append for one action.
    fn admit_one(
        &self,
        ctx: &ExecutionContext,
        action: NextAction,
        guard: &mut LoopGuard,
    ) -> Result<Admitted, RejectedAction> {
        let signature = ActionSignature::of_action(&action);
        if let LoopCheck::RepeatsUnproductive { description } | LoopCheck::RepeatLimit { description } =
            guard.check(&signature)
        {
            return Err(RejectedAction {
                action,
                reason: description,
            });
        }

        let step_id = match &action.step_id {
            Some(id) => id.clone(),
            None => next_step_id(ctx),
        };
        let mut step = PlanStep::new(step_id, action.agent_type.clone(), action.action.clone())
            .with_depends_on(action.depends_on.iter().cloned());
        step.parameters = action.parameters.clone();
        step.is_final = action.is_final;

        if let Err(e) = ctx.append_step(step.clone()) {
            return Err(RejectedAction {
                action,
                reason: e.to_string(),
            });
        }
        guard.register(&signature);
        Ok(Admitted { step, signature })
    }
}

/// First free `step_{n}` ID, numbered from the current plan length.
fn next_step_id(ctx: &ExecutionContext) -> String {
    let plan = ctx.plan();
    let mut n = plan.len() + 1;
    loop {
        let candidate = format!("step_{n}");
        if !plan.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
