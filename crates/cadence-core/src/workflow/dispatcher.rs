//! Parallel dispatcher: runs one level of independent steps concurrently.
//!
//! Every step in a level is handed to the retry coordinator on its own tokio
//! task (`JoinSet`), bounded by a semaphore of `max_parallel_steps` permits.
//! Each task records its own result into the `ExecutionContext` with one
//! atomic `record_result` call, so completed/failed membership is decided per
//! step and never shared between workers. A level with a single step runs
//! inline without spawning.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_types::config::EngineConfig;
use cadence_types::event::EngineEvent;
use cadence_types::plan::PlanStep;
use cadence_types::result::{ErrorKind, StepResult};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::context::{ContextError, ExecutionContext, PriorOutputs};
use super::loop_guard::ActionSignature;
use super::registry::ExecutorRegistry;
use super::retry::RetryCoordinator;
use super::step::StepRequest;
use crate::event::EventBus;

/// Executes levels of mutually independent steps.
#[derive(Debug, Clone)]
pub struct ParallelDispatcher {
    worker: StepWorker,
    max_parallel: usize,
}

impl ParallelDispatcher {
    pub fn new(config: &EngineConfig, registry: Arc<ExecutorRegistry>, events: EventBus) -> Self {
        Self {
            worker: StepWorker {
                registry,
                retry: RetryCoordinator::new(config, events.clone()),
                events,
                memoize: config.memoize_outputs,
            },
            max_parallel: config.max_parallel_steps.max(1),
        }
    }

    /// Run every step of a level and wait for all of them to resolve.
    ///
    /// Returns exactly one `StepResult` per input step, keyed by step ID.
    /// Individual step failures are recorded, never propagated. All steps
    /// see the same `PriorOutputs` snapshot taken when the level starts.
    pub async fn execute_level(
        &self,
        ctx: &Arc<ExecutionContext>,
        steps: &[PlanStep],
        cancel: &CancellationToken,
    ) -> HashMap<String, StepResult> {
        let mut results = HashMap::with_capacity(steps.len());
        let prior = ctx.prior_outputs();

        if let [step] = steps {
            let result = self.worker.run(ctx, step, prior, cancel).await;
            results.insert(result.step_id.clone(), result);
            return results;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut join_set = JoinSet::new();
        let mut task_steps = HashMap::with_capacity(steps.len());

        for step in steps {
            // Clone what we need for the spawned task
            let worker = self.worker.clone();
            let task_ctx = Arc::clone(ctx);
            let task_step = step.clone();
            let task_prior = prior.clone();
            let token = cancel.clone();
            let permits = Arc::clone(&semaphore);

            let handle = join_set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                worker.run(&task_ctx, &task_step, task_prior, &token).await
            });
            task_steps.insert(handle.id(), step.step_id.clone());
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((_, result)) => {
                    results.insert(result.step_id.clone(), result);
                }
                Err(join_err) => {
                    // The executor call itself is panic-guarded; this only
                    // fires if the worker task was aborted or panicked.
                    let Some(step_id) = task_steps.get(&join_err.id()).cloned() else {
                        warn!(error = %join_err, "unattributable worker task failure");
                        continue;
                    };
                    let result = StepResult::failed(
                        &step_id,
                        ErrorKind::AgentFailure,
                        format!("worker task failed: {join_err}"),
                        std::time::Duration::ZERO,
                        1,
                    );
                    let recorded = self.worker.record(ctx, result);
                    results.insert(step_id, recorded);
                }
            }
        }

        results
    }
}

/// Everything one step task needs; cheap to clone into a spawned task.
#[derive(Debug, Clone)]
struct StepWorker {
    registry: Arc<ExecutorRegistry>,
    retry: RetryCoordinator,
    events: EventBus,
    memoize: bool,
}

impl StepWorker {
    async fn run(
        &self,
        ctx: &ExecutionContext,
        step: &PlanStep,
        prior: PriorOutputs,
        cancel: &CancellationToken,
    ) -> StepResult {
        let query_id = ctx.query_id();
        self.events.publish(EngineEvent::StepStarted {
            query_id,
            step_id: step.step_id.clone(),
            capability: step.capability(),
        });

        let memo_key = self
            .memoize
            .then(|| ActionSignature::new(&step.agent_type, &step.action, &step.parameters));

        let result = match memo_key.as_ref().and_then(|k| ctx.cache_get(k.as_str())) {
            Some(value) => {
                debug!(step_id = %step.step_id, "reusing memoized output");
                // Served from cache: no executor attempt was made.
                StepResult::succeeded(&step.step_id, value, vec![], std::time::Duration::ZERO, 0)
            }
            None => {
                let started = Instant::now();
                let executor = self.registry.resolve(&step.agent_type, &step.action);
                let request = StepRequest::for_step(query_id, ctx.query(), step, prior);
                let result = self
                    .retry
                    .attempt(executor.as_ref(), step, &request, cancel)
                    .await;
                debug!(
                    step_id = %step.step_id,
                    success = result.success,
                    attempts = result.attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "step resolved"
                );
                if let Some(key) = &memo_key {
                    if result.success && !result.is_degenerate() {
                        ctx.cache_insert(key.as_str(), result.output.clone());
                    }
                }
                result
            }
        };

        self.record(ctx, result)
    }

    /// Record a result and announce it. Returns what the context holds.
    fn record(&self, ctx: &ExecutionContext, result: StepResult) -> StepResult {
        let step_id = result.step_id.clone();
        let recorded = match ctx.record_result(result.clone()) {
            Ok(()) => ctx.result(&step_id).unwrap_or(result),
            Err(ContextError::AlreadyResolved { .. }) => {
                warn!(step_id = %step_id, "step already resolved; keeping first result");
                ctx.result(&step_id).unwrap_or(result)
            }
            Err(e) => {
                warn!(step_id = %step_id, error = %e, "failed to record step result");
                result
            }
        };
        self.events.publish(EngineEvent::StepResolved {
            query_id: ctx.query_id(),
            result: recorded.clone(),
        });
        recorded
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
