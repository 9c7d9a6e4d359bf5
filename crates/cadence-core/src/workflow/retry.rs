//! Retry coordinator: runs one step to a terminal result.
//!
//! `RetryHandler` holds the stateless policy (whether to retry, how long to
//! wait). `RetryCoordinator` applies it: it runs an executor under a
//! per-attempt timeout, converts panics into `AgentFailure`, backs off
//! between attempts and always returns a `StepResult`. Errors never escape.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use cadence_types::config::EngineConfig;
use cadence_types::event::EngineEvent;
use cadence_types::plan::{PlanStep, RetryConfig};
use cadence_types::result::{ErrorKind, StepResult};
use futures_util::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::step::{BoxStepExecutor, StepError, StepOutput, StepRequest};
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry policy.
///
/// No internal state; all logic is in associated functions that take the
/// configuration as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt should follow a failed one.
    ///
    /// `attempt` is 1-based (first execution is attempt 1). `max_retries`
    /// counts total attempts, so `max_retries = 3` allows attempts 1..=3.
    pub fn should_retry(config: &RetryConfig, attempt: u32, kind: ErrorKind) -> bool {
        attempt < config.max_retries.max(1) && config.is_retryable(kind)
    }

    /// Backoff before `next_attempt` (2-based).
    ///
    /// `initial_delay_ms * backoff_factor^(next_attempt - 2)`, capped at
    /// `max_delay_ms`. Non-decreasing in `next_attempt` for factors >= 1.
    pub fn delay_for_attempt(config: &RetryConfig, next_attempt: u32) -> Duration {
        if next_attempt < 2 {
            return Duration::ZERO;
        }
        let factor = if config.backoff_factor.is_nan() || config.backoff_factor < 1.0 {
            1.0
        } else {
            config.backoff_factor
        };
        let exponent = i32::try_from(next_attempt - 2).unwrap_or(i32::MAX);
        let raw = config.initial_delay_ms as f64 * factor.powi(exponent);
        let cap = config.max_delay_ms as f64;
        let ms = if raw.is_finite() { raw.min(cap) } else { cap };
        Duration::from_millis(ms as u64)
    }
}

// ---------------------------------------------------------------------------
// RetryCoordinator
// ---------------------------------------------------------------------------

/// Drives a single step through its attempts.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    default_retry: RetryConfig,
    default_timeout: Duration,
    events: EventBus,
}

impl RetryCoordinator {
    pub fn new(config: &EngineConfig, events: EventBus) -> Self {
        Self {
            default_retry: config.retry.clone(),
            default_timeout: Duration::from_secs(config.step_timeout_secs.max(1)),
            events,
        }
    }

    /// Retry policy for a step (its override, else the engine default).
    pub fn policy_for<'a>(&'a self, step: &'a PlanStep) -> &'a RetryConfig {
        step.retry.as_ref().unwrap_or(&self.default_retry)
    }

    /// Per-attempt timeout for a step.
    pub fn timeout_for(&self, step: &PlanStep) -> Duration {
        step.timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Run a step until it succeeds, fails terminally, or exhausts its
    /// attempts. Never raises: every outcome is a `StepResult`.
    ///
    /// A missing executor yields a single failed attempt. Cancellation
    /// interrupts a pending backoff and records the last failure.
    pub async fn attempt(
        &self,
        executor: Option<&BoxStepExecutor>,
        step: &PlanStep,
        request: &StepRequest,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started = Instant::now();
        let Some(executor) = executor else {
            return StepResult::failed(
                &step.step_id,
                ErrorKind::Validation,
                format!("no executor registered for '{}'", step.capability()),
                started.elapsed(),
                1,
            );
        };

        let policy = self.policy_for(step);
        let timeout = self.timeout_for(step);
        let mut attempt: u32 = 1;

        loop {
            match run_once(executor, request, timeout).await {
                Ok(output) => {
                    debug!(step_id = %step.step_id, attempt, "step succeeded");
                    return StepResult::succeeded(
                        &step.step_id,
                        output.value,
                        output.insights,
                        started.elapsed(),
                        attempt,
                    );
                }
                Err(err) => {
                    let kind = err.kind();
                    if !RetryHandler::should_retry(policy, attempt, kind) {
                        warn!(
                            step_id = %step.step_id,
                            attempt,
                            error = %err,
                            "step failed"
                        );
                        return StepResult::failed(
                            &step.step_id,
                            kind,
                            err.message(),
                            started.elapsed(),
                            attempt,
                        );
                    }

                    let next_attempt = attempt + 1;
                    let delay = RetryHandler::delay_for_attempt(policy, next_attempt);
                    warn!(
                        step_id = %step.step_id,
                        attempt,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "step attempt failed, retrying"
                    );
                    self.events.publish(EngineEvent::StepRetrying {
                        query_id: request.query_id,
                        step_id: step.step_id.clone(),
                        next_attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: err.to_string(),
                    });

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!(step_id = %step.step_id, "backoff interrupted by cancellation");
                            return StepResult::failed(
                                &step.step_id,
                                kind,
                                err.message(),
                                started.elapsed(),
                                attempt,
                            );
                        }
                    }
                    attempt = next_attempt;
                }
            }
        }
    }
}

/// One attempt under a timeout, with panics caught.
async fn run_once(
    executor: &BoxStepExecutor,
    request: &StepRequest,
    timeout: Duration,
) -> Result<StepOutput, StepError> {
    let guarded = AssertUnwindSafe(executor.execute(request)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Err(_) => Err(StepError::Timeout(format!(
            "attempt exceeded {}ms timeout",
            timeout.as_millis()
        ))),
        Ok(Err(panic)) => Err(StepError::AgentFailure(format!(
            "executor panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Ok(Ok(result)) => result,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
