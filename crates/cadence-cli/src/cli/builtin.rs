//! Built-in demonstration executors.
//!
//! Registered under the `demo` agent type so plan files can be run end to end
//! without any external agent:
//!
//! | Capability   | Behaviour                                                     |
//! |--------------|---------------------------------------------------------------|
//! | `demo/echo`  | Returns `value` (or all parameters); optional `insight` title |
//! | `demo/sleep` | Sleeps `ms` milliseconds                                      |
//! | `demo/flaky` | Fails `failures` times per step, then succeeds                |
//! | `demo/fail`  | Always fails with error `kind` and `message`                  |
//! | `demo/merge` | Collects successful dependency outputs into one object        |

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use cadence_core::workflow::registry::ExecutorRegistry;
use cadence_core::workflow::step::{StepError, StepExecutor, StepOutput, StepRequest};
use cadence_types::insight::{Insight, Severity};
use serde_json::{json, Map, Value};

pub const AGENT_TYPE: &str = "demo";

/// Registry holding every demonstration executor.
pub fn builtin_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry
        .register(AGENT_TYPE, "echo", Echo)
        .register(AGENT_TYPE, "sleep", Sleep)
        .register(AGENT_TYPE, "flaky", Flaky::default())
        .register(AGENT_TYPE, "fail", Fail)
        .register(AGENT_TYPE, "merge", Merge);
    registry
}

fn param_u64(request: &StepRequest, key: &str, default: u64) -> Result<u64, StepError> {
    match request.parameters.get(key) {
        None => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            StepError::Validation(format!("parameter '{key}' must be a non-negative integer"))
        }),
    }
}

pub struct Echo;

impl StepExecutor for Echo {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, StepError> {
        let value = match request.parameters.get("value") {
            Some(v) => v.clone(),
            None => Value::Object(request.parameters.clone()),
        };
        let mut output = StepOutput::new(value);
        if let Some(title) = request.param_str("insight") {
            output = output.with_insight(
                Insight::new(title, Severity::Info, 0.5).with_category(AGENT_TYPE),
            );
        }
        Ok(output)
    }
}

pub struct Sleep;

impl StepExecutor for Sleep {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, StepError> {
        let ms = param_u64(request, "ms", 100)?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }).into())
    }
}

/// Counts attempts per `(query, step)` so reruns start fresh.
#[derive(Default)]
pub struct Flaky {
    attempts: Mutex<HashMap<String, u64>>,
}

impl StepExecutor for Flaky {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, StepError> {
        let failures = param_u64(request, "failures", 1)?;
        let key = format!("{}:{}", request.query_id, request.step_id);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let n = attempts.entry(key).or_insert(0);
            *n += 1;
            *n
        };
        if attempt <= failures {
            return Err(StepError::Execution(format!(
                "flaky failure {attempt} of {failures}"
            )));
        }
        Ok(json!({ "attempt": attempt }).into())
    }
}

pub struct Fail;

impl StepExecutor for Fail {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, StepError> {
        let message = request.param_str("message").unwrap_or("requested failure").to_string();
        Err(match request.param_str("kind").unwrap_or("execution") {
            "validation" => StepError::Validation(message),
            "timeout" => StepError::Timeout(message),
            "agent_failure" => StepError::AgentFailure(message),
            _ => StepError::Execution(message),
        })
    }
}

pub struct Merge;

impl StepExecutor for Merge {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutput, StepError> {
        let merged: Map<String, Value> = request
            .dependency_outputs()
            .into_iter()
            .map(|(id, value)| (id.to_string(), value.clone()))
            .collect();
        Ok(Value::Object(merged).into())
    }
}
