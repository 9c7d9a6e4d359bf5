//! Step executor contract.
//!
//! A `StepExecutor` is the capability that actually performs one step: an
//! agent, a tool, or a deterministic transform. The engine never interprets
//! outputs; it only routes `StepRequest`s to executors and records what
//! comes back.
//!
//! Follows the blanket-impl pattern used for dynamic dispatch elsewhere:
//! 1. `StepExecutor` uses native async fn in traits (not object-safe)
//! 2. `StepExecutorDyn` is the object-safe mirror with boxed futures
//! 3. `BoxStepExecutor` wraps `Arc<dyn StepExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cadence_types::insight::Insight;
use cadence_types::plan::PlanStep;
use cadence_types::result::ErrorKind;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::context::PriorOutputs;

// ---------------------------------------------------------------------------
// StepRequest / StepOutput
// ---------------------------------------------------------------------------

/// Everything an executor is given for one attempt.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub query_id: Uuid,
    pub query: String,
    pub step_id: String,
    pub agent_type: String,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub depends_on: Vec<String>,
    /// Results recorded before this step's level started.
    pub prior: PriorOutputs,
}

impl StepRequest {
    /// Build a request for a plan step.
    pub fn for_step(query_id: Uuid, query: &str, step: &PlanStep, prior: PriorOutputs) -> Self {
        Self {
            query_id,
            query: query.to_string(),
            step_id: step.step_id.clone(),
            agent_type: step.agent_type.clone(),
            action: step.action.clone(),
            parameters: step.parameters.clone(),
            depends_on: step.depends_on.clone(),
            prior,
        }
    }

    /// A string parameter, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Outputs of this step's dependencies that succeeded.
    pub fn dependency_outputs(&self) -> Vec<(&str, &Value)> {
        self.prior.successful_outputs(&self.depends_on)
    }
}

/// Output from a successful step execution.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub value: Value,
    pub insights: Vec<Insight>,
}

impl StepOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            insights: Vec::new(),
        }
    }

    pub fn with_insight(mut self, insight: Insight) -> Self {
        self.insights.push(insight);
        self
    }
}

impl From<Value> for StepOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors an executor can raise. Each maps onto one `ErrorKind`.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The request is malformed; retrying cannot help.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The executor ran and failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The executor gave up waiting on something external.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The executor itself is broken (crashed, misconfigured).
    #[error("agent failure: {0}")]
    AgentFailure(String),
}

impl StepError {
    /// The recorded error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Validation(_) => ErrorKind::Validation,
            StepError::Execution(_) => ErrorKind::Execution,
            StepError::Timeout(_) => ErrorKind::Timeout,
            StepError::AgentFailure(_) => ErrorKind::AgentFailure,
        }
    }

    /// The message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            StepError::Validation(m)
            | StepError::Execution(m)
            | StepError::Timeout(m)
            | StepError::AgentFailure(m) => m,
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// A capability that performs one step.
///
/// Uses native async fn in traits (Rust 2024 edition, RPITIT).
/// Use [`BoxStepExecutor`] when storing heterogeneous executors.
pub trait StepExecutor: Send + Sync + 'static {
    /// Perform one attempt of a step.
    fn execute(
        &self,
        request: &StepRequest,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        request: &'a StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        request: &'a StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepError>> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

/// Type-erased, cheaply clonable step executor.
#[derive(Clone)]
pub struct BoxStepExecutor {
    inner: Arc<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn execute(&self, request: &StepRequest) -> Result<StepOutput, StepError> {
        self.inner.execute_boxed(request).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}

/// Adapter turning an async closure into a `StepExecutor`.
///
/// Mostly useful in tests and for small deterministic transforms.
pub struct FnExecutor<F>(pub F);

impl<F, Fut> StepExecutor for FnExecutor<F>
where
    F: Fn(StepRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send,
{
    fn execute(
        &self,
        request: &StepRequest,
    ) -> impl Future<Output = Result<StepOutput, StepError>> + Send {
        (self.0)(request.clone())
    }
}
