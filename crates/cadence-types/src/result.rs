//! Step results and the error-kind taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::insight::Insight;

/// Classification of a step failure.
///
/// The retry coordinator decides whether to re-attempt purely from the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed plan or parameters. Never retried.
    Validation,
    /// Step-internal failure.
    Execution,
    /// Step exceeded its time budget.
    Timeout,
    /// Unexpected fault (panic) inside a step executor.
    AgentFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Execution => "execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AgentFailure => "agent_failure",
        };
        f.write_str(s)
    }
}

/// Error details carried by a failed `StepResult`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one step after all attempts. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    /// Executor output; `Value::Null` on failure.
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    /// Wall time across all attempts, including backoff.
    pub duration_ms: u64,
    /// Number of executor invocations made (0 when served from cache).
    pub attempts: u32,
    /// Findings contributed by the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insights: Vec<Insight>,
}

impl StepResult {
    /// Build a successful result.
    pub fn succeeded(
        step_id: impl Into<String>,
        output: Value,
        insights: Vec<Insight>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            output,
            error: None,
            duration_ms: duration.as_millis() as u64,
            attempts,
            insights,
        }
    }

    /// Build a failed result.
    pub fn failed(
        step_id: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            output: Value::Null,
            error: Some(StepFailure {
                kind,
                message: message.into(),
            }),
            duration_ms: duration.as_millis() as u64,
            attempts,
            insights: Vec::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// The error kind, if the step failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// A successful result whose output carries nothing usable:
    /// null, an empty string, an empty array or an empty object.
    pub fn is_degenerate(&self) -> bool {
        if !self.success {
            return false;
        }
        match &self.output {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        }
    }

    /// Failed, or succeeded with a degenerate output.
    pub fn is_unproductive(&self) -> bool {
        !self.success || self.is_degenerate()
    }
}

/// Resolution state of a step inside an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

/// Overall outcome of one plan execution.
///
/// Partial success is a normal outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every resolved step succeeded.
    Succeeded,
    /// Some steps succeeded, some failed.
    PartialSuccess,
    /// Every resolved step failed (or nothing ran).
    Failed,
    /// Stopped by cancellation before the plan fully resolved.
    Cancelled,
}

impl RunStatus {
    /// Derive a status from resolved step counts.
    pub fn from_counts(completed: usize, failed: usize) -> Self {
        match (completed, failed) {
            (0, _) => RunStatus::Failed,
            (_, 0) => RunStatus::Succeeded,
            _ => RunStatus::PartialSuccess,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failed_result_has_null_output() {
        let r = StepResult::failed("a", ErrorKind::Timeout, "slow", Duration::from_millis(12), 3);
        assert!(!r.success);
        assert_eq!(r.output, Value::Null);
        assert_eq!(r.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(r.duration_ms, 12);
        assert_eq!(r.error.as_ref().unwrap().to_string(), "timeout: slow");
    }

    #[test]
    fn test_degenerate_outputs() {
        let ok = |v: Value| StepResult::succeeded("a", v, vec![], Duration::ZERO, 1);
        assert!(ok(Value::Null).is_degenerate());
        assert!(ok(json!("   ")).is_degenerate());
        assert!(ok(json!([])).is_degenerate());
        assert!(ok(json!({})).is_degenerate());
        assert!(!ok(json!(0)).is_degenerate());
        assert!(!ok(json!({"score": 0.4})).is_degenerate());
    }

    #[test]
    fn test_failure_is_unproductive_but_not_degenerate() {
        let r = StepResult::failed("a", ErrorKind::Execution, "boom", Duration::ZERO, 1);
        assert!(!r.is_degenerate());
        assert!(r.is_unproductive());
    }

    #[test]
    fn test_run_status_from_counts() {
        assert_eq!(RunStatus::from_counts(3, 0), RunStatus::Succeeded);
        assert_eq!(RunStatus::from_counts(3, 2), RunStatus::PartialSuccess);
        assert_eq!(RunStatus::from_counts(0, 2), RunStatus::Failed);
        assert_eq!(RunStatus::from_counts(0, 0), RunStatus::Failed);
    }

    #[test]
    fn test_error_kind_serde_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AgentFailure).unwrap();
        assert_eq!(json, "\"agent_failure\"");
        let parsed: ErrorKind = serde_json::from_str("\"timeout\"").unwrap();
        assert_eq!(parsed, ErrorKind::Timeout);
    }
}
