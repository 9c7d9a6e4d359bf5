//! Plan model: steps with declared dependencies and per-step retry policy.
//!
//! An `ExecutionPlan` is either fully specified up front (static mode) or
//! grown one step at a time by the adaptive planner. Structural validation
//! (unique ids, known dependencies, no forward references) lives in
//! `cadence-core`; these are plain data types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::result::ErrorKind;

// ---------------------------------------------------------------------------
// PlanStep
// ---------------------------------------------------------------------------

/// A single unit of work in a plan.
///
/// `agent_type` + `action` select the executor capability; `parameters`
/// is an opaque payload handed to that executor untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique identifier within the plan.
    #[serde(alias = "id")]
    pub step_id: String,
    /// Capability family (e.g. "sentiment", "retrieval").
    pub agent_type: String,
    /// Capability within the family (e.g. "score", "fetch").
    pub action: String,
    /// Opaque key-value payload for the executor.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// IDs of steps whose results this step reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Adaptive mode only: the planner marked this as the last action.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_final: bool,
    /// Per-attempt timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Per-step retry override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl PlanStep {
    /// Create a step with no parameters and no dependencies.
    pub fn new(
        step_id: impl Into<String>,
        agent_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            agent_type: agent_type.into(),
            action: action.into(),
            parameters: Map::new(),
            depends_on: Vec::new(),
            is_final: false,
            timeout_secs: None,
            retry: None,
        }
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

    /// Declare dependencies on earlier steps.
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set a per-attempt timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Set a per-step retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// `agent_type/action`, used in logs and error messages.
    pub fn capability(&self) -> String {
        format!("{}/{}", self.agent_type, self.action)
    }
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

/// Ordered collection of plan steps.
///
/// Insertion order is significant: the level builder uses it to order
/// steps inside one level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Human-readable plan name.
    #[serde(default)]
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in insertion order.
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Create an empty plan (adaptive mode starting point).
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    /// Create a plan from a fixed list of steps.
    pub fn with_steps(name: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step by ID.
    pub fn get(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Whether a step with this ID exists.
    pub fn contains(&self, step_id: &str) -> bool {
        self.get(step_id).is_some()
    }

    /// Step IDs in insertion order.
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_id.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

/// Bounded retry policy with exponential backoff.
///
/// `max_retries` is the total number of attempts, including the first one.
/// The delay before attempt `n` (n >= 2) is
/// `initial_delay_ms * backoff_factor^(n-2)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts allowed (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the second attempt, in milliseconds (default 500).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied per subsequent attempt (default 2.0).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in milliseconds (default 30s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Error kinds that are worth another attempt.
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorKind>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_retryable() -> Vec<ErrorKind> {
    vec![ErrorKind::Execution, ErrorKind::Timeout]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
            retryable: default_retryable(),
        }
    }
}

impl RetryConfig {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    /// Whether errors of this kind may be retried under this policy.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay_ms, 500);
        assert!((config.backoff_factor - 2.0).abs() < f64::EPSILON);
        assert!(config.is_retryable(ErrorKind::Execution));
        assert!(config.is_retryable(ErrorKind::Timeout));
        assert!(!config.is_retryable(ErrorKind::Validation));
        assert!(!config.is_retryable(ErrorKind::AgentFailure));
    }

    #[test]
    fn test_retry_config_partial_toml() {
        let config: RetryConfig = toml::from_str("max_retries = 5").unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_delay_ms, 500);
        assert_eq!(config.retryable, vec![ErrorKind::Execution, ErrorKind::Timeout]);
    }

    #[test]
    fn test_plan_step_yaml_accepts_id_alias() {
        let yaml = r#"
id: fetch
agent_type: retrieval
action: fetch
parameters:
  source: reviews
depends_on: []
"#;
        let step: PlanStep = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.step_id, "fetch");
        assert_eq!(step.parameters["source"], json!("reviews"));
        assert!(!step.is_final);
    }

    #[test]
    fn test_with_parameters_wraps_scalars() {
        let step = PlanStep::new("a", "demo", "echo").with_parameters(json!(42));
        assert_eq!(step.parameters["value"], json!(42));

        let step = PlanStep::new("b", "demo", "echo").with_parameters(json!({"k": "v"}));
        assert_eq!(step.parameters["k"], json!("v"));
    }

    #[test]
    fn test_plan_lookup_and_order() {
        let plan = ExecutionPlan::with_steps(
            "p",
            vec![
                PlanStep::new("a", "demo", "echo"),
                PlanStep::new("b", "demo", "echo").with_depends_on(["a"]),
            ],
        );
        assert_eq!(plan.step_ids(), vec!["a", "b"]);
        assert!(plan.contains("b"));
        assert_eq!(plan.get("b").unwrap().depends_on, vec!["a".to_string()]);
        assert!(plan.get("c").is_none());
    }
}
