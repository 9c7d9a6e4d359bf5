//! Plan definition parsing and validation.
//!
//! Converts between YAML files and the canonical `ExecutionPlan`, validates
//! structural constraints (unique IDs, known dependencies), and enforces the
//! append-only growth rule used by the adaptive planner.

use std::collections::HashSet;

use cadence_types::plan::{ExecutionPlan, PlanStep};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Plan-level errors. Any of these aborts a run before a step executes.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// I/O failure while reading or writing a plan.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Two steps share an ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStep(String),

    /// An appended step references a step not yet in the plan.
    #[error("step '{step_id}' depends on '{dependency}', which is not yet in the plan")]
    ForwardReference { step_id: String, dependency: String },
}

impl WorkflowError {
    /// Whether this is the dependency-cycle error.
    pub fn is_cycle(&self) -> bool {
        matches!(self, WorkflowError::CycleDetected(_))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `ExecutionPlan`.
///
/// Runs `validate_plan` after deserialization. Cycles are not checked here;
/// the level builder reports them.
pub fn parse_plan_yaml(yaml: &str) -> Result<ExecutionPlan, WorkflowError> {
    let plan: ExecutionPlan =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Serialize an `ExecutionPlan` to a YAML string.
pub fn serialize_plan_yaml(plan: &ExecutionPlan) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(plan).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a static `ExecutionPlan`.
///
/// Checks:
/// - At least one step exists
/// - Step IDs are non-empty and unique
/// - Capability selectors are non-empty
/// - All `depends_on` references point to existing step IDs
/// - No step depends on itself
///
/// Static plans may reference steps declared later in the list.
pub fn validate_plan(plan: &ExecutionPlan) -> Result<(), WorkflowError> {
    if plan.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "plan must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &plan.steps {
        validate_step_fields(step)?;
        if !seen_ids.insert(step.step_id.as_str()) {
            return Err(WorkflowError::DuplicateStep(step.step_id.clone()));
        }
    }

    for step in &plan.steps {
        for dep in &step.depends_on {
            if dep == &step.step_id {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' depends on itself",
                    step.step_id
                )));
            }
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.step_id, dep
                )));
            }
        }
    }

    Ok(())
}

fn validate_step_fields(step: &PlanStep) -> Result<(), WorkflowError> {
    if step.step_id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "step ID must not be empty".to_string(),
        ));
    }
    if step.agent_type.trim().is_empty() || step.action.trim().is_empty() {
        return Err(WorkflowError::ValidationError(format!(
            "step '{}' must name both agent_type and action",
            step.step_id
        )));
    }
    if step.timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(format!(
            "step '{}' timeout must be > 0",
            step.step_id
        )));
    }
    Ok(())
}

/// Append a step to a growing plan.
///
/// Every dependency must already be in the plan, so an append-only plan can
/// never contain a cycle.
pub fn append_step(plan: &mut ExecutionPlan, step: PlanStep) -> Result<(), WorkflowError> {
    validate_step_fields(&step)?;
    if plan.contains(&step.step_id) {
        return Err(WorkflowError::DuplicateStep(step.step_id));
    }
    if let Some(dep) = step.depends_on.iter().find(|d| !plan.contains(d)) {
        return Err(WorkflowError::ForwardReference {
            step_id: step.step_id.clone(),
            dependency: dep.clone(),
        });
    }
    plan.steps.push(step);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
