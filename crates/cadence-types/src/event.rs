//! Lifecycle events for the Cadence event bus.
//!
//! `EngineEvent` is broadcast during plan execution for telemetry, UI
//! progress and audit logging. All variants are Clone + Send + Sync for use
//! with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::{RunStatus, StepResult};
use crate::thought::{TerminationReason, ThoughtStep};

/// Which driver produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Fixed plan executed level by level.
    Static,
    /// Plan grown by the ReAct planning loop.
    Adaptive,
}

/// Events emitted while a plan executes.
///
/// Publishing is fire-and-forget: a slow or absent subscriber never blocks
/// step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run has started.
    RunStarted {
        query_id: Uuid,
        plan_name: String,
        mode: RunMode,
        /// Steps known at start (0 for adaptive runs).
        steps: usize,
    },

    /// A level of mutually independent steps is about to be dispatched.
    LevelStarted {
        query_id: Uuid,
        level: usize,
        step_ids: Vec<String>,
    },

    /// A step's first attempt is starting.
    StepStarted {
        query_id: Uuid,
        step_id: String,
        capability: String,
    },

    /// A step attempt failed with a retryable error; another attempt follows.
    StepRetrying {
        query_id: Uuid,
        step_id: String,
        /// The attempt about to be made (2-based).
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A step has resolved (successfully or not) and was recorded.
    StepResolved { query_id: Uuid, result: StepResult },

    /// The adaptive planner produced a thought.
    ThoughtRecorded { query_id: Uuid, thought: ThoughtStep },

    /// The loop guard refused a proposed action.
    ActionRejected {
        query_id: Uuid,
        capability: String,
        reason: String,
    },

    /// A run has finished.
    RunFinished {
        query_id: Uuid,
        status: RunStatus,
        completed: usize,
        failed: usize,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        termination: Option<TerminationReason>,
    },
}

impl EngineEvent {
    /// The query this event belongs to.
    pub fn query_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { query_id, .. }
            | EngineEvent::LevelStarted { query_id, .. }
            | EngineEvent::StepStarted { query_id, .. }
            | EngineEvent::StepRetrying { query_id, .. }
            | EngineEvent::StepResolved { query_id, .. }
            | EngineEvent::ThoughtRecorded { query_id, .. }
            | EngineEvent::ActionRejected { query_id, .. }
            | EngineEvent::RunFinished { query_id, .. } => *query_id,
        }
    }

    /// The step ID from step-scoped variants, or None for run-scoped events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            EngineEvent::StepStarted { step_id, .. }
            | EngineEvent::StepRetrying { step_id, .. } => Some(step_id),
            EngineEvent::StepResolved { result, .. } => Some(&result.step_id),

            EngineEvent::RunStarted { .. }
            | EngineEvent::LevelStarted { .. }
            | EngineEvent::ThoughtRecorded { .. }
            | EngineEvent::ActionRejected { .. }
            | EngineEvent::RunFinished { .. } => None,
        }
    }

    /// Whether an audit log should persist this event.
    pub fn is_auditable(&self) -> bool {
        matches!(
            self,
            EngineEvent::StepResolved { .. }
                | EngineEvent::ThoughtRecorded { .. }
                | EngineEvent::ActionRejected { .. }
                | EngineEvent::RunFinished { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::result::ErrorKind;

    #[test]
    fn test_step_resolved_serde_roundtrip() {
        let query_id = Uuid::now_v7();
        let event = EngineEvent::StepResolved {
            query_id,
            result: StepResult::failed("fetch", ErrorKind::Timeout, "slow", Duration::from_millis(5), 3),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_resolved\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.query_id(), query_id);
        assert_eq!(parsed.step_id(), Some("fetch"));
    }

    #[test]
    fn test_run_finished_omits_missing_termination() {
        let event = EngineEvent::RunFinished {
            query_id: Uuid::nil(),
            status: RunStatus::PartialSuccess,
            completed: 3,
            failed: 2,
            duration_ms: 40,
            termination: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("partial_success"));
        assert!(!json.contains("termination"));
        assert!(event.step_id().is_none());
        assert!(event.is_auditable());
    }

    #[test]
    fn test_progress_events_are_not_audited() {
        let event = EngineEvent::StepStarted {
            query_id: Uuid::nil(),
            step_id: "a".to_string(),
            capability: "demo/echo".to_string(),
        };
        assert!(!event.is_auditable());
        assert_eq!(event.step_id(), Some("a"));
    }
}
