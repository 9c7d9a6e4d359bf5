//! Scripted planner for `cadence adapt`.
//!
//! A script is a YAML file of pre-written planner turns. Each consultation
//! pops the next turn; once the script is exhausted the planner proposes
//! nothing and the run completes. Rejected proposals are not retried: the
//! script simply moves on.
//!
//! ```yaml
//! query: summarize the feed
//! complete_when: report
//! turns:
//!   - rationale: fetch the feed first
//!     actions:
//!       - step_id: fetch
//!         agent_type: demo
//!         action: echo
//!         parameters: { value: [1, 2, 3] }
//! ```

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use cadence_core::workflow::adaptive::{Planner, PlannerError, PlannerInput};
use cadence_core::workflow::context::ContextSnapshot;
use cadence_types::thought::{NextAction, PlannerTurn, ThoughtStep};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedTurn {
    pub rationale: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub expected_outcome: String,
    #[serde(default)]
    pub actions: Vec<NextAction>,
}

impl ScriptedTurn {
    fn into_turn(self) -> PlannerTurn {
        PlannerTurn {
            thought: ThoughtStep::new(self.rationale)
                .with_alternatives(self.alternatives)
                .with_expected_outcome(self.expected_outcome),
            actions: self.actions,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerScript {
    #[serde(default)]
    pub query: Option<String>,
    /// The run is complete once this step has succeeded.
    #[serde(default)]
    pub complete_when: Option<String>,
    pub turns: Vec<ScriptedTurn>,
}

impl PlannerScript {
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml).context("Failed to parse planner script")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content)
    }
}

pub struct ScriptedPlanner {
    turns: VecDeque<ScriptedTurn>,
    complete_when: Option<String>,
}

impl ScriptedPlanner {
    pub fn new(script: PlannerScript) -> Self {
        Self {
            turns: script.turns.into(),
            complete_when: script.complete_when,
        }
    }

    pub fn remaining(&self) -> usize {
        self.turns.len()
    }
}

impl Planner for ScriptedPlanner {
    async fn next_turn(&mut self, input: &PlannerInput) -> Result<PlannerTurn, PlannerError> {
        if let Some(rejected) = &input.rejected {
            tracing::info!(
                capability = %rejected.action.capability(),
                reason = %rejected.reason,
                "scripted action rejected, moving on"
            );
        }
        Ok(match self.turns.pop_front() {
            Some(turn) => turn.into_turn(),
            None => PlannerTurn {
                thought: ThoughtStep::new("script exhausted"),
                actions: Vec::new(),
            },
        })
    }

    fn is_complete(&self, snapshot: &ContextSnapshot) -> bool {
        self.complete_when
            .as_ref()
            .is_some_and(|id| snapshot.completed_steps.contains(id))
    }
}
