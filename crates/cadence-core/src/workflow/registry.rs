//! Executor registry: maps capability selectors to step executors.
//!
//! Lookup is by exact `(agent_type, action)` first, then by an
//! `agent_type`-wide wildcard registered with `register_wildcard`.

use std::collections::HashMap;

use super::step::{BoxStepExecutor, StepExecutor};

#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    exact: HashMap<(String, String), BoxStepExecutor>,
    wildcard: HashMap<String, BoxStepExecutor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for one `(agent_type, action)` pair.
    ///
    /// Replaces any executor previously registered for the same pair.
    pub fn register<E: StepExecutor>(
        &mut self,
        agent_type: impl Into<String>,
        action: impl Into<String>,
        executor: E,
    ) -> &mut Self {
        self.register_boxed(agent_type, action, BoxStepExecutor::new(executor))
    }

    pub fn register_boxed(
        &mut self,
        agent_type: impl Into<String>,
        action: impl Into<String>,
        executor: BoxStepExecutor,
    ) -> &mut Self {
        self.exact
            .insert((agent_type.into(), action.into()), executor);
        self
    }

    /// Register an executor for every action of an agent type.
    pub fn register_wildcard<E: StepExecutor>(
        &mut self,
        agent_type: impl Into<String>,
        executor: E,
    ) -> &mut Self {
        self.wildcard
            .insert(agent_type.into(), BoxStepExecutor::new(executor));
        self
    }

    /// Find the executor for a capability.
    pub fn resolve(&self, agent_type: &str, action: &str) -> Option<BoxStepExecutor> {
        self.exact
            .get(&(agent_type.to_string(), action.to_string()))
            .or_else(|| self.wildcard.get(agent_type))
            .cloned()
    }

    pub fn contains(&self, agent_type: &str, action: &str) -> bool {
        self.exact
            .contains_key(&(agent_type.to_string(), action.to_string()))
            || self.wildcard.contains_key(agent_type)
    }

    /// Registered capabilities as sorted `agent_type/action` strings.
    /// Wildcards are listed as `agent_type/*`.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .exact
            .keys()
            .map(|(a, b)| format!("{a}/{b}"))
            .chain(self.wildcard.keys().map(|a| format!("{a}/*")))
            .collect();
        caps.sort();
        caps
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
