//! Loop prevention for the adaptive planner.
//!
//! `LoopGuard` tracks normalized action signatures and refuses an action
//! when it repeats one that was unproductive in the most recently executed
//! turn, or when the same signature has already run too many times in this
//! query.

use std::collections::{HashMap, HashSet};
use std::fmt;

use cadence_types::result::StepResult;
use cadence_types::thought::NextAction;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ActionSignature
// ---------------------------------------------------------------------------

/// Structural identity of an action: capability plus canonical parameters.
///
/// Capability names are trimmed and lowercased. Parameters are rendered as
/// JSON with sorted keys, so key order never distinguishes two actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionSignature(String);

impl ActionSignature {
    pub fn new(agent_type: &str, action: &str, parameters: &Map<String, Value>) -> Self {
        Self(format!(
            "{}/{}:{}",
            agent_type.trim().to_lowercase(),
            action.trim().to_lowercase(),
            canonical_json(&Value::Object(parameters.clone()))
        ))
    }

    pub fn of_action(action: &NextAction) -> Self {
        Self::new(&action.agent_type, &action.action, &action.parameters)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// JSON text with object keys sorted at every depth.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// LoopGuard
// ---------------------------------------------------------------------------

/// Result of checking an action against the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopCheck {
    Ok,
    /// Identical to an action of the latest executed turn whose result was
    /// failed or degenerate.
    RepeatsUnproductive { description: String },
    /// The signature already ran the maximum number of times.
    RepeatLimit { description: String },
}

impl LoopCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, LoopCheck::Ok)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            LoopCheck::Ok => None,
            LoopCheck::RepeatsUnproductive { description }
            | LoopCheck::RepeatLimit { description } => Some(description),
        }
    }
}

/// Per-query record of executed action signatures.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    executed: HashMap<ActionSignature, usize>,
    last_unproductive: HashSet<ActionSignature>,
    max_repeats: usize,
}

impl LoopGuard {
    /// Create a guard with the default limit of 3 executions per signature.
    pub fn new() -> Self {
        Self::with_threshold(3)
    }

    pub fn with_threshold(max_repeats: usize) -> Self {
        Self {
            executed: HashMap::new(),
            last_unproductive: HashSet::new(),
            max_repeats: max_repeats.max(1),
        }
    }

    /// Check a proposed action without registering it.
    pub fn check(&self, signature: &ActionSignature) -> LoopCheck {
        if self.last_unproductive.contains(signature) {
            return LoopCheck::RepeatsUnproductive {
                description: format!(
                    "action '{}' repeats the previous unproductive action",
                    signature
                ),
            };
        }
        let count = self.executed.get(signature).copied().unwrap_or(0);
        if count >= self.max_repeats {
            return LoopCheck::RepeatLimit {
                description: format!(
                    "action '{}' has already run {} times (threshold: {})",
                    signature, count, self.max_repeats
                ),
            };
        }
        LoopCheck::Ok
    }

    /// Register an action that is about to execute.
    pub fn register(&mut self, signature: &ActionSignature) {
        *self.executed.entry(signature.clone()).or_insert(0) += 1;
    }

    /// Start tracking outcomes for a newly executed turn, forgetting what
    /// the previous turn left unproductive.
    pub fn begin_turn(&mut self) {
        self.last_unproductive.clear();
    }

    /// Remember whether an action of the current turn was productive.
    pub fn record_outcome(&mut self, signature: &ActionSignature, result: &StepResult) {
        if result.is_unproductive() {
            self.last_unproductive.insert(signature.clone());
        } else {
            self.last_unproductive.remove(signature);
        }
    }

    pub fn times_executed(&self, signature: &ActionSignature) -> usize {
        self.executed.get(signature).copied().unwrap_or(0)
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use cadence_types::result::ErrorKind;
    use serde_json::json;

    fn sig(agent: &str, action: &str, params: Value) -> ActionSignature {
        let map = params.as_object().cloned().unwrap_or_default();
        ActionSignature::new(agent, action, &map)
    }

    fn ok(output: Value) -> StepResult {
        StepResult::succeeded("s", output, vec![], Duration::ZERO, 1)
    }

    fn failed() -> StepResult {
        StepResult::failed("s", ErrorKind::Execution, "boom", Duration::ZERO, 1)
    }

    #[test]
    fn signature_ignores_key_order_and_case() {
        let a = sig("Search", "Query ", json!({"q": "x", "limit": {"n": 1, "m": 2}}));
        let b = sig("search", "query", json!({"limit": {"m": 2, "n": 1}, "q": "x"}));
        assert_eq!(a, b);
        assert_ne!(a, sig("search", "query", json!({"q": "y"})));
    }

    #[test]
    fn first_occurrence_is_ok() {
        let guard = LoopGuard::new();
        assert!(guard.check(&sig("a", "b", json!({}))).is_ok());
    }

    #[test]
    fn repeat_limit_triggers_after_threshold() {
        let mut guard = LoopGuard::with_threshold(2);
        let s = sig("a", "b", json!({"k": 1}));
        for _ in 0..2 {
            assert!(guard.check(&s).is_ok());
            guard.register(&s);
            guard.record_outcome(&s, &ok(json!("fine")));
        }
        let check = guard.check(&s);
        assert!(matches!(check, LoopCheck::RepeatLimit { .. }));
        assert!(check.reason().unwrap().contains("threshold: 2"));
    }

    #[test]
    fn repeating_failed_action_is_rejected() {
        let mut guard = LoopGuard::new();
        let s = sig("a", "b", json!({}));
        guard.register(&s);
        guard.record_outcome(&s, &failed());
        assert!(matches!(guard.check(&s), LoopCheck::RepeatsUnproductive { .. }));
        // A different action is fine.
        assert!(guard.check(&sig("a", "c", json!({}))).is_ok());
    }

    #[test]
    fn repeating_degenerate_action_is_rejected() {
        let mut guard = LoopGuard::new();
        let s = sig("a", "b", json!({}));
        guard.register(&s);
        guard.record_outcome(&s, &ok(json!([])));
        assert!(!guard.check(&s).is_ok());
    }

    #[test]
    fn only_latest_turn_is_blocked() {
        let mut guard = LoopGuard::new();
        let a = sig("a", "b", json!({}));
        let b = sig("x", "y", json!({}));
        guard.begin_turn();
        guard.register(&a);
        guard.record_outcome(&a, &failed());
        guard.begin_turn();
        guard.register(&b);
        guard.record_outcome(&b, &failed());
        assert!(guard.check(&a).is_ok());
        assert!(!guard.check(&b).is_ok());
        assert_eq!(guard.times_executed(&a), 1);
    }

    #[test]
    fn productive_turn_unblocks_earlier_failure() {
        let mut guard = LoopGuard::new();
        let a = sig("a", "fetch", json!({"q": 1}));
        let b = sig("a", "echo", json!({}));
        guard.begin_turn();
        guard.register(&a);
        guard.record_outcome(&a, &failed());
        assert!(!guard.check(&a).is_ok());

        guard.begin_turn();
        guard.register(&b);
        guard.record_outcome(&b, &ok(json!("fine")));
        assert!(guard.check(&a).is_ok());
    }

    #[test]
    fn every_failure_in_a_batch_is_blocked() {
        let mut guard = LoopGuard::new();
        let a = sig("a", "b", json!({}));
        let b = sig("x", "y", json!({}));
        let c = sig("x", "z", json!({}));
        guard.begin_turn();
        for s in [&a, &b, &c] {
            guard.register(s);
        }
        guard.record_outcome(&a, &failed());
        guard.record_outcome(&b, &ok(json!({"n": 1})));
        guard.record_outcome(&c, &ok(json!(null)));
        assert!(!guard.check(&a).is_ok());
        assert!(guard.check(&b).is_ok());
        assert!(!guard.check(&c).is_ok());
    }
}
