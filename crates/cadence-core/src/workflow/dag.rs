//! Level builder: partitions a plan into waves of mutually independent steps.
//!
//! Each level contains every not-yet-leveled step whose dependencies all sit
//! in earlier levels. Step order inside a level follows plan insertion order,
//! so the partition is a pure function of the plan. An empty frontier with
//! steps still unleveled means the plan has a cycle; the builder then fails
//! without emitting any level. `petgraph` is used only to name the steps
//! that make up the cycle.

use std::collections::{HashMap, HashSet};

use cadence_types::plan::{ExecutionPlan, PlanStep};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Level computation
// ---------------------------------------------------------------------------

/// Partition a plan into ordered levels.
///
/// Returns `Vec<Vec<&PlanStep>>` where index 0 is the first level to execute.
/// Fails with `UnknownDependency` if a step references a missing ID, or
/// `CycleDetected` if the dependency relation is cyclic.
pub fn build_levels(plan: &ExecutionPlan) -> Result<Vec<Vec<&PlanStep>>, WorkflowError> {
    let ids: HashSet<&str> = plan.steps.iter().map(|s| s.step_id.as_str()).collect();
    for step in &plan.steps {
        if let Some(dep) = step.depends_on.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(WorkflowError::UnknownDependency(format!(
                "step '{}' depends on unknown step '{}'",
                step.step_id, dep
            )));
        }
    }

    let mut leveled: HashSet<&str> = HashSet::with_capacity(plan.len());
    let mut remaining: Vec<&PlanStep> = plan.steps.iter().collect();
    let mut levels: Vec<Vec<&PlanStep>> = Vec::new();

    while !remaining.is_empty() {
        let frontier: Vec<&PlanStep> = remaining
            .iter()
            .copied()
            .filter(|s| s.depends_on.iter().all(|d| leveled.contains(d.as_str())))
            .collect();

        if frontier.is_empty() {
            return Err(WorkflowError::CycleDetected(describe_cycle(plan, &remaining)));
        }

        // Leveled only after the frontier is fixed: same-level steps never
        // satisfy each other.
        for step in &frontier {
            leveled.insert(step.step_id.as_str());
        }
        remaining.retain(|s| !leveled.contains(s.step_id.as_str()));
        levels.push(frontier);
    }

    Ok(levels)
}

/// Validate that a plan forms a DAG (no cycles, all references exist).
pub fn validate_dag(plan: &ExecutionPlan) -> Result<(), WorkflowError> {
    build_levels(plan).map(|_| ())
}

/// Step IDs per level, owned.
pub fn level_ids(levels: &[Vec<&PlanStep>]) -> Vec<Vec<String>> {
    levels
        .iter()
        .map(|level| level.iter().map(|s| s.step_id.clone()).collect())
        .collect()
}

// ---------------------------------------------------------------------------
// Cycle reporting
// ---------------------------------------------------------------------------

/// Name the steps that form a cycle among the unleveled remainder.
fn describe_cycle(plan: &ExecutionPlan, remaining: &[&PlanStep]) -> String {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = remaining
        .iter()
        .map(|s| (s.step_id.as_str(), graph.add_node(s.step_id.as_str())))
        .collect();

    for step in remaining {
        let to = nodes[step.step_id.as_str()];
        for dep in &step.depends_on {
            if let Some(&from) = nodes.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    let position: HashMap<&str, usize> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.step_id.as_str(), i))
        .collect();

    let mut members: Vec<&str> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .flatten()
        .map(|idx| graph[idx])
        .collect();
    members.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));

    if members.is_empty() {
        format!("{} step(s) could not be scheduled", remaining.len())
    } else {
        let list: Vec<String> = members.iter().map(|id| format!("'{id}'")).collect();
        format!("cycle detected involving steps {}", list.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(id, "demo", "echo").with_depends_on(deps.iter().copied())
    }

    fn plan(steps: Vec<PlanStep>) -> ExecutionPlan {
        ExecutionPlan::with_steps("test", steps)
    }

    /// Every step appears exactly once, and each step's dependencies sit in
    /// strictly earlier levels.
    fn assert_valid_partition(plan: &ExecutionPlan, levels: &[Vec<&PlanStep>]) {
        let mut level_of: HashMap<&str, usize> = HashMap::new();
        for (i, level) in levels.iter().enumerate() {
            assert!(!level.is_empty(), "level {i} is empty");
            for s in level {
                assert!(
                    level_of.insert(s.step_id.as_str(), i).is_none(),
                    "step '{}' appears twice",
                    s.step_id
                );
            }
        }
        assert_eq!(level_of.len(), plan.len(), "levels must cover every step");
        for s in &plan.steps {
            let own = level_of[s.step_id.as_str()];
            for dep in &s.depends_on {
                assert!(
                    level_of[dep.as_str()] < own,
                    "dependency '{dep}' of '{}' is not in an earlier level",
                    s.step_id
                );
            }
        }
    }

    /// Deterministic pseudo-random DAG: each step may depend on earlier steps.
    fn generated_dag(n: usize, seed: u64) -> ExecutionPlan {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            state >> 33
        };
        let mut steps = Vec::with_capacity(n);
        for i in 0..n {
            let deps: Vec<String> = (0..i)
                .filter(|_| next() % 4 == 0)
                .map(|j| format!("s{j}"))
                .collect();
            steps.push(PlanStep::new(format!("s{i}"), "demo", "echo").with_depends_on(deps));
        }
        // Shuffle declaration order so forward declarations are exercised too.
        steps.reverse();
        plan(steps)
    }

    // -----------------------------------------------------------------------
    // Level computation
    // -----------------------------------------------------------------------

    #[test]
    fn test_no_dependencies_single_level() {
        let p = plan(vec![step("a", &[]), step("b", &[]), step("c", &[])]);
        let levels = build_levels(&p).unwrap();
        assert_eq!(level_ids(&levels), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_linear_chain_n_levels() {
        let p = plan(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        let levels = build_levels(&p).unwrap();
        assert_eq!(level_ids(&levels), vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_three_levels() {
        let p = plan(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]);
        let levels = build_levels(&p).unwrap();
        assert_eq!(level_ids(&levels), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_level_order_follows_insertion_order() {
        let p = plan(vec![
            step("root", &[]),
            step("zeta", &["root"]),
            step("alpha", &["root"]),
            step("mid", &["root"]),
        ]);
        let levels = build_levels(&p).unwrap();
        assert_eq!(levels[1].iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(), vec![
            "zeta", "alpha", "mid"
        ]);
    }

    #[test]
    fn test_forward_declared_dependency() {
        let p = plan(vec![step("b", &["a"]), step("a", &[])]);
        let levels = build_levels(&p).unwrap();
        assert_eq!(level_ids(&levels), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_complex_fork_join() {
        //     A
        //    / \
        //   B   C
        //   |   |
        //   D   E
        //    \ /
        //     F
        let p = plan(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b"]),
            step("e", &["c"]),
            step("f", &["d", "e"]),
        ]);
        let levels = build_levels(&p).unwrap();
        assert_eq!(levels.len(), 4);
        assert_eq!(levels[1].len(), 2);
        assert_eq!(levels[2].len(), 2);
        assert_eq!(levels[3][0].step_id, "f");
        assert_valid_partition(&p, &levels);
    }

    #[test]
    fn test_empty_plan_has_no_levels() {
        let empty = ExecutionPlan::empty("e");
        let levels = build_levels(&empty).unwrap();
        assert!(levels.is_empty());
    }

    #[test]
    fn test_generated_dags_partition_exactly_once() {
        for seed in 1..40u64 {
            let p = generated_dag(25, seed);
            let levels = build_levels(&p).unwrap();
            assert_valid_partition(&p, &levels);
        }
    }

    #[test]
    fn test_repeated_calls_are_identical() {
        let p = generated_dag(30, 7);
        let first = level_ids(&build_levels(&p).unwrap());
        for _ in 0..5 {
            assert_eq!(level_ids(&build_levels(&p).unwrap()), first);
        }
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[test]
    fn test_two_step_cycle_detected() {
        let p = plan(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = build_levels(&p).unwrap_err();
        assert!(err.is_cycle());
        let msg = err.to_string();
        assert!(msg.contains("'a'") && msg.contains("'b'"), "got: {msg}");
    }

    #[test]
    fn test_cycle_behind_valid_prefix_emits_no_levels() {
        let p = plan(vec![
            step("root", &[]),
            step("x", &["root", "z"]),
            step("y", &["x"]),
            step("z", &["y"]),
            step("tail", &["z"]),
        ]);
        let err = build_levels(&p).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'x'") && msg.contains("'y'") && msg.contains("'z'"));
        assert!(!msg.contains("'tail'"), "downstream steps are not cycle members");
        assert!(!msg.contains("'root'"));
    }

    #[test]
    fn test_unknown_dependency() {
        let p = plan(vec![step("a", &["missing"])]);
        let err = build_levels(&p).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency(_)));
        assert!(validate_dag(&p).is_err());
    }

    #[test]
    fn test_validate_dag_valid() {
        let p = plan(vec![step("a", &[]), step("b", &["a"])]);
        assert!(validate_dag(&p).is_ok());
    }
}
