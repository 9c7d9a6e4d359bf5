//! `cadence run` and `cadence adapt`: execute a plan or a scripted adaptive
//! run with the built-in executors.
//!
//! Progress lines and the audit log are fed from the orchestrator's event bus.
//! Both side tasks end once the orchestrator (the last bus sender) is dropped.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cadence_core::workflow::context::ExecutionContext;
use cadence_core::workflow::executor::{ExecutionResult, Orchestrator, OrchestratorError};
use cadence_infra::audit::{spawn_audit_writer, AuditSummary};
use cadence_infra::filesystem::audit_dir;
use cadence_types::event::EngineEvent;
use cadence_types::plan::ExecutionPlan;
use cadence_types::result::RunStatus;

use super::plan::load_plan;
use super::render::print_execution;
use super::script::{PlannerScript, ScriptedPlanner};

/// How a run should be reported.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn shows_progress(self) -> bool {
        !self.json && !self.quiet
    }
}

/// Where (if anywhere) to write the audit log for `query_id`.
fn audit_path(data_dir: &Path, audit: Option<Option<PathBuf>>, query_id: Uuid) -> Option<PathBuf> {
    audit.map(|explicit| explicit.unwrap_or_else(|| audit_dir(data_dir).join(format!("{query_id}.jsonl"))))
}

/// Event-bus subscribers running alongside one execution.
struct Sidecars {
    audit: Option<(PathBuf, JoinHandle<AuditSummary>)>,
    progress: Option<JoinHandle<()>>,
}

impl Sidecars {
    fn start(orchestrator: &Orchestrator, audit: Option<PathBuf>, progress: bool) -> Self {
        let events = orchestrator.events();
        Self {
            audit: audit.map(|path| {
                let handle = spawn_audit_writer(events.subscribe(), path.clone());
                (path, handle)
            }),
            progress: progress.then(|| spawn_progress(events.subscribe())),
        }
    }

    /// Wait for both side tasks. Call after the orchestrator is dropped.
    async fn finish(self) -> Option<(PathBuf, AuditSummary)> {
        if let Some(progress) = self.progress {
            let _ = progress.await;
        }
        match self.audit {
            Some((path, handle)) => match handle.await {
                Ok(summary) => Some((path, summary)),
                Err(e) => {
                    tracing::warn!(error = %e, "audit writer task failed");
                    None
                }
            },
            None => None,
        }
    }
}

fn spawn_progress(
    mut receiver: tokio::sync::broadcast::Receiver<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => print_progress(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_progress(event: &EngineEvent) {
    match event {
        EngineEvent::LevelStarted { level, step_ids, .. } => {
            eprintln!(
                "  {}",
                style(format!("level {}: {}", level + 1, step_ids.join(", "))).dim()
            );
        }
        EngineEvent::StepRetrying {
            step_id,
            next_attempt,
            delay_ms,
            error,
            ..
        } => {
            eprintln!(
                "  {} {step_id} retrying (attempt {next_attempt} in {delay_ms}ms): {error}",
                style("~").yellow()
            );
        }
        EngineEvent::StepResolved { result, .. } => match &result.error {
            None => eprintln!(
                "  {} {} ({}ms)",
                style("+").green(),
                result.step_id,
                result.duration_ms
            ),
            Some(failure) => eprintln!(
                "  {} {}: {failure}",
                style("x").red(),
                result.step_id
            ),
        },
        EngineEvent::ThoughtRecorded { thought, .. } => {
            eprintln!(
                "  {} {}",
                style(format!("[{}]", thought.iteration)).cyan(),
                thought.rationale
            );
        }
        EngineEvent::ActionRejected {
            capability, reason, ..
        } => {
            eprintln!("  {} {capability} rejected: {reason}", style("!").yellow());
        }
        _ => {}
    }
}

/// Cancel the returned token on Ctrl-C. The current level still finishes.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current level");
            child.cancel();
        }
    });
    token
}

/// Execute `plan` and collect the audit summary.
async fn execute_static(
    orchestrator: Orchestrator,
    ctx: ExecutionContext,
    audit: Option<PathBuf>,
    output: Output,
    cancel: &CancellationToken,
) -> Result<(ExecutionResult, Option<(PathBuf, AuditSummary)>), OrchestratorError> {
    let sidecars = Sidecars::start(&orchestrator, audit, output.shows_progress());
    let result = orchestrator.execute_plan(ctx.shared(), cancel).await;
    drop(orchestrator);
    let audit = sidecars.finish().await;
    Ok((result?, audit))
}

async fn execute_adaptive(
    orchestrator: Orchestrator,
    ctx: ExecutionContext,
    script: PlannerScript,
    audit: Option<PathBuf>,
    output: Output,
    cancel: &CancellationToken,
) -> (ExecutionResult, Option<(PathBuf, AuditSummary)>) {
    let sidecars = Sidecars::start(&orchestrator, audit, output.shows_progress());
    let result = {
        let mut runner = orchestrator.adaptive(ScriptedPlanner::new(script));
        runner.run(ctx.shared(), cancel).await
    };
    drop(orchestrator);
    (result, sidecars.finish().await)
}

fn report(
    result: &ExecutionResult,
    audit: Option<(PathBuf, AuditSummary)>,
    output: Output,
) -> Result<()> {
    if output.json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if !output.quiet {
        print_execution(result);
        if let Some((path, summary)) = &audit {
            println!(
                "  Audit: {} event(s) written to {}",
                summary.written,
                style(path.display()).dim()
            );
            println!();
        }
    }

    match result.status {
        RunStatus::Failed => bail!("Run failed: no step succeeded"),
        RunStatus::Cancelled => bail!("Run cancelled"),
        RunStatus::Succeeded | RunStatus::PartialSuccess => Ok(()),
    }
}

fn default_query(plan: &ExecutionPlan) -> String {
    plan.description
        .clone()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| plan.name.clone())
}

pub async fn handle_run(
    orchestrator: Orchestrator,
    data_dir: &Path,
    reference: &str,
    query: Option<String>,
    audit: Option<Option<PathBuf>>,
    output: Output,
) -> Result<()> {
    let plan = load_plan(data_dir, reference).await?;
    let query = query.unwrap_or_else(|| default_query(&plan));
    let ctx = ExecutionContext::new(query, plan);
    let audit = audit_path(data_dir, audit, ctx.query_id());

    let (result, audit) = execute_static(orchestrator, ctx, audit, output, &cancel_on_ctrl_c())
        .await
        .map_err(|e| match e {
            OrchestratorError::UnknownCapability(caps) => anyhow::anyhow!(
                "No executor registered for: {} (see `cadence capabilities`)",
                caps.join(", ")
            ),
            other => anyhow::Error::new(other).context("Plan is not executable"),
        })?;
    report(&result, audit, output)
}

pub async fn handle_adapt(
    orchestrator: Orchestrator,
    data_dir: &Path,
    script_path: &Path,
    query: Option<String>,
    audit: Option<Option<PathBuf>>,
    output: Output,
) -> Result<()> {
    let script = PlannerScript::load(script_path).await?;
    let query = query
        .or_else(|| script.query.clone())
        .unwrap_or_else(|| "adaptive run".to_string());
    let ctx = ExecutionContext::for_query(query);
    let audit = audit_path(data_dir, audit, ctx.query_id());

    let (result, audit) =
        execute_adaptive(orchestrator, ctx, script, audit, output, &cancel_on_ctrl_c()).await;
    report(&result, audit, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::builtin::builtin_registry;
    use cadence_infra::audit::read_audit_log;
    use cadence_types::config::EngineConfig;
    use cadence_types::plan::PlanStep;
    use serde_json::json;
    use tempfile::TempDir;

    const SILENT: Output = Output {
        json: true,
        quiet: true,
    };

    fn orchestrator() -> Orchestrator {
        let mut config = EngineConfig::default();
        config.retry.initial_delay_ms = 1;
        Orchestrator::new(config, builtin_registry())
    }

    #[test]
    fn audit_path_defaults_to_data_dir() {
        let id = Uuid::now_v7();
        let root = Path::new("/data");
        assert_eq!(audit_path(root, None, id), None);
        assert_eq!(
            audit_path(root, Some(None), id),
            Some(root.join("audit").join(format!("{id}.jsonl")))
        );
        assert_eq!(
            audit_path(root, Some(Some(PathBuf::from("x.jsonl"))), id),
            Some(PathBuf::from("x.jsonl"))
        );
    }

    #[tokio::test]
    async fn static_run_writes_audit_log() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run.jsonl");
        let plan = ExecutionPlan::with_steps(
            "flow",
            vec![
                PlanStep::new("a", "demo", "echo").with_parameters(json!({"value": "x"})),
                PlanStep::new("b", "demo", "flaky").with_parameters(json!({"failures": 1})),
                PlanStep::new("c", "demo", "merge").with_depends_on(["a", "b"]),
            ],
        );
        let ctx = ExecutionContext::new("flow", plan);

        let (result, audit) = execute_static(
            orchestrator(),
            ctx,
            Some(path.clone()),
            SILENT,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.status, RunStatus::Succeeded);
        assert_eq!(result.outputs["b"].attempts, 2);
        assert_eq!(result.outputs["c"].output, json!({"a": "x", "b": {"attempt": 2}}));

        let (written_to, summary) = audit.unwrap();
        assert_eq!(written_to, path);
        // three resolved steps plus the run summary
        assert_eq!(summary.written, 4);
        let records = read_audit_log(&path).await.unwrap();
        assert!(matches!(
            records.last().map(|r| &r.event),
            Some(EngineEvent::RunFinished { .. })
        ));
    }

    #[tokio::test]
    async fn failed_run_is_an_error() {
        let plan = ExecutionPlan::with_steps(
            "doomed",
            vec![PlanStep::new("a", "demo", "fail").with_parameters(json!({"kind": "validation"}))],
        );
        let (result, _) = execute_static(
            orchestrator(),
            ExecutionContext::new("doomed", plan),
            None,
            SILENT,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(report(&result, None, Output { json: false, quiet: true }).is_err());
    }

    #[tokio::test]
    async fn adaptive_run_from_script() {
        let script = PlannerScript::parse(
            "turns:\n  - rationale: one and done\n    actions:\n      - agent_type: demo\n        action: echo\n        parameters: { value: 7 }\n        is_final: true\n",
        )
        .unwrap();
        let (result, audit) = execute_adaptive(
            orchestrator(),
            ExecutionContext::for_query("seven"),
            script,
            None,
            SILENT,
            &CancellationToken::new(),
        )
        .await;
        assert!(audit.is_none());
        assert_eq!(result.completed_steps, vec!["step_1"]);
        assert_eq!(result.outputs["step_1"].output, json!(7));
        assert_eq!(result.thoughts.len(), 1);
    }
}
