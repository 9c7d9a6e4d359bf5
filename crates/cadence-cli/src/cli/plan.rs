//! Plan inspection subcommands: validate, levels, plans, capabilities.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use cadence_core::workflow::definition::WorkflowError;
use cadence_core::workflow::executor::{Orchestrator, OrchestratorError};
use cadence_infra::filesystem::plans_dir;
use cadence_infra::plan_store::PlanStore;
use cadence_types::plan::ExecutionPlan;

use super::render::levels_table;

/// Load a plan by path or stored name, with readable errors.
pub async fn load_plan(data_dir: &Path, reference: &str) -> Result<ExecutionPlan> {
    let store = PlanStore::new(plans_dir(data_dir));
    store.load(reference).await.map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse plan YAML: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow::anyhow!("Plan validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load plan '{reference}': {other}"),
    })
}

/// Levels for `plan`, or an error naming what is wrong with it.
fn plan_levels(orchestrator: &Orchestrator, plan: &ExecutionPlan) -> Result<Vec<Vec<String>>> {
    orchestrator.validate(plan).map_err(|e| match e {
        OrchestratorError::UnknownCapability(caps) => anyhow::anyhow!(
            "No executor registered for: {} (see `cadence capabilities`)",
            caps.join(", ")
        ),
        other => anyhow::Error::new(other).context("Plan is not executable"),
    })
}

pub async fn handle_validate(
    orchestrator: &Orchestrator,
    data_dir: &Path,
    reference: &str,
    json: bool,
) -> Result<()> {
    let plan = load_plan(data_dir, reference).await?;
    let levels = plan_levels(orchestrator, &plan)?;

    if json {
        let out = serde_json::json!({
            "name": plan.name,
            "valid": true,
            "steps": plan.len(),
            "levels": levels,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Plan '{}' is valid",
            style("*").green().bold(),
            style(&plan.name).cyan()
        );
        println!("  Steps: {}", plan.len());
        for (index, level) in levels.iter().enumerate() {
            println!("  Level {}: {}", index + 1, level.join(", "));
        }
        println!();
    }
    Ok(())
}

pub async fn handle_levels(
    orchestrator: &Orchestrator,
    data_dir: &Path,
    reference: &str,
    json: bool,
) -> Result<()> {
    let plan = load_plan(data_dir, reference).await?;
    let levels = plan_levels(orchestrator, &plan)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&levels)?);
        return Ok(());
    }

    println!();
    println!("{}", levels_table(&plan, &levels));
    println!(
        "  {} steps in {} levels (widest level: {})",
        plan.len(),
        levels.len(),
        levels.iter().map(Vec::len).max().unwrap_or(0)
    );
    println!();
    Ok(())
}

pub async fn handle_plans(data_dir: &Path, json: bool) -> Result<()> {
    let store = PlanStore::new(plans_dir(data_dir));
    let names = store
        .list()
        .await
        .with_context(|| format!("Failed to list plans in {}", store.dir().display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }

    println!();
    if names.is_empty() {
        println!("  No plans stored in {}.", store.dir().display());
    } else {
        for name in &names {
            println!("  {}", style(name).cyan());
        }
    }
    println!();
    Ok(())
}

pub fn handle_capabilities(orchestrator: &Orchestrator, json: bool) -> Result<()> {
    let caps = orchestrator.registry().capabilities();
    if json {
        println!("{}", serde_json::to_string_pretty(&caps)?);
    } else {
        println!();
        for cap in &caps {
            println!("  {}", style(cap).cyan());
        }
        println!();
    }
    Ok(())
}
