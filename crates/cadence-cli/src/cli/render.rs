//! Styled terminal rendering shared by the plan and run commands.

use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use cadence_core::workflow::executor::ExecutionResult;
use cadence_types::plan::ExecutionPlan;
use cadence_types::result::RunStatus;

const PREVIEW_WIDTH: usize = 60;

fn new_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// Shorten `text` to `max` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}

/// One row per step, grouped by level.
pub fn levels_table(plan: &ExecutionPlan, levels: &[Vec<String>]) -> Table {
    let mut table = new_table(vec![
        Cell::new("Level").fg(Color::Cyan),
        Cell::new("Step"),
        Cell::new("Capability"),
        Cell::new("Depends on"),
    ]);

    for (index, level) in levels.iter().enumerate() {
        for id in level {
            let Some(step) = plan.get(id) else { continue };
            let deps = if step.depends_on.is_empty() {
                "-".to_string()
            } else {
                step.depends_on.join(", ")
            };
            table.add_row(vec![
                Cell::new(index + 1),
                Cell::new(id),
                Cell::new(step.capability()),
                Cell::new(deps),
            ]);
        }
    }
    table
}

/// Resolved steps in plan order with their outcome.
pub fn results_table(result: &ExecutionResult) -> Table {
    let mut table = new_table(vec![
        Cell::new("Step").fg(Color::Cyan),
        Cell::new("Status"),
        Cell::new("Attempts"),
        Cell::new("Duration"),
        Cell::new("Output / error"),
    ]);

    for step in result.results_in_plan_order() {
        let (status, detail) = match &step.error {
            None => (Cell::new("ok").fg(Color::Green), step.output.to_string()),
            Some(failure) => (Cell::new("failed").fg(Color::Red), failure.to_string()),
        };
        let attempts = if step.attempts == 0 {
            "cached".to_string()
        } else {
            step.attempts.to_string()
        };
        table.add_row(vec![
            Cell::new(&step.step_id),
            status,
            Cell::new(attempts),
            Cell::new(format!("{}ms", step.duration_ms)),
            Cell::new(truncate(&detail, PREVIEW_WIDTH)),
        ]);
    }
    table
}

pub fn status_label(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::Succeeded => style(text).green().bold().to_string(),
        RunStatus::PartialSuccess => style(text).yellow().bold().to_string(),
        RunStatus::Failed | RunStatus::Cancelled => style(text).red().bold().to_string(),
    }
}

/// Print a finished run: results table, insights, reasoning trace, summary.
pub fn print_execution(result: &ExecutionResult) {
    println!();
    if result.outputs.is_empty() {
        println!("  No steps were executed.");
    } else {
        println!("{}", results_table(result));
    }

    if !result.insights.is_empty() {
        println!();
        println!("  {}", style("Insights").bold());
        for insight in &result.insights {
            println!(
                "  - [{:?}] {} {}",
                insight.severity,
                insight.title,
                style(format!("({})", insight.source_step.as_deref().unwrap_or("?"))).dim()
            );
        }
    }

    if !result.thoughts.is_empty() {
        println!();
        println!("  {}", style("Reasoning").bold());
        for thought in &result.thoughts {
            println!("  {}. {}", thought.iteration, thought.rationale);
        }
    }

    println!();
    println!(
        "  {} {} ({} completed, {} failed, {} levels, {}ms)",
        style("*").cyan().bold(),
        status_label(result.status),
        result.completed_steps.len(),
        result.failed_steps.len(),
        result.levels.len(),
        result.duration_ms
    );
    if let Some(reason) = result.termination {
        println!("  Terminated: {reason}");
    }
    println!();
}
