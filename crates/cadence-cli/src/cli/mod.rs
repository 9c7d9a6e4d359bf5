//! CLI command definitions for the `cadence` binary.
//!
//! Uses clap derive macros for argument parsing. Plans are referenced either
//! by file path or by name inside `{data_dir}/plans/`.

pub mod builtin;
pub mod plan;
pub mod render;
pub mod run;
pub mod script;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run dependency-ordered plans of agent steps.
#[derive(Parser)]
#[command(name = "cadence", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory (defaults to $CADENCE_DATA_DIR or ~/.cadence).
    #[arg(long, global = true, env = "CADENCE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a plan and show its execution levels.
    Validate {
        /// Plan file path or stored plan name.
        plan: String,
    },

    /// Show the execution levels of a plan as a table.
    Levels {
        /// Plan file path or stored plan name.
        plan: String,
    },

    /// List plans stored in the data directory.
    #[command(alias = "ls")]
    Plans,

    /// Execute a plan with the built-in demo executors.
    Run {
        /// Plan file path or stored plan name.
        plan: String,

        /// Query text recorded with the run.
        #[arg(long)]
        query: Option<String>,

        /// Append auditable events to a JSONL file
        /// (default: {data_dir}/audit/{query_id}.jsonl).
        #[arg(long, num_args = 0..=1, value_name = "FILE")]
        audit: Option<Option<PathBuf>>,
    },

    /// Run the adaptive planning loop from a scripted planner file.
    Adapt {
        /// Planner script (YAML).
        script: PathBuf,

        /// Query text (overrides the script's `query`).
        #[arg(long)]
        query: Option<String>,

        /// Append auditable events to a JSONL file
        /// (default: {data_dir}/audit/{query_id}.jsonl).
        #[arg(long, num_args = 0..=1, value_name = "FILE")]
        audit: Option<Option<PathBuf>>,
    },

    /// List the capabilities the built-in executors provide.
    Capabilities,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}
