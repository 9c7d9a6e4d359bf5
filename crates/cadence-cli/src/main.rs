//! Cadence CLI entry point.
//!
//! Binary name: `cadence`
//!
//! Parses CLI arguments, sets up tracing, loads the engine configuration from
//! the data directory and dispatches to the command handlers.

mod cli;

use clap::Parser;
use clap_complete::generate;

use cadence_core::workflow::executor::Orchestrator;
use cadence_infra::config::load_engine_config;
use cadence_infra::filesystem::resolve_data_dir;
use cadence_observe::tracing_setup::{init_tracing, shutdown_tracing, LogOptions};

use cli::run::Output;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions need nothing else
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cadence", &mut std::io::stdout());
        return Ok(());
    }

    let log_options = LogOptions {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json: cli.json,
        otel: cli.otel,
    };
    if let Err(e) = init_tracing(&log_options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);
    let config = load_engine_config(&data_dir).await;
    tracing::debug!(data_dir = %data_dir.display(), "engine configuration loaded");

    let orchestrator = Orchestrator::new(config, cli::builtin::builtin_registry());
    let output = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Validate { plan } => {
            cli::plan::handle_validate(&orchestrator, &data_dir, &plan, cli.json).await?;
        }
        Commands::Levels { plan } => {
            cli::plan::handle_levels(&orchestrator, &data_dir, &plan, cli.json).await?;
        }
        Commands::Plans => {
            cli::plan::handle_plans(&data_dir, cli.json).await?;
        }
        Commands::Capabilities => {
            cli::plan::handle_capabilities(&orchestrator, cli.json)?;
        }
        Commands::Run { plan, query, audit } => {
            cli::run::handle_run(orchestrator, &data_dir, &plan, query, audit, output).await?;
        }
        Commands::Adapt {
            script,
            query,
            audit,
        } => {
            cli::run::handle_adapt(orchestrator, &data_dir, &script, query, audit, output).await?;
        }
        // Handled in `main` before tracing is set up.
        Commands::Completions { .. } => {}
    }

    Ok(())
}
