//! Scanflow CLI - imaging preprocessing over BIDS-style datasets
//!
//! Command-line interface for discovery, planning and execution of the
//! template/commonspace registration pipeline.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;

use commands::plan::PlanCommand;
use commands::run::RunCommand;

#[derive(Parser)]
#[command(
    name = "scanflow",
    version,
    about = "Group template and commonspace registration for imaging datasets",
    after_help = "EXAMPLES:\n  \
                  # Show which replicas a dataset expands into\n  \
                  scanflow plan ./bids --topology paired\n\n  \
                  # One replica per session, iterative template with 3 rounds\n  \
                  scanflow run ./bids ./derivatives --template iterative --rounds 3 \\\n    \
                  --atlas ./atlas/reference.nii.gz --registration-script ./register.sh\n\n  \
                  # One replica per functional run, settings from a file\n  \
                  scanflow run ./bids ./derivatives --topology flat --config scanflow.yaml\n\n\
                  Set RUST_LOG to override the log filter (e.g. RUST_LOG=scanflow_orchestrator=debug)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, plan and execute the preprocessing graph
    Run(RunCommand),

    /// Discover and print the iteration plan without running anything
    Plan(PlanCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let code = match cli.command {
        Commands::Run(cmd) => cmd.execute().await?,
        Commands::Plan(cmd) => cmd.execute()?,
    };
    std::process::exit(code)
}
