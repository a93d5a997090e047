//! Run command - full preprocessing over a dataset

use super::ConfigArgs;
use anyhow::{Context as _, Result};
use clap::Args;
use scanflow_core::FilesystemSource;
use scanflow_orchestrator::Pipeline;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Args)]
pub struct RunCommand {
    /// Dataset root (BIDS-style layout)
    #[arg(value_name = "BIDS_DIR")]
    bids_dir: PathBuf,

    /// Derivatives directory
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: PathBuf,

    #[command(flatten)]
    settings: ConfigArgs,
}

impl RunCommand {
    /// Returns the process exit code: 0 only when no key failed
    pub async fn execute(self) -> Result<i32> {
        info!("=== Scanflow Run ===");
        let config = self.settings.load()?;
        info!(
            "Topology: {}, template: {}, budget: {}",
            config.topology,
            config.template.name(),
            config.budget
        );

        let pipeline =
            Pipeline::with_external_tools(config).context("Failed to create pipeline")?;

        let start = Instant::now();
        let report = pipeline
            .run(&FilesystemSource::new(&self.bids_dir), &self.output_dir)
            .await
            .context("Run could not start")?;

        for failure in &report.failures {
            let key = failure
                .key
                .as_ref()
                .map_or_else(|| "global".to_string(), ToString::to_string);
            error!("{} [{}] failed ({:?}): {}", failure.node, key, failure.kind, failure.message);
        }
        if !report.skipped.is_empty() {
            warn!("{} node instances skipped after upstream failures", report.skipped.len());
        }

        info!("=== Run Complete ===");
        info!(
            "Outputs: {}, failed keys: {}, nodes run: {}, cache hits: {}",
            report.outputs.len(),
            report.failed_keys().len(),
            report.nodes_run,
            report.cache_hits
        );
        info!(
            "Peak usage: {} workers / {} MB",
            report.peak_usage.workers, report.peak_usage.memory_mb
        );
        info!("Total time: {:.2}s", start.elapsed().as_secs_f64());

        Ok(report.exit_code())
    }
}
