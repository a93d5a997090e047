//! Plan command - discovery and fan-out without execution

use anyhow::{Context as _, Result};
use clap::Args;
use scanflow_core::{FilesystemSource, IterationPlanner, PipelineConfig, ScanInventory, Topology};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct PlanCommand {
    /// Dataset root (BIDS-style layout)
    #[arg(value_name = "BIDS_DIR")]
    bids_dir: PathBuf,

    /// Fan-out topology: paired or flat (default: from --config, else paired)
    #[arg(long, value_name = "paired|flat")]
    topology: Option<Topology>,

    /// YAML configuration file to take the topology from
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,
}

impl PlanCommand {
    pub fn execute(self) -> Result<i32> {
        let topology = match (self.topology, &self.config) {
            (Some(topology), _) => topology,
            (None, Some(path)) => {
                PipelineConfig::from_yaml_file(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?
                    .topology
            }
            (None, None) => Topology::Paired,
        };

        let inventory = ScanInventory::discover(&FilesystemSource::new(&self.bids_dir))
            .with_context(|| format!("Failed to discover scans in {}", self.bids_dir.display()))?;
        let plan = IterationPlanner::new(topology)
            .plan(&inventory)
            .context("Failed to plan iteration")?;
        info!(
            "{} topology: {} replicas, {} nested runs",
            topology,
            plan.replica_count(),
            plan.runs.len()
        );

        if self.json {
            let replicas: Vec<_> = plan
                .top_level
                .iter()
                .map(|replica| {
                    let runs: Vec<_> = plan
                        .runs_of(&replica.key)
                        .map(|run| json!({ "key": run.key, "path": run.value.path }))
                        .collect();
                    json!({
                        "key": replica.key,
                        "path": replica.value.path,
                        "runs": runs,
                    })
                })
                .collect();
            let output = json!({ "topology": topology.to_string(), "replicas": replicas });
            println!("{}", serde_json::to_string_pretty(&output)?);
            return Ok(0);
        }

        println!("{} replicas ({} topology)", plan.replica_count(), topology);
        for replica in &plan.top_level {
            println!("{}  {}", replica.key, replica.value.path.display());
            for run in plan.runs_of(&replica.key) {
                println!("  {}  {}", run.key, run.value.path.display());
            }
        }
        Ok(0)
    }
}
