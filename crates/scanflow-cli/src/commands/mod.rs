//! Subcommands and the configuration flags they share

pub mod plan;
pub mod run;

use anyhow::{bail, Context as _, Result};
use clap::{Args, ValueEnum};
use scanflow_core::{
    AtlasResampling, DirectTarget, PipelineConfig, ResourceBudget, TemplateStrategy, Topology,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Rounds used when `--template iterative` is given without `--rounds`
const DEFAULT_ROUNDS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TemplateArg {
    Direct,
    Iterative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetArg {
    Reference,
    FirstInput,
    Average,
}

impl From<TargetArg> for DirectTarget {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Reference => Self::Reference,
            TargetArg::FirstInput => Self::FirstInput,
            TargetArg::Average => Self::Average,
        }
    }
}

/// Pipeline settings. Flags override the `--config` file, which overrides
/// the built-in defaults.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Fan-out topology: paired (one replica per session) or flat (one per run)
    #[arg(long, value_name = "paired|flat")]
    topology: Option<Topology>,

    /// Group template strategy
    #[arg(long, value_enum)]
    template: Option<TemplateArg>,

    /// Alignment target of the direct strategy
    #[arg(long, value_enum)]
    direct_target: Option<TargetArg>,

    /// Registration rounds of the iterative strategy
    #[arg(long)]
    rounds: Option<u32>,

    /// Stop iterating once consecutive templates differ by less than this
    #[arg(long)]
    convergence_tolerance: Option<f64>,

    /// Worker slots the scheduler may hand out
    #[arg(long)]
    max_workers: Option<usize>,

    /// Memory the scheduler may hand out (MB)
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Concurrent registrations inside one template round
    #[arg(long)]
    registration_workers: Option<usize>,

    /// Per-node timeout in seconds
    #[arg(long)]
    node_timeout: Option<u64>,

    /// Persist node results here so later runs can reuse them
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Script driving the external registration tool
    #[arg(long, value_name = "PATH")]
    registration_script: Option<PathBuf>,

    /// Commonspace reference image
    #[arg(long, value_name = "PATH")]
    atlas: Option<PathBuf>,

    /// Commonspace brain mask, propagated to every replica
    #[arg(long, value_name = "PATH")]
    brain_mask: Option<PathBuf>,

    /// Atlas grid: inputs_defined (finest input spacing) or AxBxC in mm
    #[arg(long, value_name = "inputs_defined|AxBxC")]
    atlas_resampling: Option<AtlasResampling>,
}

impl ConfigArgs {
    /// Resolve the final configuration and validate it
    pub fn load(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(topology) = self.topology {
            config.topology = topology;
        }
        config.template = self.template(config.template)?;

        if self.max_workers.is_some() || self.memory_mb.is_some() {
            let workers = self.max_workers.unwrap_or(config.budget.workers);
            let memory_mb = self.memory_mb.unwrap_or(config.budget.memory_mb);
            config = config.with_budget(ResourceBudget { workers, memory_mb });
        }
        if let Some(workers) = self.registration_workers {
            config = config.with_registration_workers(workers);
        }
        if let Some(secs) = self.node_timeout {
            config = config.with_node_timeout(Duration::from_secs(secs));
        }
        if let Some(dir) = &self.cache_dir {
            config = config.with_cache_dir(dir);
        }
        if let Some(script) = &self.registration_script {
            config = config.with_registration_script(script);
        }
        if let Some(reference) = &self.atlas {
            config.atlas.reference = Some(reference.clone());
        }
        if let Some(mask) = &self.brain_mask {
            config.atlas.brain_mask = Some(mask.clone());
        }
        if let Some(resampling) = self.atlas_resampling {
            config.atlas.resampling = resampling;
        }

        config.validate().context("Invalid configuration")?;
        debug!("Resolved configuration: {:?}", config);
        Ok(config)
    }

    fn template(&self, current: TemplateStrategy) -> Result<TemplateStrategy> {
        let mut template = match (self.template, current) {
            (Some(TemplateArg::Iterative), existing @ TemplateStrategy::Iterative { .. }) => existing,
            (Some(TemplateArg::Iterative), _) => TemplateStrategy::iterative(DEFAULT_ROUNDS),
            (Some(TemplateArg::Direct), existing @ TemplateStrategy::Direct { .. }) => existing,
            (Some(TemplateArg::Direct), _) => TemplateStrategy::default(),
            (None, existing) => existing,
        };

        match &mut template {
            TemplateStrategy::Iterative {
                rounds,
                convergence_tolerance,
                ..
            } => {
                if self.direct_target.is_some() {
                    bail!("--direct-target only applies to --template direct");
                }
                if let Some(n) = self.rounds {
                    *rounds = n;
                }
                if let Some(tolerance) = self.convergence_tolerance {
                    *convergence_tolerance = Some(tolerance);
                }
            }
            TemplateStrategy::Direct { target, .. } => {
                if self.rounds.is_some() || self.convergence_tolerance.is_some() {
                    bail!("--rounds and --convergence-tolerance require --template iterative");
                }
                if let Some(arg) = self.direct_target {
                    *target = arg.into();
                }
            }
        }
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atlas() -> ConfigArgs {
        ConfigArgs {
            atlas: Some(PathBuf::from("/atlas/reference.nii.gz")),
            ..ConfigArgs::default()
        }
    }

    #[test]
    fn test_defaults_need_an_atlas() {
        assert!(ConfigArgs::default().load().is_err());
        let config = atlas().load().unwrap();
        assert_eq!(config.topology, Topology::Paired);
        assert_eq!(config.template, TemplateStrategy::default());
    }

    #[test]
    fn test_iterative_flags() {
        let args = ConfigArgs {
            template: Some(TemplateArg::Iterative),
            rounds: Some(5),
            convergence_tolerance: Some(0.01),
            ..atlas()
        };
        match args.load().unwrap().template {
            TemplateStrategy::Iterative {
                rounds,
                convergence_tolerance,
                ..
            } => {
                assert_eq!(rounds, 5);
                assert_eq!(convergence_tolerance, Some(0.01));
            }
            other => panic!("unexpected {other:?}"),
        }

        let defaulted = ConfigArgs {
            template: Some(TemplateArg::Iterative),
            ..atlas()
        };
        assert_eq!(
            defaulted.load().unwrap().template,
            TemplateStrategy::iterative(DEFAULT_ROUNDS)
        );
    }

    #[test]
    fn test_mismatched_template_flags_are_rejected() {
        let rounds_on_direct = ConfigArgs {
            rounds: Some(2),
            ..atlas()
        };
        assert!(rounds_on_direct.load().is_err());

        let target_on_iterative = ConfigArgs {
            template: Some(TemplateArg::Iterative),
            direct_target: Some(TargetArg::Average),
            ..atlas()
        };
        assert!(target_on_iterative.load().is_err());
    }

    #[test]
    fn test_budget_overrides_keep_unset_half() {
        let args = ConfigArgs {
            max_workers: Some(3),
            topology: Some(Topology::Flat),
            direct_target: Some(TargetArg::FirstInput),
            ..atlas()
        };
        let defaults = PipelineConfig::default();
        let config = args.load().unwrap();
        assert_eq!(config.budget.workers, 3);
        assert_eq!(config.budget.memory_mb, defaults.budget.memory_mb);
        assert_eq!(config.topology, Topology::Flat);
        assert_eq!(config.template, TemplateStrategy::direct(DirectTarget::FirstInput));
    }

    #[test]
    fn test_atlas_resampling_flag() {
        assert_eq!(atlas().load().unwrap().atlas.resampling, AtlasResampling::InputsDefined);
        let args = ConfigArgs {
            atlas_resampling: Some("0.2x0.2x0.4".parse().unwrap()),
            ..atlas()
        };
        assert_eq!(
            args.load().unwrap().atlas.resampling,
            AtlasResampling::Spacing([0.2, 0.2, 0.4])
        );
    }
}
