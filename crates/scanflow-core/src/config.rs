//! Pipeline configuration
//!
//! One immutable [`PipelineConfig`] is built up front (defaults, an optional
//! YAML file, then command-line overrides) and shared by every component.

use crate::adapter::ImageHandle;
use crate::transform::NamedImage;
use scanflow_common::{Result, ScanflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Fan-out topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Top-level key = subject+session, runs fan out inside each replica
    Paired,
    /// Top-level key = subject+session+run
    Flat,
}

impl FromStr for Topology {
    type Err = ScanflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paired" => Ok(Self::Paired),
            "flat" => Ok(Self::Flat),
            other => Err(ScanflowError::Configuration(format!(
                "unknown topology '{other}' (expected paired or flat)"
            ))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Paired => "paired",
            Self::Flat => "flat",
        })
    }
}

/// What the direct strategy uses as the group template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectTarget {
    /// The initial reference image; every input is registered to it once
    Reference,
    /// The first input in key order, used verbatim
    FirstInput,
    /// Voxelwise average of the inputs, identity chains
    Average,
}

/// Behavior of the `average` direct target when only one input exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleInputPolicy {
    /// The single input becomes the template untouched
    PassThrough,
    /// Run the averaging collaborator over the single input anyway
    Average,
}

/// Group template construction strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum TemplateStrategy {
    Direct {
        target: DirectTarget,
        #[serde(default = "default_single_input")]
        single_input: SingleInputPolicy,
    },
    Iterative {
        rounds: u32,
        /// Stop early once consecutive templates differ by less than this
        #[serde(default)]
        convergence_tolerance: Option<f64>,
        #[serde(default)]
        sharpen: bool,
    },
}

fn default_single_input() -> SingleInputPolicy {
    SingleInputPolicy::PassThrough
}

impl TemplateStrategy {
    pub fn direct(target: DirectTarget) -> Self {
        Self::Direct {
            target,
            single_input: default_single_input(),
        }
    }

    pub fn iterative(rounds: u32) -> Self {
        Self::Iterative {
            rounds,
            convergence_tolerance: None,
            sharpen: false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::Iterative { .. } => "iterative",
        }
    }

    /// Rounds of groupwise registration this strategy runs at most
    #[must_use]
    pub fn rounds(&self) -> u32 {
        match self {
            Self::Direct { target, .. } => match target {
                DirectTarget::Average => 0,
                DirectTarget::Reference | DirectTarget::FirstInput => 1,
            },
            Self::Iterative { rounds, .. } => *rounds,
        }
    }
}

impl Default for TemplateStrategy {
    fn default() -> Self {
        Self::direct(DirectTarget::Reference)
    }
}

/// Scheduler-wide admission budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub workers: usize,
    pub memory_mb: u64,
}

impl Default for ResourceBudget {
    fn default() -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            workers,
            memory_mb: workers as u64 * 4096,
        }
    }
}

impl fmt::Display for ResourceBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} workers / {} MB", self.workers, self.memory_mb)
    }
}

/// Estimated cost a node declares at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceCost {
    pub workers: usize,
    pub memory_mb: u64,
}

impl ResourceCost {
    #[must_use]
    pub const fn new(workers: usize, memory_mb: u64) -> Self {
        Self { workers, memory_mb }
    }

    /// Whether this cost could ever be admitted under `budget`
    #[must_use]
    pub fn fits_within(&self, budget: &ResourceBudget) -> bool {
        self.workers <= budget.workers && self.memory_mb <= budget.memory_mb
    }
}

impl fmt::Display for ResourceCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} workers / {} MB", self.workers, self.memory_mb)
    }
}

/// Per-stage memory estimates in MB, before scaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCosts {
    pub load_mb: u64,
    pub registration_mb: u64,
    pub resample_mb: u64,
    pub average_mb: u64,
    /// Multiplier applied to every estimate (lower it on small machines)
    pub scale_min_memory: f64,
}

impl Default for NodeCosts {
    fn default() -> Self {
        Self {
            load_mb: 256,
            registration_mb: 3000,
            resample_mb: 1000,
            average_mb: 1000,
            scale_min_memory: 1.0,
        }
    }
}

impl NodeCosts {
    fn scaled(&self, base_mb: u64) -> u64 {
        ((base_mb as f64) * self.scale_min_memory).ceil() as u64
    }

    #[must_use]
    pub fn load(&self) -> ResourceCost {
        ResourceCost::new(1, self.scaled(self.load_mb))
    }

    #[must_use]
    pub fn registration(&self) -> ResourceCost {
        ResourceCost::new(1, self.scaled(self.registration_mb))
    }

    #[must_use]
    pub fn resample(&self) -> ResourceCost {
        ResourceCost::new(1, self.scaled(self.resample_mb))
    }

    /// Cost of a template build: one registration slot per worker plus the
    /// averaging buffer
    #[must_use]
    pub fn template(&self, workers: usize) -> ResourceCost {
        let workers = workers.max(1);
        ResourceCost::new(
            workers,
            self.scaled(self.registration_mb) * workers as u64 + self.scaled(self.average_mb),
        )
    }
}

/// Parse `AxBxC` (or one isotropic value) into a voxel spacing in mm
#[must_use]
pub fn parse_spacing(text: &str) -> Option<[f64; 3]> {
    let values = text
        .trim()
        .split('x')
        .map(|v| v.trim().parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return None;
    }
    match values.as_slice() {
        [v] => Some([*v; 3]),
        [a, b, c] => Some([*a, *b, *c]),
        _ => None,
    }
}

/// Grid the atlas is brought onto before anything registers against it
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AtlasResampling {
    /// Match the finest voxel spacing among the inputs. An atlas whose grid is
    /// already as coarse as the data keeps it.
    #[default]
    InputsDefined,
    /// Explicit voxel spacing in mm (`AxBxC`)
    Spacing([f64; 3]),
}

impl FromStr for AtlasResampling {
    type Err = ScanflowError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "inputs_defined" {
            return Ok(Self::InputsDefined);
        }
        parse_spacing(s).map(Self::Spacing).ok_or_else(|| {
            ScanflowError::Configuration(format!(
                "invalid atlas resampling '{s}' (expected inputs_defined or AxBxC in mm)"
            ))
        })
    }
}

impl fmt::Display for AtlasResampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputsDefined => f.write_str("inputs_defined"),
            Self::Spacing([x, y, z]) => write!(f, "{x}x{y}x{z}"),
        }
    }
}

impl TryFrom<String> for AtlasResampling {
    type Error = ScanflowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AtlasResampling> for String {
    fn from(value: AtlasResampling) -> Self {
        value.to_string()
    }
}

/// Commonspace atlas images
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Commonspace reference image (also the initial template geometry)
    pub reference: Option<PathBuf>,
    pub brain_mask: Option<PathBuf>,
    pub wm_mask: Option<PathBuf>,
    pub csf_mask: Option<PathBuf>,
    pub vascular_mask: Option<PathBuf>,
    pub labels: Option<PathBuf>,
    pub resampling: AtlasResampling,
}

impl AtlasConfig {
    pub fn with_reference(reference: impl Into<PathBuf>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Self::default()
        }
    }

    /// Masks and labels to propagate into native space, in a fixed order
    #[must_use]
    pub fn images(&self) -> Vec<NamedImage> {
        [
            ("brain_mask", &self.brain_mask),
            ("wm_mask", &self.wm_mask),
            ("csf_mask", &self.csf_mask),
            ("vascular_mask", &self.vascular_mask),
            ("labels", &self.labels),
        ]
        .into_iter()
        .filter_map(|(name, path)| {
            path.as_ref().map(|p| NamedImage {
                name: name.to_string(),
                image: ImageHandle::new(p),
            })
        })
        .collect()
    }
}

/// Complete configuration for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub topology: Topology,
    pub template: TemplateStrategy,
    /// Upper bound on concurrent registrations inside a template build
    pub registration_workers: usize,
    pub budget: ResourceBudget,
    pub costs: NodeCosts,
    /// Per-node timeout; an expired node is cancelled and fails
    pub node_timeout_secs: u64,
    pub cache_dir: Option<PathBuf>,
    pub atlas: AtlasConfig,
    /// Script driving the external registration tool
    pub registration_script: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Paired,
            template: TemplateStrategy::default(),
            registration_workers: num_cpus::get().max(1),
            budget: ResourceBudget::default(),
            costs: NodeCosts::default(),
            node_timeout_secs: 3600,
            cache_dir: None,
            atlas: AtlasConfig::default(),
            registration_script: None,
        }
    }
}

impl PipelineConfig {
    /// Paired anatomical/functional preprocessing
    pub fn paired() -> Self {
        Self::default()
    }

    /// One replica per functional run
    pub fn flat() -> Self {
        Self {
            topology: Topology::Flat,
            ..Self::default()
        }
    }

    /// Load from a YAML file; fields not present keep their defaults
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ScanflowError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| ScanflowError::Configuration(format!("invalid config: {e}")))
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_template(mut self, template: TemplateStrategy) -> Self {
        self.template = template;
        self
    }

    pub fn with_budget(mut self, budget: ResourceBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_registration_workers(mut self, workers: usize) -> Self {
        self.registration_workers = workers;
        self
    }

    pub fn with_costs(mut self, costs: NodeCosts) -> Self {
        self.costs = costs;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_atlas(mut self, atlas: AtlasConfig) -> Self {
        self.atlas = atlas;
        self
    }

    pub fn with_registration_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.registration_script = Some(script.into());
        self
    }

    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// Workers a template build over `inputs` images may use: at most one
    /// per input, `registration_workers` and the worker budget, and no more
    /// than the memory budget can hold. Falls back to 1 when even a single
    /// worker does not fit; admission then reports the node as exhausted.
    #[must_use]
    pub fn template_workers(&self, inputs: usize) -> usize {
        let wanted = inputs
            .min(self.registration_workers)
            .min(self.budget.workers)
            .max(1);
        (1..=wanted)
            .rev()
            .find(|&workers| self.costs.template(workers).fits_within(&self.budget))
            .unwrap_or(1)
    }

    /// Commonspace reference image
    pub fn atlas_reference(&self) -> Result<ImageHandle> {
        self.atlas
            .reference
            .as_ref()
            .map(ImageHandle::new)
            .ok_or_else(|| {
                ScanflowError::Configuration("no atlas reference image configured".to_string())
            })
    }

    /// Reject inconsistent settings before any graph is built
    pub fn validate(&self) -> Result<()> {
        if let TemplateStrategy::Iterative {
            rounds,
            convergence_tolerance,
            ..
        } = &self.template
        {
            if *rounds == 0 {
                return Err(ScanflowError::Configuration(
                    "iterative template needs at least one round".to_string(),
                ));
            }
            if let Some(tol) = convergence_tolerance {
                if !tol.is_finite() || *tol < 0.0 {
                    return Err(ScanflowError::Configuration(format!(
                        "convergence tolerance must be a non-negative number, got {tol}"
                    )));
                }
            }
        }
        if self.budget.workers == 0 || self.budget.memory_mb == 0 {
            return Err(ScanflowError::Configuration(format!(
                "resource budget must be positive, got {}",
                self.budget
            )));
        }
        if self.registration_workers == 0 {
            return Err(ScanflowError::Configuration(
                "registration_workers must be at least 1".to_string(),
            ));
        }
        if !self.costs.scale_min_memory.is_finite() || self.costs.scale_min_memory <= 0.0 {
            return Err(ScanflowError::Configuration(format!(
                "scale_min_memory must be positive, got {}",
                self.costs.scale_min_memory
            )));
        }
        if self.node_timeout_secs == 0 {
            return Err(ScanflowError::Configuration(
                "node_timeout_secs must be at least 1".to_string(),
            ));
        }
        self.atlas_reference()?;
        Ok(())
    }
}
