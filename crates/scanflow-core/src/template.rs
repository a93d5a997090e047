//! Groupwise template construction
//!
//! # Strategies
//!
//! - **direct / reference**: the reference image is the template, every input
//!   is registered to it once.
//! - **direct / first_input**: the first input in key order is the template
//!   verbatim; its chain is identity, the rest are registered to it once.
//! - **direct / average**: voxelwise average of the inputs with identity chains.
//! - **iterative**: starting from the reference, each round registers every
//!   input to the current template in parallel, then averages the warped
//!   images (optionally sharpened) into the next template. Only the last
//!   round's transforms are published.
//!
//! A registration failure in any round fails the whole build and nothing is
//! published.

use crate::adapter::{ImageHandle, ImageIo, RegistrationAdapter, RegistrationOutput, RegistrationRequest};
use crate::config::{DirectTarget, SingleInputPolicy, TemplateStrategy};
use crate::identity::IdentityResolver;
use crate::transform::{Space, TransformChain};
use scanflow_common::{IterationKey, Keyed, Result, ScanflowError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A group-average alignment target with exactly one native → template chain
/// per contributing input
#[derive(Debug, Clone, PartialEq)]
pub struct GroupTemplate {
    image: ImageHandle,
    chains: Vec<Keyed<TransformChain>>,
    rounds: u32,
}

impl GroupTemplate {
    /// Validate and publish.
    ///
    /// Fails unless every key in `inputs` has exactly one chain, no chain is
    /// keyed outside `inputs`, and each chain is a single native → group
    /// template hop.
    pub fn new(
        image: ImageHandle,
        mut chains: Vec<Keyed<TransformChain>>,
        inputs: &[IterationKey],
        rounds: u32,
    ) -> Result<Self> {
        IdentityResolver::ensure_unique(&chains)?;
        for key in inputs {
            IdentityResolver::resolve(&chains, key)?;
        }
        if chains.len() != inputs.len() {
            return Err(ScanflowError::TaskFailed(format!(
                "template has {} chains for {} inputs",
                chains.len(),
                inputs.len()
            )));
        }
        for chain in &chains {
            if chain.value.spaces() != [Space::Native, Space::GroupTemplate] {
                return Err(ScanflowError::Composition(format!(
                    "template chain for {} spans {:?}",
                    chain.key,
                    chain.value.spaces()
                )));
            }
        }
        chains.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Self {
            image,
            chains,
            rounds,
        })
    }

    #[must_use]
    pub fn image(&self) -> &ImageHandle {
        &self.image
    }

    #[must_use]
    pub fn chains(&self) -> &[Keyed<TransformChain>] {
        &self.chains
    }

    /// Registration rounds that produced this template
    #[must_use]
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn chain_for(&self, key: &IterationKey) -> Result<&TransformChain> {
        IdentityResolver::resolve(&self.chains, key)
    }
}

/// Builds a [`GroupTemplate`] with the configured strategy
#[derive(Clone)]
pub struct GroupTemplateBuilder {
    registration: Arc<dyn RegistrationAdapter>,
    io: Arc<dyn ImageIo>,
    strategy: TemplateStrategy,
    max_workers: usize,
    mask: Option<ImageHandle>,
    work_dir: PathBuf,
}

impl GroupTemplateBuilder {
    pub fn new(
        registration: Arc<dyn RegistrationAdapter>,
        io: Arc<dyn ImageIo>,
        strategy: TemplateStrategy,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registration,
            io,
            strategy,
            max_workers: num_cpus::get().max(1),
            mask: None,
            work_dir: work_dir.into(),
        }
    }

    /// Cap concurrent registrations per round
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Mask passed to every registration
    pub fn with_mask(mut self, mask: ImageHandle) -> Self {
        self.mask = Some(mask);
        self
    }

    #[must_use]
    pub fn strategy(&self) -> &TemplateStrategy {
        &self.strategy
    }

    /// Workers a build over `inputs` images uses: min(N, limit)
    #[must_use]
    pub fn workers_for(&self, inputs: usize) -> usize {
        inputs.min(self.max_workers).max(1)
    }

    /// Total registrations a build over `inputs` images runs at most
    #[must_use]
    pub fn registration_count(&self, inputs: usize) -> usize {
        match &self.strategy {
            TemplateStrategy::Direct { target, .. } => match target {
                DirectTarget::Average => 0,
                DirectTarget::Reference => inputs,
                DirectTarget::FirstInput => inputs.saturating_sub(1),
            },
            TemplateStrategy::Iterative { rounds, .. } => inputs * *rounds as usize,
        }
    }

    /// Build the template over `inputs`, starting from `reference`
    pub async fn build(
        &self,
        inputs: &[Keyed<ImageHandle>],
        reference: &ImageHandle,
    ) -> Result<GroupTemplate> {
        if inputs.is_empty() {
            return Err(ScanflowError::TaskFailed(
                "group template needs at least one input".to_string(),
            ));
        }
        IdentityResolver::ensure_unique(inputs)?;
        let mut inputs = inputs.to_vec();
        inputs.sort_by(|a, b| a.key.cmp(&b.key));
        let keys: Vec<IterationKey> = inputs.iter().map(|i| i.key.clone()).collect();

        let start = Instant::now();
        info!(
            "Building {} group template over {} inputs ({} workers)",
            self.strategy.name(),
            inputs.len(),
            self.workers_for(inputs.len())
        );

        let template = match &self.strategy {
            TemplateStrategy::Direct { target, .. } => {
                let image = self.direct_target(&inputs, reference).await?;
                let chains = match target {
                    DirectTarget::Average => identity_chains(&keys)?,
                    DirectTarget::Reference => {
                        let outputs = self.register_round(&inputs, &image, 1).await?;
                        to_chains(outputs)?
                    }
                    DirectTarget::FirstInput => {
                        let (first, rest) = inputs.split_at(1);
                        let mut chains = identity_chains(&[first[0].key.clone()])?;
                        if !rest.is_empty() {
                            let outputs = self.register_round(rest, &image, 1).await?;
                            chains.extend(to_chains(outputs)?);
                        }
                        chains
                    }
                };
                GroupTemplate::new(image, chains, &keys, self.strategy.rounds())?
            }
            TemplateStrategy::Iterative {
                rounds,
                convergence_tolerance,
                sharpen,
            } => {
                self.build_iterative(&inputs, reference, *rounds, *convergence_tolerance, *sharpen)
                    .await?
            }
        };

        info!(
            "Group template published after {} rounds in {:.2}s: {}",
            template.rounds(),
            start.elapsed().as_secs_f64(),
            template.image()
        );
        Ok(template)
    }

    async fn build_iterative(
        &self,
        inputs: &[Keyed<ImageHandle>],
        reference: &ImageHandle,
        rounds: u32,
        tolerance: Option<f64>,
        sharpen: bool,
    ) -> Result<GroupTemplate> {
        if rounds == 0 {
            return Err(ScanflowError::Configuration(
                "iterative template needs at least one round".to_string(),
            ));
        }
        let keys: Vec<IterationKey> = inputs.iter().map(|i| i.key.clone()).collect();
        let mut template = reference.clone();
        let mut last_outputs = Vec::new();
        let mut completed = 0;

        for round in 1..=rounds {
            let outputs = self.register_round(inputs, &template, round).await?;
            let warped: Vec<ImageHandle> = outputs.iter().map(|o| o.value.warped.clone()).collect();

            let round_dir = self.round_dir(round);
            let averaged = self
                .io
                .average(&warped, &round_dir.join("template.nii.gz"))
                .await?;
            let next = if sharpen {
                self.io
                    .sharpen(&averaged, &round_dir.join("template_sharpened.nii.gz"))
                    .await?
            } else {
                averaged
            };

            // Round 1 compares against the reference, which is not a built template
            let difference = if round > 1 && tolerance.is_some() {
                self.io.mean_abs_difference(&template, &next).await?
            } else {
                None
            };

            last_outputs = outputs;
            template = next;
            completed = round;
            debug!("Round {}/{} produced {}", round, rounds, template);

            if let (Some(tol), Some(diff)) = (tolerance, difference) {
                if diff < tol {
                    info!(
                        "Template converged after round {} (difference {:.6} < {})",
                        round, diff, tol
                    );
                    break;
                }
            } else if tolerance.is_some() && round > 1 {
                warn!(
                    "Image adapter '{}' cannot measure template differences, running all rounds",
                    self.io.name()
                );
            }
        }

        GroupTemplate::new(template, to_chains(last_outputs)?, &keys, completed)
    }

    /// Alignment target of a direct strategy
    pub async fn direct_target(
        &self,
        inputs: &[Keyed<ImageHandle>],
        reference: &ImageHandle,
    ) -> Result<ImageHandle> {
        let TemplateStrategy::Direct {
            target,
            single_input,
        } = &self.strategy
        else {
            return Err(ScanflowError::Configuration(
                "direct target requested from an iterative builder".to_string(),
            ));
        };

        let first = inputs
            .iter()
            .min_by(|a, b| a.key.cmp(&b.key))
            .ok_or_else(|| ScanflowError::TaskFailed("no inputs for template".to_string()))?;

        match target {
            DirectTarget::Reference => Ok(reference.clone()),
            DirectTarget::FirstInput => Ok(first.value.clone()),
            DirectTarget::Average => {
                if inputs.len() == 1 && *single_input == SingleInputPolicy::PassThrough {
                    debug!("Single input, template is {}", first.value);
                    return Ok(first.value.clone());
                }
                let images: Vec<ImageHandle> = inputs.iter().map(|i| i.value.clone()).collect();
                let output = self.work_dir.join("template.nii.gz");
                ensure_dir(&self.work_dir).await?;
                Ok(self.io.average(&images, &output).await?)
            }
        }
    }

    /// One registration of `input` onto an already-known template, used when
    /// each input registers in its own graph replica
    pub async fn register_to_template(
        &self,
        input: &Keyed<ImageHandle>,
        template: &ImageHandle,
    ) -> Result<TransformChain> {
        if input.value == *template {
            return TransformChain::identity(Space::Native, Space::GroupTemplate);
        }
        let dir = self.round_dir(1);
        ensure_dir(&dir).await?;
        let output = self
            .registration
            .register(&self.request(input, template, &dir))
            .await?;
        TransformChain::from_registration(&output, Space::Native, Space::GroupTemplate)
    }

    fn round_dir(&self, round: u32) -> PathBuf {
        self.work_dir.join(format!("round-{round}"))
    }

    fn request(
        &self,
        input: &Keyed<ImageHandle>,
        template: &ImageHandle,
        dir: &Path,
    ) -> RegistrationRequest {
        RegistrationRequest {
            moving: input.value.clone(),
            fixed: template.clone(),
            mask: self.mask.clone(),
            output_prefix: dir.join(input.key.to_string()),
        }
    }

    /// Register every input to `template`, bounded by `workers_for`.
    ///
    /// Waits for all registrations before returning, even after a failure.
    async fn register_round(
        &self,
        inputs: &[Keyed<ImageHandle>],
        template: &ImageHandle,
        round: u32,
    ) -> Result<Vec<Keyed<RegistrationOutput>>> {
        let dir = self.round_dir(round);
        ensure_dir(&dir).await?;

        let semaphore = Arc::new(Semaphore::new(self.workers_for(inputs.len())));
        let mut tasks = JoinSet::new();
        for input in inputs {
            let semaphore = semaphore.clone();
            let registration = self.registration.clone();
            let request = self.request(input, template, &dir);
            let key = input.key.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                debug!("Round {} registering {}", round, key);
                let result = registration.register(&request).await;
                (key, result)
            });
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        let mut failure: Option<ScanflowError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(output))) => outputs.push(Keyed::new(key, output)),
                Ok((key, Err(e))) => {
                    warn!("Round {} registration of {} failed: {}", round, key, e);
                    if failure.is_none() {
                        failure = Some(ScanflowError::Registration(format!(
                            "{key} in round {round}: {e}"
                        )));
                    }
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(ScanflowError::TaskFailed(format!(
                            "registration task aborted: {e}"
                        )));
                    }
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        outputs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(outputs)
    }
}

fn identity_chains(keys: &[IterationKey]) -> Result<Vec<Keyed<TransformChain>>> {
    keys.iter()
        .map(|key| {
            Ok(Keyed::new(
                key.clone(),
                TransformChain::identity(Space::Native, Space::GroupTemplate)?,
            ))
        })
        .collect()
}

fn to_chains(outputs: Vec<Keyed<RegistrationOutput>>) -> Result<Vec<Keyed<TransformChain>>> {
    outputs
        .into_iter()
        .map(|o| {
            let chain =
                TransformChain::from_registration(&o.value, Space::Native, Space::GroupTemplate)?;
            Ok(Keyed::new(o.key, chain))
        })
        .collect()
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}
