//! Task nodes of the preprocessing pipeline
//!
//! Each node wraps one core operation and moves typed values in and out of
//! the graph's JSON slots.

use crate::graph::{to_value, NodeInputs, NodeOutputs, Task};
use async_trait::async_trait;
use scanflow_common::{IterationKey, Keyed, Result, ScanRecord, ScanflowError};
use scanflow_core::{
    compose, AtlasResampling, DirectTarget, GroupTemplateBuilder, IdentityResolver, ImageHandle,
    ImageIo, Interpolation, Manifest, NamedImage, OutputLayout, RegistrationAdapter,
    RegistrationRequest, Space, TemplateStrategy, TransformChain, TransformChainComposer,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Atlas entry (and propagated mask) that masks registrations
const BRAIN_MASK: &str = "brain_mask";

fn slots<const N: usize>(pairs: [(&str, Value); N]) -> NodeOutputs {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Opens the scan injected on `slot`
pub struct LoadScan {
    io: Arc<dyn ImageIo>,
    slot: String,
}

impl LoadScan {
    pub fn new(io: Arc<dyn ImageIo>, slot: impl Into<String>) -> Self {
        Self {
            io,
            slot: slot.into(),
        }
    }
}

#[async_trait]
impl Task for LoadScan {
    fn inputs(&self) -> Vec<&str> {
        vec![self.slot.as_str()]
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["image"]
    }

    fn params(&self) -> Value {
        json!({ "io": self.io.name() })
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let record: ScanRecord = inputs.get(&self.slot)?;
        let image = self.io.load(&record.path).await?;
        debug!("Loaded {} scan {}", record.modality, image);
        Ok(slots([("image", to_value(&image)?)]))
    }
}

/// Brings the atlas reference, masks and labels onto the data's grid before
/// anything registers against them.
///
/// Publishes `reference` and `atlas`, the original files when no resampling
/// is needed.
pub struct ResampleAtlas {
    io: Arc<dyn ImageIo>,
    reference: ImageHandle,
    atlas: Vec<NamedImage>,
    resampling: AtlasResampling,
    work_dir: PathBuf,
}

impl ResampleAtlas {
    pub fn new(
        io: Arc<dyn ImageIo>,
        reference: ImageHandle,
        atlas: Vec<NamedImage>,
        resampling: AtlasResampling,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            io,
            reference,
            atlas,
            resampling,
            work_dir: work_dir.into(),
        }
    }

    /// Spacing to resample to, `None` to keep the atlas grid
    async fn target_spacing(&self, images: &[Keyed<ImageHandle>]) -> Result<Option<[f64; 3]>> {
        if let AtlasResampling::Spacing(spacing) = self.resampling {
            return Ok(Some(spacing));
        }
        if images.is_empty() {
            return Ok(None);
        }

        let mut finest = f64::INFINITY;
        for image in images {
            let Some(spacing) = self.io.spacing(&image.value).await? else {
                debug!(
                    "Image adapter '{}' cannot read voxel spacing, atlas keeps its grid",
                    self.io.name()
                );
                return Ok(None);
            };
            finest = finest.min(smallest(spacing));
        }
        let Some(atlas) = self.io.spacing(&self.reference).await? else {
            return Ok(None);
        };
        if smallest(atlas) >= finest {
            info!(
                "Atlas keeps its {} mm grid (finest input spacing {} mm)",
                smallest(atlas),
                finest
            );
            return Ok(None);
        }
        Ok(Some([finest; 3]))
    }
}

/// The `brain_mask` entry of an atlas or of propagated masks
fn brain_mask(images: &[NamedImage]) -> Option<ImageHandle> {
    images
        .iter()
        .find(|entry| entry.name == BRAIN_MASK)
        .map(|entry| entry.image.clone())
}

/// `builder` masked by the atlas brain mask when one is configured
fn masked(builder: &GroupTemplateBuilder, atlas: &[NamedImage]) -> GroupTemplateBuilder {
    match brain_mask(atlas) {
        Some(mask) => builder.clone().with_mask(mask),
        None => builder.clone(),
    }
}

fn smallest(spacing: [f64; 3]) -> f64 {
    spacing.into_iter().fold(f64::INFINITY, f64::min)
}

#[async_trait]
impl Task for ResampleAtlas {
    fn inputs(&self) -> Vec<&str> {
        vec!["images"]
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["reference", "atlas"]
    }

    fn params(&self) -> Value {
        json!({
            "io": self.io.name(),
            "reference": self.reference,
            "atlas": self.atlas,
            "resampling": self.resampling,
        })
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let images: Vec<Keyed<ImageHandle>> = inputs.get("images")?;
        let Some(spacing) = self.target_spacing(&images).await? else {
            return Ok(slots([
                ("reference", to_value(&self.reference)?),
                ("atlas", to_value(&self.atlas)?),
            ]));
        };

        let [x, y, z] = spacing;
        info!("Resampling atlas to {}x{}x{} mm", x, y, z);
        ensure_dir(&self.work_dir).await?;
        let reference = self
            .io
            .resample_spacing(
                &self.reference,
                spacing,
                Interpolation::Linear,
                &self.work_dir.join("reference.nii.gz"),
            )
            .await?;
        let mut atlas = Vec::with_capacity(self.atlas.len());
        for entry in &self.atlas {
            let image = self
                .io
                .resample_spacing(
                    &entry.image,
                    spacing,
                    Interpolation::Label,
                    &self.work_dir.join(format!("{}.nii.gz", entry.name)),
                )
                .await?;
            atlas.push(NamedImage {
                name: entry.name.clone(),
                image,
            });
        }
        Ok(slots([
            ("reference", to_value(&reference)?),
            ("atlas", to_value(&atlas)?),
        ]))
    }
}

/// Whether inputs register onto the template in their own replicas rather
/// than inside the template build
pub fn registers_per_replica(strategy: &TemplateStrategy) -> bool {
    matches!(
        strategy,
        TemplateStrategy::Direct {
            target: DirectTarget::Reference | DirectTarget::FirstInput,
            ..
        }
    )
}

/// Builds the group template from the joined native images.
///
/// Publishes `template` and, when the build registers every input itself,
/// the per-key `chains`; otherwise `chains` is null and each replica
/// registers on its own.
pub struct BuildTemplate {
    builder: GroupTemplateBuilder,
}

impl BuildTemplate {
    pub fn new(builder: GroupTemplateBuilder) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl Task for BuildTemplate {
    fn inputs(&self) -> Vec<&str> {
        vec!["images", "reference", "atlas"]
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["template", "chains"]
    }

    fn params(&self) -> Value {
        json!({ "strategy": self.builder.strategy() })
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let images: Vec<Keyed<ImageHandle>> = inputs.get("images")?;
        let reference: ImageHandle = inputs.get("reference")?;
        let atlas: Vec<NamedImage> = inputs.get("atlas")?;
        let builder = masked(&self.builder, &atlas);
        if registers_per_replica(builder.strategy()) {
            let template = builder.direct_target(&images, &reference).await?;
            info!("Direct template target: {}", template);
            return Ok(slots([("template", to_value(&template)?), ("chains", Value::Null)]));
        }

        let template = builder.build(&images, &reference).await?;
        Ok(slots([
            ("template", to_value(template.image())?),
            ("chains", to_value(&template.chains())?),
        ]))
    }
}

/// Native → group template chain of one replica
pub struct NativeToTemplate {
    builder: GroupTemplateBuilder,
}

impl NativeToTemplate {
    pub fn new(builder: GroupTemplateBuilder) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl Task for NativeToTemplate {
    fn inputs(&self) -> Vec<&str> {
        vec!["image", "template", "chains", "atlas"]
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["chain"]
    }

    fn params(&self) -> Value {
        json!({ "strategy": self.builder.strategy() })
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let key = inputs.require_key()?.clone();
        let chains: Option<Vec<Keyed<TransformChain>>> = inputs.get("chains")?;
        let chain = match chains {
            Some(chains) => IdentityResolver::resolve(&chains, &key)?.clone(),
            None => {
                let image: ImageHandle = inputs.get("image")?;
                let template: ImageHandle = inputs.get("template")?;
                let atlas: Vec<NamedImage> = inputs.get("atlas")?;
                masked(&self.builder, &atlas)
                    .register_to_template(&Keyed::new(key.clone(), image), &template)
                    .await?
            }
        };
        debug!("{}: native -> template in {} steps", key, chain.steps().len());
        Ok(slots([("chain", to_value(&chain)?)]))
    }
}

/// Group template → commonspace registration, done once per run
pub struct CommonspaceRegistration {
    registration: Arc<dyn RegistrationAdapter>,
    work_dir: PathBuf,
}

impl CommonspaceRegistration {
    pub fn new(registration: Arc<dyn RegistrationAdapter>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            registration,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl Task for CommonspaceRegistration {
    fn inputs(&self) -> Vec<&str> {
        vec!["template", "reference", "atlas"]
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["chain"]
    }

    fn params(&self) -> Value {
        json!({ "registration": self.registration.name() })
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let template: ImageHandle = inputs.get("template")?;
        let reference: ImageHandle = inputs.get("reference")?;
        let atlas: Vec<NamedImage> = inputs.get("atlas")?;
        let chain = if template == reference {
            TransformChain::identity(Space::GroupTemplate, Space::Commonspace)?
        } else {
            ensure_dir(&self.work_dir).await?;
            let request = RegistrationRequest {
                moving: template.clone(),
                fixed: reference,
                mask: brain_mask(&atlas),
                output_prefix: self.work_dir.join("template_to_commonspace"),
            };
            let output = self.registration.register(&request).await?;
            TransformChain::from_registration(&output, Space::GroupTemplate, Space::Commonspace)?
        };
        info!("Template -> commonspace chain has {} steps", chain.steps().len());
        Ok(slots([("chain", to_value(&chain)?)]))
    }
}

/// Registers a functional run onto its session's anatomical scan, masked by
/// the brain mask propagated into that anatomy when there is one
pub struct RunToAnatomy {
    registration: Arc<dyn RegistrationAdapter>,
    layout: OutputLayout,
    node: String,
}

impl RunToAnatomy {
    pub fn new(
        registration: Arc<dyn RegistrationAdapter>,
        layout: OutputLayout,
        node: impl Into<String>,
    ) -> Self {
        Self {
            registration,
            layout,
            node: node.into(),
        }
    }
}

#[async_trait]
impl Task for RunToAnatomy {
    fn inputs(&self) -> Vec<&str> {
        vec!["image", "anatomy", "masks"]
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["chain"]
    }

    fn params(&self) -> Value {
        json!({ "registration": self.registration.name() })
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let key = inputs.require_key()?;
        let image: ImageHandle = inputs.get("image")?;
        let anatomy: ImageHandle = inputs.get("anatomy")?;
        let masks: Vec<NamedImage> = inputs.get("masks")?;
        let mask = brain_mask(&masks);

        let dir = self.layout.work_dir(&self.node, Some(key));
        ensure_dir(&dir).await?;
        let request = RegistrationRequest {
            moving: image,
            fixed: anatomy,
            mask,
            output_prefix: dir.join("bold_to_anat"),
        };
        let output = self.registration.register(&request).await?;
        let chain = TransformChain::from_registration(&output, Space::Functional, Space::Native)?;
        debug!("{}: run -> anatomy in {} steps", key, chain.steps().len());
        Ok(slots([("chain", to_value(&chain)?)]))
    }
}

/// Composes the chains on its chain slots (application order) and resamples
/// the image onto the commonspace reference
pub struct ToCommonspace {
    composer: TransformChainComposer,
    layout: OutputLayout,
    node: String,
    chain_slots: Vec<String>,
}

impl ToCommonspace {
    pub fn new(
        composer: TransformChainComposer,
        layout: OutputLayout,
        node: impl Into<String>,
        chain_slots: &[&str],
    ) -> Self {
        Self {
            composer,
            layout,
            node: node.into(),
            chain_slots: chain_slots.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Task for ToCommonspace {
    fn inputs(&self) -> Vec<&str> {
        ["image", "reference"]
            .into_iter()
            .chain(self.chain_slots.iter().map(String::as_str))
            .collect()
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["image", "chain"]
    }

    fn params(&self) -> Value {
        json!({ "chains": self.chain_slots })
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let key = inputs.require_key()?;
        let image: ImageHandle = inputs.get("image")?;
        let reference: ImageHandle = inputs.get("reference")?;
        let chains = self
            .chain_slots
            .iter()
            .map(|slot| inputs.get::<TransformChain>(slot))
            .collect::<Result<Vec<_>>>()?;

        let chain = compose(&chains)?;
        let dir = self.layout.work_dir(&self.node, Some(key));
        ensure_dir(&dir).await?;
        let resampled = self
            .composer
            .apply(
                &image,
                &chain,
                &reference,
                Interpolation::Linear,
                &dir.join("commonspace.nii.gz"),
            )
            .await?;
        Ok(slots([
            ("image", to_value(&resampled)?),
            ("chain", to_value(&chain)?),
        ]))
    }
}

/// Brings atlas masks and labels into the replica's native space
pub struct PropagateAtlas {
    composer: TransformChainComposer,
    layout: OutputLayout,
    node: String,
}

impl PropagateAtlas {
    pub fn new(composer: TransformChainComposer, layout: OutputLayout, node: impl Into<String>) -> Self {
        Self {
            composer,
            layout,
            node: node.into(),
        }
    }
}

#[async_trait]
impl Task for PropagateAtlas {
    fn inputs(&self) -> Vec<&str> {
        vec!["image", "chain", "atlas"]
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["masks"]
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let atlas: Vec<NamedImage> = inputs.get("atlas")?;
        if atlas.is_empty() {
            return Ok(slots([("masks", json!([]))]));
        }
        let key = inputs.require_key()?;
        let native: ImageHandle = inputs.get("image")?;
        let chain: TransformChain = inputs.get("chain")?;
        let dir = self.layout.work_dir(&self.node, Some(key));
        ensure_dir(&dir).await?;
        let masks = self
            .composer
            .propagate_atlas(&atlas, &chain, &native, &dir)
            .await?;
        Ok(slots([("masks", to_value(&masks)?)]))
    }
}

/// Persists a replica's outputs under its key directory and writes the
/// manifest. Always runs, so outputs reappear even when upstream results
/// come from the cache.
pub struct WriteOutputs {
    io: Arc<dyn ImageIo>,
    layout: OutputLayout,
    with_runs: bool,
}

impl WriteOutputs {
    pub fn new(io: Arc<dyn ImageIo>, layout: OutputLayout) -> Self {
        Self {
            io,
            layout,
            with_runs: false,
        }
    }

    /// Also persist the joined functional runs of a session
    pub fn with_runs(mut self) -> Self {
        self.with_runs = true;
        self
    }

    async fn save(
        &self,
        image: &ImageHandle,
        key: &IterationKey,
        role: &str,
        files: &mut BTreeMap<String, PathBuf>,
    ) -> Result<()> {
        let dir = self.layout.key_dir(key);
        ensure_dir(&dir).await?;
        let dest = dir.join(format!("{key}_{role}.nii.gz"));
        let saved = self.io.save(image, &dest).await?;
        files.insert(role.to_string(), saved.path().to_path_buf());
        Ok(())
    }
}

#[async_trait]
impl Task for WriteOutputs {
    fn inputs(&self) -> Vec<&str> {
        if self.with_runs {
            vec!["image", "masks", "chain", "runs"]
        } else {
            vec!["image", "masks", "chain"]
        }
    }

    fn outputs(&self) -> Vec<&str> {
        vec!["manifest"]
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        let key = inputs.require_key()?.clone();
        let image: ImageHandle = inputs.get("image")?;
        let masks: Vec<NamedImage> = inputs.get("masks")?;
        let chain: TransformChain = inputs.get("chain")?;

        let mut manifest = Manifest {
            key: Some(key.clone()),
            ..Manifest::default()
        };
        self.save(&image, &key, "space-commonspace", &mut manifest.files)
            .await?;
        for mask in &masks {
            self.save(&mask.image, &key, &mask.name, &mut manifest.files)
                .await?;
        }

        if self.with_runs {
            let runs: Vec<Keyed<ImageHandle>> = inputs.get("runs")?;
            for run in &runs {
                let mut run_files = BTreeMap::new();
                self.save(&run.value, &run.key, "space-commonspace_bold", &mut run_files)
                    .await?;
                for (role, path) in run_files {
                    manifest.files.insert(format!("{}/{role}", run.key), path);
                }
            }
        }

        let chain_path = self.layout.key_dir(&key).join(format!("{key}_transforms.json"));
        let chain_json = serde_json::to_vec_pretty(&chain)
            .map_err(|e| ScanflowError::TaskFailed(format!("cannot serialize chain: {e}")))?;
        tokio::fs::write(&chain_path, chain_json).await?;
        manifest.files.insert("transforms".to_string(), chain_path);

        let path = self.layout.write_manifest(&key, &manifest).await?;
        info!("{}: wrote {} outputs", key, manifest.files.len());
        Ok(slots([("manifest", to_value(&path)?)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanflow_test_utils::{bump, SyntheticImaging};

    #[test]
    fn test_per_replica_strategies() {
        assert!(registers_per_replica(&TemplateStrategy::direct(DirectTarget::Reference)));
        assert!(registers_per_replica(&TemplateStrategy::direct(DirectTarget::FirstInput)));
        assert!(!registers_per_replica(&TemplateStrategy::direct(DirectTarget::Average)));
        assert!(!registers_per_replica(&TemplateStrategy::iterative(2)));
    }

    struct AtlasFixture {
        _dir: tempfile::TempDir,
        imaging: SyntheticImaging,
        reference: ImageHandle,
        atlas: Vec<NamedImage>,
        scans: Vec<Keyed<ImageHandle>>,
        work_dir: PathBuf,
    }

    /// A 0.5 mm atlas and two scans at `scan_spacing`
    fn atlas_fixture(scan_spacing: f64) -> AtlasFixture {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let imaging = SyntheticImaging::new();
        let reference = imaging
            .create_with_spacing(dir.path().join("reference.nii.gz"), bump(16, 8), 0.5)
            .expect("write reference");
        let mask = imaging
            .create_with_spacing(dir.path().join("brain_mask.nii.gz"), vec![1.0; 16], 0.5)
            .expect("write mask");
        let scans = ["01", "02"]
            .into_iter()
            .map(|subject| {
                let image = imaging
                    .create_with_spacing(
                        dir.path().join(format!("sub-{subject}.nii.gz")),
                        bump(8, 4),
                        scan_spacing,
                    )
                    .expect("write scan");
                Keyed::new(IterationKey::subject(subject), image)
            })
            .collect();
        let work_dir = dir.path().join("template").join("atlas");
        AtlasFixture {
            imaging,
            reference,
            atlas: vec![NamedImage {
                name: BRAIN_MASK.to_string(),
                image: mask,
            }],
            scans,
            work_dir,
            _dir: dir,
        }
    }

    async fn resample_atlas(
        fixture: &AtlasFixture,
        resampling: AtlasResampling,
    ) -> (ImageHandle, Vec<NamedImage>) {
        let task = ResampleAtlas::new(
            fixture.imaging.image_io(),
            fixture.reference.clone(),
            fixture.atlas.clone(),
            resampling,
            &fixture.work_dir,
        );
        let values = BTreeMap::from([(
            "images".to_string(),
            to_value(&fixture.scans).expect("serialize"),
        )]);
        let mut outputs = task
            .run(NodeInputs::new(None, values))
            .await
            .expect("resample atlas");
        let reference = serde_json::from_value(outputs.remove("reference").expect("reference"))
            .expect("reference handle");
        let atlas = serde_json::from_value(outputs.remove("atlas").expect("atlas"))
            .expect("atlas images");
        (reference, atlas)
    }

    #[tokio::test]
    async fn test_atlas_follows_finest_input_spacing() {
        let fixture = atlas_fixture(1.0);
        let (reference, atlas) = resample_atlas(&fixture, AtlasResampling::InputsDefined).await;

        assert_eq!(reference.path(), fixture.work_dir.join("reference.nii.gz"));
        assert_eq!(fixture.imaging.spacing_of(reference.path()), 1.0);
        assert_eq!(fixture.imaging.get(&reference).expect("stored").len(), 8);
        assert_eq!(atlas[0].name, BRAIN_MASK);
        assert_eq!(fixture.imaging.spacing_of(atlas[0].image.path()), 1.0);
    }

    #[tokio::test]
    async fn test_atlas_keeps_its_grid_when_data_is_as_fine() {
        let fixture = atlas_fixture(0.5);
        let (reference, atlas) = resample_atlas(&fixture, AtlasResampling::InputsDefined).await;
        assert_eq!(reference, fixture.reference);
        assert_eq!(atlas, fixture.atlas);
        assert!(!fixture.work_dir.exists());
    }

    #[tokio::test]
    async fn test_explicit_atlas_spacing_always_applies() {
        let fixture = atlas_fixture(0.5);
        let (reference, _) =
            resample_atlas(&fixture, AtlasResampling::Spacing([2.0, 2.0, 2.0])).await;
        assert_eq!(fixture.imaging.spacing_of(reference.path()), 2.0);
        assert_eq!(fixture.imaging.get(&reference).expect("stored").len(), 4);
    }
}
