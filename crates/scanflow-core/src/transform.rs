//! Transform chains across the (functional →) native → group-template →
//! commonspace hierarchy
//!
//! # Ordering contract
//!
//! A chain's steps are a stack in the order the resampling collaborator
//! consumes them: the LAST step is applied to the moving image first.
//!
//! - A registration hop is `[warp, affine]` (`[affine]` when linear-only).
//! - `compose([A→B, B→C])` is `steps(B→C) ++ steps(A→B)`.
//! - `inverse()` reverses the steps and flips every invert flag. An inverted
//!   warp resolves to its inverse displacement field.
//!
//! Every chain records the spaces it passes through and each consecutive pair
//! must be one hierarchy level apart, so a composed chain can never skip the
//! group-template hop.

use crate::adapter::{ImageHandle, ImageIo, Interpolation, RegistrationOutput};
use scanflow_common::{Result, ScanflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Coordinate spaces, ordered by hierarchy level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Space {
    /// A functional run nested under a session, one level below that
    /// session's anatomical scan
    Functional,
    Native,
    GroupTemplate,
    Commonspace,
}

impl Space {
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::Functional => 0,
            Self::Native => 1,
            Self::GroupTemplate => 2,
            Self::Commonspace => 3,
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Functional => "functional",
            Self::Native => "native",
            Self::GroupTemplate => "group-template",
            Self::Commonspace => "commonspace",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Affine,
    Warp,
}

/// One coordinate mapping stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transform {
    pub kind: TransformKind,
    pub path: PathBuf,
    /// Inverse displacement field (warps only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_path: Option<PathBuf>,
}

impl Transform {
    pub fn affine(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: TransformKind::Affine,
            path: path.into(),
            inverse_path: None,
        }
    }

    pub fn warp(forward: impl Into<PathBuf>, inverse: impl Into<PathBuf>) -> Self {
        Self {
            kind: TransformKind::Warp,
            path: forward.into(),
            inverse_path: Some(inverse.into()),
        }
    }
}

/// A transform plus its invert flag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransformStep {
    pub transform: Transform,
    pub invert: bool,
}

impl TransformStep {
    #[must_use]
    pub fn forward(transform: Transform) -> Self {
        Self {
            transform,
            invert: false,
        }
    }

    /// File the resampler should read and whether it must invert it itself.
    ///
    /// Affines are inverted by the resampler; warps switch to their inverse
    /// field instead.
    pub fn resolve(&self) -> Result<(&Path, bool)> {
        match (self.transform.kind, self.invert) {
            (TransformKind::Affine, invert) => Ok((self.transform.path.as_path(), invert)),
            (TransformKind::Warp, false) => Ok((self.transform.path.as_path(), false)),
            (TransformKind::Warp, true) => self
                .transform
                .inverse_path
                .as_deref()
                .map(|path| (path, false))
                .ok_or_else(|| {
                    ScanflowError::Composition(format!(
                        "warp {} has no inverse field",
                        self.transform.path.display()
                    ))
                }),
        }
    }
}

/// Ordered transform stack between two spaces.
///
/// Deserialized chains go through the same hop checks as constructed ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawChain")]
pub struct TransformChain {
    /// Spaces traversed from source to target, one level per hop
    spaces: Vec<Space>,
    steps: Vec<TransformStep>,
}

#[derive(Deserialize)]
struct RawChain {
    spaces: Vec<Space>,
    steps: Vec<TransformStep>,
}

impl TryFrom<RawChain> for TransformChain {
    type Error = ScanflowError;

    fn try_from(raw: RawChain) -> Result<Self> {
        check_path(&raw.spaces)?;
        Ok(Self {
            spaces: raw.spaces,
            steps: raw.steps,
        })
    }
}

impl TransformChain {
    /// A single hop between adjacent hierarchy levels
    pub fn hop(source: Space, target: Space, steps: Vec<TransformStep>) -> Result<Self> {
        check_adjacent(source, target)?;
        Ok(Self {
            spaces: vec![source, target],
            steps,
        })
    }

    /// An empty hop. The hop is still recorded so composition cannot skip it.
    pub fn identity(source: Space, target: Space) -> Result<Self> {
        Self::hop(source, target, Vec::new())
    }

    /// Build the hop produced by a registration: `[warp, affine]`, or
    /// `[affine]` for a linear-only registration
    pub fn from_registration(
        output: &RegistrationOutput,
        source: Space,
        target: Space,
    ) -> Result<Self> {
        let mut steps = Vec::with_capacity(2);
        match (&output.warp, &output.inverse_warp) {
            (Some(warp), Some(inverse)) => {
                steps.push(TransformStep::forward(Transform::warp(warp, inverse)));
            }
            (None, None) => {}
            _ => {
                return Err(ScanflowError::Registration(format!(
                    "registration producing {} returned only one of warp/inverse warp",
                    output.warped
                )))
            }
        }
        steps.push(TransformStep::forward(Transform::affine(&output.affine)));
        Self::hop(source, target, steps)
    }

    // Every chain holds at least two spaces, the fallbacks are unreachable
    #[must_use]
    pub fn source(&self) -> Space {
        self.spaces.first().copied().unwrap_or(Space::Native)
    }

    #[must_use]
    pub fn target(&self) -> Space {
        self.spaces.last().copied().unwrap_or(Space::Native)
    }

    #[must_use]
    pub fn spaces(&self) -> &[Space] {
        &self.spaces
    }

    #[must_use]
    pub fn steps(&self) -> &[TransformStep] {
        &self.steps
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// Chain mapping target back to source
    #[must_use]
    pub fn inverse(&self) -> Self {
        let spaces = self.spaces.iter().rev().copied().collect();
        let steps = self
            .steps
            .iter()
            .rev()
            .map(|step| TransformStep {
                transform: step.transform.clone(),
                invert: !step.invert,
            })
            .collect();
        Self { spaces, steps }
    }
}

fn check_path(spaces: &[Space]) -> Result<()> {
    if spaces.len() < 2 {
        return Err(ScanflowError::Composition(format!(
            "a chain needs a source and a target space, got {spaces:?}"
        )));
    }
    spaces
        .windows(2)
        .try_for_each(|pair| check_adjacent(pair[0], pair[1]))
}

fn check_adjacent(source: Space, target: Space) -> Result<()> {
    if source.level().abs_diff(target.level()) == 1 {
        Ok(())
    } else {
        Err(ScanflowError::Composition(format!(
            "a hop must span exactly one level, got {source} -> {target}"
        )))
    }
}

/// Compose chains given in application order (first chain applied first).
pub fn compose(chains: &[TransformChain]) -> Result<TransformChain> {
    let (first, rest) = chains
        .split_first()
        .ok_or_else(|| ScanflowError::Composition("nothing to compose".to_string()))?;

    let mut spaces = first.spaces.clone();
    let mut current = first.target();
    for chain in rest {
        if chain.source() != current {
            return Err(ScanflowError::Composition(format!(
                "hop mismatch: chain ends in {current} but next chain starts in {}",
                chain.source()
            )));
        }
        spaces.extend(chain.spaces.iter().skip(1).copied());
        current = chain.target();
    }

    let total = chains.iter().map(|c| c.steps.len()).sum();
    let mut steps = Vec::with_capacity(total);
    for chain in chains.iter().rev() {
        steps.extend(chain.steps.iter().cloned());
    }

    debug!(
        "Composed {} chains ({} steps) along {:?}",
        chains.len(),
        steps.len(),
        spaces
    );
    Ok(TransformChain { spaces, steps })
}

/// A named image (mask, tissue map or label atlas)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedImage {
    pub name: String,
    pub image: ImageHandle,
}

/// Applies chains through the image collaborator
#[derive(Clone)]
pub struct TransformChainComposer {
    io: Arc<dyn ImageIo>,
}

impl TransformChainComposer {
    pub fn new(io: Arc<dyn ImageIo>) -> Self {
        Self { io }
    }

    /// Resample `image` through `chain` into `reference`'s geometry
    pub async fn apply(
        &self,
        image: &ImageHandle,
        chain: &TransformChain,
        reference: &ImageHandle,
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<ImageHandle> {
        debug!(
            "Resampling {} {} -> {} ({} steps, {:?})",
            image,
            chain.source(),
            chain.target(),
            chain.steps.len(),
            interpolation
        );
        Ok(self
            .io
            .resample(image, chain.steps(), reference, interpolation, output)
            .await?)
    }

    /// Map commonspace atlas images into a subject's native space.
    ///
    /// `native_to_common` must start in native space and end in commonspace;
    /// it is inverted here and applied with label-preserving interpolation.
    pub async fn propagate_atlas(
        &self,
        atlas: &[NamedImage],
        native_to_common: &TransformChain,
        native_reference: &ImageHandle,
        output_dir: &Path,
    ) -> Result<Vec<NamedImage>> {
        if native_to_common.source() != Space::Native
            || native_to_common.target() != Space::Commonspace
        {
            return Err(ScanflowError::Composition(format!(
                "atlas propagation needs a native -> commonspace chain, got {} -> {}",
                native_to_common.source(),
                native_to_common.target()
            )));
        }
        let common_to_native = native_to_common.inverse();

        let mut propagated = Vec::with_capacity(atlas.len());
        for entry in atlas {
            let output = output_dir.join(format!("{}.nii.gz", entry.name));
            let image = self
                .apply(
                    &entry.image,
                    &common_to_native,
                    native_reference,
                    Interpolation::Label,
                    &output,
                )
                .await?;
            propagated.push(NamedImage {
                name: entry.name.clone(),
                image,
            });
        }
        Ok(propagated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(prefix: &str, nonlinear: bool) -> RegistrationOutput {
        RegistrationOutput {
            affine: PathBuf::from(format!("{prefix}_affine.mat")),
            warp: nonlinear.then(|| PathBuf::from(format!("{prefix}_warp.nii.gz"))),
            inverse_warp: nonlinear.then(|| PathBuf::from(format!("{prefix}_inv.nii.gz"))),
            warped: ImageHandle::new(format!("{prefix}_warped.nii.gz")),
        }
    }

    #[test]
    fn test_registration_hop_order() {
        let chain = TransformChain::from_registration(
            &registration("a", true),
            Space::Native,
            Space::GroupTemplate,
        )
        .unwrap();
        assert_eq!(chain.steps().len(), 2);
        assert_eq!(chain.steps()[0].transform.kind, TransformKind::Warp);
        assert_eq!(chain.steps()[1].transform.kind, TransformKind::Affine);

        let linear = TransformChain::from_registration(
            &registration("b", false),
            Space::Native,
            Space::GroupTemplate,
        )
        .unwrap();
        assert_eq!(linear.steps().len(), 1);
    }

    #[test]
    fn test_half_warp_output_is_rejected() {
        let mut output = registration("a", true);
        output.inverse_warp = None;
        assert!(TransformChain::from_registration(&output, Space::Native, Space::GroupTemplate)
            .is_err());
    }

    #[test]
    fn test_compose_puts_later_hop_first() {
        let native = TransformChain::from_registration(
            &registration("n2t", true),
            Space::Native,
            Space::GroupTemplate,
        )
        .unwrap();
        let template = TransformChain::from_registration(
            &registration("t2c", true),
            Space::GroupTemplate,
            Space::Commonspace,
        )
        .unwrap();

        let composed = compose(&[native, template]).unwrap();
        let files: Vec<_> = composed
            .steps()
            .iter()
            .map(|s| s.transform.path.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            files,
            vec![
                "t2c_warp.nii.gz",
                "t2c_affine.mat",
                "n2t_warp.nii.gz",
                "n2t_affine.mat"
            ]
        );
        assert_eq!(
            composed.spaces(),
            &[Space::Native, Space::GroupTemplate, Space::Commonspace]
        );
    }

    #[test]
    fn test_inverse_of_composed_chain() {
        let native = TransformChain::from_registration(
            &registration("n2t", true),
            Space::Native,
            Space::GroupTemplate,
        )
        .unwrap();
        let template = TransformChain::from_registration(
            &registration("t2c", false),
            Space::GroupTemplate,
            Space::Commonspace,
        )
        .unwrap();
        let inverse = compose(&[native, template]).unwrap().inverse();

        assert_eq!(inverse.source(), Space::Commonspace);
        assert_eq!(inverse.target(), Space::Native);
        let resolved: Vec<_> = inverse
            .steps()
            .iter()
            .map(|s| {
                let (path, invert) = s.resolve().unwrap();
                (path.to_string_lossy().to_string(), invert)
            })
            .collect();
        assert_eq!(
            resolved,
            vec![
                ("n2t_affine.mat".to_string(), true),
                ("n2t_inv.nii.gz".to_string(), false),
                ("t2c_affine.mat".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_inverse_twice_restores_chain() {
        let chain = TransformChain::from_registration(
            &registration("x", true),
            Space::Native,
            Space::GroupTemplate,
        )
        .unwrap();
        assert_eq!(chain.inverse().inverse(), chain);
    }

    #[test]
    fn test_hop_mismatch_is_rejected() {
        let a = TransformChain::identity(Space::Native, Space::GroupTemplate).unwrap();
        let b = TransformChain::identity(Space::Native, Space::GroupTemplate).unwrap();
        let err = compose(&[a, b]).unwrap_err();
        assert!(matches!(err, ScanflowError::Composition(_)));
    }

    #[test]
    fn test_skipping_template_level_is_rejected() {
        let err = TransformChain::identity(Space::Native, Space::Commonspace).unwrap_err();
        assert!(matches!(err, ScanflowError::Composition(_)));
        assert!(compose(&[]).is_err());
    }

    #[test]
    fn test_identity_hop_keeps_template_level() {
        let native = TransformChain::identity(Space::Native, Space::GroupTemplate).unwrap();
        let template = TransformChain::from_registration(
            &registration("t2c", false),
            Space::GroupTemplate,
            Space::Commonspace,
        )
        .unwrap();
        let composed = compose(&[native, template]).unwrap();
        assert_eq!(composed.spaces().len(), 3);
        assert_eq!(composed.steps().len(), 1);
    }

    #[test]
    fn test_run_hop_composes_below_native() {
        let run = TransformChain::from_registration(
            &registration("bold2anat", false),
            Space::Functional,
            Space::Native,
        )
        .unwrap();
        let native = TransformChain::identity(Space::Native, Space::GroupTemplate).unwrap();
        let template = TransformChain::identity(Space::GroupTemplate, Space::Commonspace).unwrap();

        let composed = compose(&[run, native, template]).unwrap();
        assert_eq!(composed.source(), Space::Functional);
        assert_eq!(composed.target(), Space::Commonspace);
        assert_eq!(composed.spaces().len(), 4);
        assert_eq!(composed.steps().len(), 1);
        assert!(TransformChain::identity(Space::Functional, Space::GroupTemplate).is_err());
    }

    #[test]
    fn test_deserialized_chain_is_validated() {
        let chain = compose(&[
            TransformChain::from_registration(
                &registration("n2t", true),
                Space::Native,
                Space::GroupTemplate,
            )
            .unwrap(),
            TransformChain::identity(Space::GroupTemplate, Space::Commonspace).unwrap(),
        ])
        .unwrap();
        let json = serde_json::to_value(&chain).unwrap();
        let back: TransformChain = serde_json::from_value(json).unwrap();
        assert_eq!(back, chain);

        for invalid in [
            r#"{"spaces": [], "steps": []}"#,
            r#"{"spaces": ["native"], "steps": []}"#,
            r#"{"spaces": ["native", "commonspace"], "steps": []}"#,
        ] {
            let err = serde_json::from_str::<TransformChain>(invalid).unwrap_err();
            assert!(err.to_string().contains("chain") || err.to_string().contains("hop"), "{err}");
        }
    }

    #[test]
    fn test_inverted_warp_without_inverse_field() {
        let step = TransformStep {
            transform: Transform {
                kind: TransformKind::Warp,
                path: PathBuf::from("w.nii.gz"),
                inverse_path: None,
            },
            invert: true,
        };
        assert!(step.resolve().is_err());
    }
}
