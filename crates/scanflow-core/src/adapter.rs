//! Boundary traits for the external registration and image collaborators
//!
//! The core never looks inside an image: it only passes [`ImageHandle`]s and
//! transform files to these adapters and receives handles back.

use crate::error::AdapterError;
use crate::transform::TransformStep;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Opaque reference to an image owned by the image adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageHandle(PathBuf);

impl ImageHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Interpolation used when resampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Smooth interpolation for continuous intensities
    Linear,
    /// Label-preserving (nearest/generic label) interpolation for masks and atlases
    Label,
}

/// Inputs for one pairwise registration
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub moving: ImageHandle,
    pub fixed: ImageHandle,
    pub mask: Option<ImageHandle>,
    /// Path prefix for every file the registration writes
    pub output_prefix: PathBuf,
}

/// Files produced by a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationOutput {
    pub affine: PathBuf,
    pub warp: Option<PathBuf>,
    pub inverse_warp: Option<PathBuf>,
    /// Moving image resampled onto the fixed image
    pub warped: ImageHandle,
}

impl RegistrationOutput {
    /// Absence of warp outputs signals a linear-only registration
    #[must_use]
    pub fn is_linear(&self) -> bool {
        self.warp.is_none() && self.inverse_warp.is_none()
    }
}

/// Pairwise registration collaborator
#[async_trait]
pub trait RegistrationAdapter: Send + Sync {
    /// Adapter identifier (part of cache fingerprints)
    fn name(&self) -> &str;

    /// Register `moving` onto `fixed`.
    ///
    /// A non-zero tool exit or a missing required output is reported as
    /// [`AdapterError::Registration`] or [`AdapterError::MissingOutput`].
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationOutput, AdapterError>;
}

/// Image I/O, resampling and averaging collaborator
#[async_trait]
pub trait ImageIo: Send + Sync {
    /// Adapter identifier (part of cache fingerprints)
    fn name(&self) -> &str;

    /// Open an image from disk
    async fn load(&self, path: &Path) -> Result<ImageHandle, AdapterError>;

    /// Persist an image at `dest`
    async fn save(&self, image: &ImageHandle, dest: &Path) -> Result<ImageHandle, AdapterError>;

    /// Resample `image` onto `reference` through `steps` (stack order, the
    /// last step is applied to the image first)
    async fn resample(
        &self,
        image: &ImageHandle,
        steps: &[TransformStep],
        reference: &ImageHandle,
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<ImageHandle, AdapterError>;

    /// Resample `image` onto a regular grid with `spacing` (mm per voxel)
    async fn resample_spacing(
        &self,
        image: &ImageHandle,
        spacing: [f64; 3],
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<ImageHandle, AdapterError>;

    /// Voxel spacing in mm, when the adapter can read it
    async fn spacing(&self, _image: &ImageHandle) -> Result<Option<[f64; 3]>, AdapterError> {
        Ok(None)
    }

    /// Voxelwise mean of images sharing one geometry
    async fn average(
        &self,
        images: &[ImageHandle],
        output: &Path,
    ) -> Result<ImageHandle, AdapterError>;

    /// Optional sharpening between template rounds; the default passes the
    /// image through untouched
    async fn sharpen(
        &self,
        image: &ImageHandle,
        _output: &Path,
    ) -> Result<ImageHandle, AdapterError> {
        Ok(image.clone())
    }

    /// Mean absolute voxel difference, when the adapter can measure it
    async fn mean_abs_difference(
        &self,
        _a: &ImageHandle,
        _b: &ImageHandle,
    ) -> Result<Option<f64>, AdapterError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_registration_detection() {
        let output = RegistrationOutput {
            affine: PathBuf::from("a.mat"),
            warp: None,
            inverse_warp: None,
            warped: ImageHandle::new("warped.nii.gz"),
        };
        assert!(output.is_linear());

        let output = RegistrationOutput {
            warp: Some(PathBuf::from("w.nii.gz")),
            inverse_warp: Some(PathBuf::from("iw.nii.gz")),
            ..output
        };
        assert!(!output.is_linear());
    }

    #[test]
    fn test_image_handle_serialization() {
        let handle = ImageHandle::new("/tmp/x.nii.gz");
        let json = serde_json::to_string(&handle).unwrap();
        assert_eq!(json, "\"/tmp/x.nii.gz\"");
        let back: ImageHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }
}
