//! Synthetic imaging collaborators for tests
//!
//! Volumes are 1-D `ndarray` vectors and every transform is an integer
//! circular shift, so composing transforms is exact and results can be
//! compared voxel for voxel. Images are kept in memory and also written to
//! disk as whitespace-separated text so outputs exist where the pipeline
//! expects them. Every image has an isotropic voxel spacing (1 mm unless
//! created otherwise).

use async_trait::async_trait;
use ndarray::Array1;
use scanflow_core::{
    AdapterError, ImageHandle, ImageIo, Interpolation, RegistrationAdapter, RegistrationOutput,
    RegistrationRequest, TransformStep,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

pub type Volume = Array1<f64>;

/// Circular shift: `out[i] = volume[i - shift]`
pub fn shift(volume: &Volume, shift: i64) -> Volume {
    let n = volume.len();
    if n == 0 {
        return volume.clone();
    }
    let s = shift.rem_euclid(n as i64) as usize;
    Array1::from_shape_fn(n, |i| volume[(i + n - s) % n])
}

/// Integer shift that best maps `moving` onto `fixed` (smallest magnitude wins ties)
pub fn best_shift(moving: &Volume, fixed: &Volume) -> i64 {
    let n = moving.len() as i64;
    let mut best = (f64::INFINITY, 0i64);
    for magnitude in 0..=n / 2 {
        for candidate in [magnitude, -magnitude] {
            let cost: f64 = (&shift(moving, candidate) - fixed).mapv(f64::abs).sum();
            if cost < best.0 - 1e-12 {
                best = (cost, candidate);
            }
        }
    }
    best.1
}

pub fn write_volume(path: &Path, volume: &Volume) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let text: Vec<String> = volume.iter().map(|v| v.to_string()).collect();
    std::fs::write(path, text.join(" "))
}

pub fn read_volume(path: &Path) -> std::io::Result<Volume> {
    let text = std::fs::read_to_string(path)?;
    let values = text
        .split_whitespace()
        .map(|v| {
            v.parse::<f64>()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
        .collect::<std::io::Result<Vec<f64>>>()?;
    Ok(Array1::from(values))
}

const DEFAULT_SPACING: f64 = 1.0;

#[derive(Default)]
struct Store {
    images: HashMap<PathBuf, Volume>,
    shifts: HashMap<PathBuf, i64>,
    spacings: HashMap<PathBuf, f64>,
}

/// Shared state behind the synthetic adapters
#[derive(Clone, Default)]
pub struct SyntheticImaging {
    store: Arc<Mutex<Store>>,
    failures: Arc<Mutex<HashSet<PathBuf>>>,
    linear: bool,
    delay: Option<Duration>,
    registrations: Arc<AtomicUsize>,
    masked: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SyntheticImaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registrations produce an affine only
    pub fn linear(mut self) -> Self {
        self.linear = true;
        self
    }

    /// Hold every registration for `delay` (exposes concurrency)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make registrations of `moving` fail
    pub fn fail_registration_of(&self, moving: impl Into<PathBuf>) {
        self.lock_failures().insert(moving.into());
    }

    pub fn clear_failures(&self) {
        self.lock_failures().clear();
    }

    pub fn registration(&self) -> Arc<dyn RegistrationAdapter> {
        Arc::new(SyntheticRegistration {
            imaging: self.clone(),
        })
    }

    pub fn image_io(&self) -> Arc<dyn ImageIo> {
        Arc::new(SyntheticImageIo {
            imaging: self.clone(),
        })
    }

    /// Register an image without touching disk
    pub fn insert(&self, path: impl Into<PathBuf>, values: Vec<f64>) -> ImageHandle {
        let path = path.into();
        self.lock().images.insert(path.clone(), Array1::from(values));
        ImageHandle::new(path)
    }

    /// Write an image to disk and register it
    pub fn create(&self, path: impl Into<PathBuf>, values: Vec<f64>) -> std::io::Result<ImageHandle> {
        let path = path.into();
        let volume = Array1::from(values);
        write_volume(&path, &volume)?;
        self.lock().images.insert(path.clone(), volume);
        Ok(ImageHandle::new(path))
    }

    /// Write an image with `spacing` mm voxels to disk and register it
    pub fn create_with_spacing(
        &self,
        path: impl Into<PathBuf>,
        values: Vec<f64>,
        spacing: f64,
    ) -> std::io::Result<ImageHandle> {
        let image = self.create(path, values)?;
        self.lock().spacings.insert(image.path().to_path_buf(), spacing);
        Ok(image)
    }

    /// Voxel spacing of an image in mm
    pub fn spacing_of(&self, path: &Path) -> f64 {
        self.lock()
            .spacings
            .get(path)
            .copied()
            .unwrap_or(DEFAULT_SPACING)
    }

    pub fn get(&self, image: &ImageHandle) -> Option<Volume> {
        self.lock().images.get(image.path()).cloned()
    }

    /// Shift stored for a transform file
    pub fn shift_of(&self, path: &Path) -> Option<i64> {
        self.lock().shifts.get(path).copied()
    }

    /// Total registrations attempted
    pub fn registration_calls(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Registrations that were given a mask
    pub fn masked_registration_calls(&self) -> usize {
        self.masked.load(Ordering::SeqCst)
    }

    /// Highest number of registrations observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.failures.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn volume(&self, image: &ImageHandle) -> Result<Volume, AdapterError> {
        if let Some(volume) = self.get(image) {
            return Ok(volume);
        }
        let volume = read_volume(image.path())?;
        self.lock()
            .images
            .insert(image.path().to_path_buf(), volume.clone());
        Ok(volume)
    }

    fn store_image(&self, path: &Path, volume: Volume) -> Result<ImageHandle, AdapterError> {
        write_volume(path, &volume)?;
        self.lock().images.insert(path.to_path_buf(), volume);
        Ok(ImageHandle::new(path))
    }

    fn store_spacing(&self, path: &Path, spacing: f64) {
        self.lock().spacings.insert(path.to_path_buf(), spacing);
    }

    fn store_shift(&self, path: PathBuf, value: i64) -> Result<PathBuf, AdapterError> {
        std::fs::write(&path, value.to_string())?;
        self.lock().shifts.insert(path.clone(), value);
        Ok(path)
    }

    fn step_shift(&self, step: &TransformStep) -> Result<i64, AdapterError> {
        let (path, invert) = step
            .resolve()
            .map_err(|e| AdapterError::InvalidInput(e.to_string()))?;
        let value = self
            .shift_of(path)
            .ok_or_else(|| AdapterError::MissingOutput(path.to_path_buf()))?;
        Ok(if invert { -value } else { value })
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SyntheticRegistration {
    imaging: SyntheticImaging,
}

#[async_trait]
impl RegistrationAdapter for SyntheticRegistration {
    fn name(&self) -> &str {
        "synthetic-registration"
    }

    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationOutput, AdapterError> {
        let imaging = &self.imaging;
        imaging.registrations.fetch_add(1, Ordering::SeqCst);
        if request.mask.is_some() {
            imaging.masked.fetch_add(1, Ordering::SeqCst);
        }
        let now = imaging.running.fetch_add(1, Ordering::SeqCst) + 1;
        imaging.peak.fetch_max(now, Ordering::SeqCst);
        let _running = RunningGuard(&imaging.running);

        if let Some(delay) = imaging.delay {
            tokio::time::sleep(delay).await;
        }

        if imaging.lock_failures().contains(request.moving.path()) {
            return Err(AdapterError::Registration {
                moving: request.moving.path().to_path_buf(),
                status: Some(1),
                stderr: "synthetic registration failure".to_string(),
            });
        }

        let moving = imaging.volume(&request.moving)?;
        let fixed = imaging.volume(&request.fixed)?;
        if moving.len() != fixed.len() {
            return Err(AdapterError::InvalidInput(format!(
                "length mismatch: {} vs {}",
                moving.len(),
                fixed.len()
            )));
        }
        let total = best_shift(&moving, &fixed);
        debug!("Synthetic registration {} -> {}: shift {}", request.moving, request.fixed, total);

        if let Some(parent) = request.output_prefix.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let prefixed = |suffix: &str| {
            let mut path = request.output_prefix.as_os_str().to_owned();
            path.push(suffix);
            PathBuf::from(path)
        };

        let (affine_shift, warp_shift) = if imaging.linear {
            (total, 0)
        } else {
            (total / 2, total - total / 2)
        };
        let affine = imaging.store_shift(prefixed("_affine.mat"), affine_shift)?;
        let (warp, inverse_warp) = if imaging.linear {
            (None, None)
        } else {
            (
                Some(imaging.store_shift(prefixed("_warp.txt"), warp_shift)?),
                Some(imaging.store_shift(prefixed("_inverse_warp.txt"), -warp_shift)?),
            )
        };
        let warped = imaging.store_image(&prefixed("_warped.txt"), shift(&moving, total))?;

        Ok(RegistrationOutput {
            affine,
            warp,
            inverse_warp,
            warped,
        })
    }
}

struct SyntheticImageIo {
    imaging: SyntheticImaging,
}

#[async_trait]
impl ImageIo for SyntheticImageIo {
    fn name(&self) -> &str {
        "synthetic-io"
    }

    async fn load(&self, path: &Path) -> Result<ImageHandle, AdapterError> {
        let handle = ImageHandle::new(path);
        self.imaging.volume(&handle)?;
        Ok(handle)
    }

    async fn save(&self, image: &ImageHandle, dest: &Path) -> Result<ImageHandle, AdapterError> {
        let volume = self.imaging.volume(image)?;
        self.imaging.store_image(dest, volume)
    }

    async fn resample(
        &self,
        image: &ImageHandle,
        steps: &[TransformStep],
        reference: &ImageHandle,
        _interpolation: Interpolation,
        output: &Path,
    ) -> Result<ImageHandle, AdapterError> {
        let mut volume = self.imaging.volume(image)?;
        let grid = self.imaging.volume(reference)?;
        if volume.len() != grid.len() {
            return Err(AdapterError::InvalidInput(format!(
                "image has {} voxels, reference {}",
                volume.len(),
                grid.len()
            )));
        }
        // Stack order: the last step touches the image first
        for step in steps.iter().rev() {
            volume = shift(&volume, self.imaging.step_shift(step)?);
        }
        let resampled = self.imaging.store_image(output, volume)?;
        self.imaging
            .store_spacing(output, self.imaging.spacing_of(reference.path()));
        Ok(resampled)
    }

    /// Nearest-voxel regridding along the single axis
    async fn resample_spacing(
        &self,
        image: &ImageHandle,
        spacing: [f64; 3],
        _interpolation: Interpolation,
        output: &Path,
    ) -> Result<ImageHandle, AdapterError> {
        let volume = self.imaging.volume(image)?;
        if volume.is_empty() {
            return Err(AdapterError::InvalidInput(format!("{image} is empty")));
        }
        let current = self.imaging.spacing_of(image.path());
        let target = spacing[0];
        let len = ((volume.len() as f64) * current / target).round().max(1.0) as usize;
        let last = volume.len() - 1;
        let regridded = Array1::from_shape_fn(len, |i| {
            let source = ((i as f64) * target / current).round() as usize;
            volume[source.min(last)]
        });
        let resampled = self.imaging.store_image(output, regridded)?;
        self.imaging.store_spacing(output, target);
        Ok(resampled)
    }

    async fn spacing(&self, image: &ImageHandle) -> Result<Option<[f64; 3]>, AdapterError> {
        self.imaging.volume(image)?;
        Ok(Some([self.imaging.spacing_of(image.path()); 3]))
    }

    async fn average(
        &self,
        images: &[ImageHandle],
        output: &Path,
    ) -> Result<ImageHandle, AdapterError> {
        let (first, rest) = images
            .split_first()
            .ok_or_else(|| AdapterError::InvalidInput("nothing to average".to_string()))?;
        let mut sum = self.imaging.volume(first)?;
        for image in rest {
            let volume = self.imaging.volume(image)?;
            if volume.len() != sum.len() {
                return Err(AdapterError::InvalidInput("geometry mismatch".to_string()));
            }
            sum = sum + volume;
        }
        let mean = sum / images.len() as f64;
        self.imaging.store_image(output, mean)
    }

    async fn mean_abs_difference(
        &self,
        a: &ImageHandle,
        b: &ImageHandle,
    ) -> Result<Option<f64>, AdapterError> {
        let a = self.imaging.volume(a)?;
        let b = self.imaging.volume(b)?;
        if a.len() != b.len() || a.is_empty() {
            return Ok(None);
        }
        Ok(Some((&a - &b).mapv(f64::abs).mean().unwrap_or(0.0)))
    }
}

/// A short 1-D "brain": a bump centred at `center`
pub fn bump(len: usize, center: usize) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let d = i as f64 - center as f64;
            (-(d * d) / 4.0).exp()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_is_circular() {
        let v = Array1::from(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(shift(&v, 1).to_vec(), vec![4.0, 1.0, 2.0, 3.0]);
        assert_eq!(shift(&v, -1).to_vec(), vec![2.0, 3.0, 4.0, 1.0]);
        assert_eq!(shift(&shift(&v, 3), -3), v);
    }

    #[test]
    fn test_best_shift_recovers_offset() {
        let moving = Array1::from(bump(16, 4));
        let fixed = Array1::from(bump(16, 7));
        assert_eq!(best_shift(&moving, &fixed), 3);
        assert_eq!(best_shift(&fixed, &moving), -3);
    }

    #[tokio::test]
    async fn test_regridding_halves_a_fine_volume() {
        let imaging = SyntheticImaging::new();
        let dir = tempfile::tempdir().unwrap();
        let fine = imaging
            .create_with_spacing(dir.path().join("fine.txt"), (0..8).map(f64::from).collect(), 0.5)
            .unwrap();
        let io = imaging.image_io();
        let coarse = io
            .resample_spacing(&fine, [1.0; 3], Interpolation::Linear, &dir.path().join("c.txt"))
            .await
            .unwrap();
        assert_eq!(imaging.get(&coarse).unwrap().to_vec(), vec![0.0, 2.0, 4.0, 6.0]);
        assert_eq!(io.spacing(&coarse).await.unwrap(), Some([1.0; 3]));
        assert_eq!(io.spacing(&fine).await.unwrap(), Some([0.5; 3]));
    }

    #[test]
    fn test_volume_text_round_trip() {
        let dir = std::env::temp_dir().join(format!("scanflow-tu-{}", std::process::id()));
        let path = dir.join("v.txt");
        let v = Array1::from(vec![0.5, 1.25, -2.0]);
        write_volume(&path, &v).unwrap();
        assert_eq!(read_volume(&path).unwrap(), v);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
