//! Process-backed adapters driving the ANTs command-line tools

use crate::adapter::{
    ImageHandle, ImageIo, Interpolation, RegistrationAdapter, RegistrationOutput,
    RegistrationRequest,
};
use crate::config::parse_spacing;
use crate::error::AdapterError;
use crate::transform::TransformStep;
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

const AFFINE_SUFFIX: &str = "_output_0GenericAffine.mat";
const WARPED_SUFFIX: &str = "_output_warped_image.nii.gz";
const WARP_SUFFIX: &str = "_output_1Warp.nii.gz";
const INVERSE_WARP_SUFFIX: &str = "_output_1InverseWarp.nii.gz";

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Runs a registration script as `bash <script> <moving> <fixed> <mask|NULL> <prefix>`
#[derive(Debug, Clone)]
pub struct ScriptRegistration {
    script: PathBuf,
    shell: String,
}

impl ScriptRegistration {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            shell: "bash".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Outputs the script is expected to leave behind for `prefix`
    pub async fn collect_outputs(
        prefix: &Path,
    ) -> Result<RegistrationOutput, AdapterError> {
        let affine = with_suffix(prefix, AFFINE_SUFFIX);
        let warped = with_suffix(prefix, WARPED_SUFFIX);
        for required in [&affine, &warped] {
            if !exists(required).await {
                return Err(AdapterError::MissingOutput(required.clone()));
            }
        }

        let warp = with_suffix(prefix, WARP_SUFFIX);
        let inverse = with_suffix(prefix, INVERSE_WARP_SUFFIX);
        let (warp, inverse_warp) = match (exists(&warp).await, exists(&inverse).await) {
            (true, true) => (Some(warp), Some(inverse)),
            (false, false) => (None, None),
            (true, false) => return Err(AdapterError::MissingOutput(inverse)),
            (false, true) => return Err(AdapterError::MissingOutput(warp)),
        };

        Ok(RegistrationOutput {
            affine,
            warp,
            inverse_warp,
            warped: ImageHandle::new(warped),
        })
    }
}

#[async_trait]
impl RegistrationAdapter for ScriptRegistration {
    fn name(&self) -> &str {
        "script-registration"
    }

    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationOutput, AdapterError> {
        let work_dir = request
            .output_prefix
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(work_dir).await?;

        let mask: &OsStr = match &request.mask {
            Some(mask) => mask.path().as_os_str(),
            None => OsStr::new("NULL"),
        };
        debug!(
            "Registering {} -> {} with {}",
            request.moving,
            request.fixed,
            self.script.display()
        );

        let output = Command::new(&self.shell)
            .arg(&self.script)
            .arg(request.moving.path())
            .arg(request.fixed.path())
            .arg(mask)
            .arg(&request.output_prefix)
            .current_dir(work_dir)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(AdapterError::Registration {
                moving: request.moving.path().to_path_buf(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Self::collect_outputs(&request.output_prefix).await
    }
}

/// Image I/O through `antsApplyTransforms`, `ResampleImage`, `PrintHeader`,
/// `AverageImages` and `ImageMath`
#[derive(Debug, Clone)]
pub struct CommandImageIo {
    bin_dir: Option<PathBuf>,
    dimension: u8,
}

impl Default for CommandImageIo {
    fn default() -> Self {
        Self {
            bin_dir: None,
            dimension: 3,
        }
    }
}

impl CommandImageIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding the ANTs binaries (otherwise resolved through PATH)
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    pub fn with_dimension(mut self, dimension: u8) -> Self {
        self.dimension = dimension;
        self
    }

    fn program(&self, tool: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    /// Arguments for `antsApplyTransforms`, transforms in stack order
    pub fn resample_args(
        &self,
        image: &ImageHandle,
        steps: &[TransformStep],
        reference: &ImageHandle,
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<Vec<OsString>, AdapterError> {
        let mut args: Vec<OsString> = vec![
            "-d".into(),
            self.dimension.to_string().into(),
            "-i".into(),
            image.path().into(),
            "-r".into(),
            reference.path().into(),
            "-o".into(),
            output.into(),
            "-n".into(),
            match interpolation {
                Interpolation::Linear => "Linear",
                Interpolation::Label => "GenericLabel",
            }
            .into(),
        ];

        if steps.is_empty() {
            args.push("-t".into());
            args.push("identity".into());
        }
        for step in steps {
            let (path, invert) = step
                .resolve()
                .map_err(|e| AdapterError::InvalidInput(e.to_string()))?;
            args.push("-t".into());
            if invert {
                let mut inverted = OsString::from("[");
                inverted.push(path.as_os_str());
                inverted.push(",1]");
                args.push(inverted);
            } else {
                args.push(path.into());
            }
        }
        Ok(args)
    }

    /// Arguments for `ResampleImage` onto a grid of `spacing` mm
    pub fn resample_spacing_args(
        &self,
        image: &ImageHandle,
        spacing: [f64; 3],
        interpolation: Interpolation,
        output: &Path,
    ) -> Vec<OsString> {
        let [x, y, z] = spacing;
        vec![
            self.dimension.to_string().into(),
            image.path().into(),
            output.into(),
            format!("{x}x{y}x{z}").into(),
            // size/spacing flag, then interpolation: 0 linear, 1 nearest neighbor
            "0".into(),
            match interpolation {
                Interpolation::Linear => "0",
                Interpolation::Label => "1",
            }
            .into(),
        ]
    }

    async fn run(&self, tool: &str, args: &[OsString], output: &Path) -> Result<ImageHandle, AdapterError> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!("Running {} -> {}", tool, output.display());
        let result: Output = Command::new(self.program(tool))
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            return Err(AdapterError::ToolFailed {
                tool: tool.to_string(),
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !exists(output).await {
            return Err(AdapterError::ToolFailed {
                tool: tool.to_string(),
                status: result.status.code(),
                stderr: format!("expected output {} was not written", output.display()),
            });
        }
        Ok(ImageHandle::new(output))
    }
}

#[async_trait]
impl ImageIo for CommandImageIo {
    fn name(&self) -> &str {
        "ants"
    }

    async fn load(&self, path: &Path) -> Result<ImageHandle, AdapterError> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(AdapterError::InvalidInput(format!(
                "{} is not a file",
                path.display()
            )));
        }
        Ok(ImageHandle::new(path))
    }

    async fn save(&self, image: &ImageHandle, dest: &Path) -> Result<ImageHandle, AdapterError> {
        if image.path() != dest {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(image.path(), dest).await?;
        }
        Ok(ImageHandle::new(dest))
    }

    async fn resample(
        &self,
        image: &ImageHandle,
        steps: &[TransformStep],
        reference: &ImageHandle,
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<ImageHandle, AdapterError> {
        let args = self.resample_args(image, steps, reference, interpolation, output)?;
        self.run("antsApplyTransforms", &args, output).await
    }

    async fn resample_spacing(
        &self,
        image: &ImageHandle,
        spacing: [f64; 3],
        interpolation: Interpolation,
        output: &Path,
    ) -> Result<ImageHandle, AdapterError> {
        let args = self.resample_spacing_args(image, spacing, interpolation, output);
        self.run("ResampleImage", &args, output).await
    }

    async fn spacing(&self, image: &ImageHandle) -> Result<Option<[f64; 3]>, AdapterError> {
        let tool = "PrintHeader";
        let result = Command::new(self.program(tool))
            .arg(image.path())
            .arg("1")
            .kill_on_drop(true)
            .output()
            .await?;
        if !result.status.success() {
            return Err(AdapterError::ToolFailed {
                tool: tool.to_string(),
                status: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        let text = String::from_utf8_lossy(&result.stdout);
        let spacing = parse_spacing(&text);
        if spacing.is_none() {
            debug!("Unreadable spacing '{}' for {}", text.trim(), image);
        }
        Ok(spacing)
    }

    async fn average(
        &self,
        images: &[ImageHandle],
        output: &Path,
    ) -> Result<ImageHandle, AdapterError> {
        if images.is_empty() {
            return Err(AdapterError::InvalidInput("nothing to average".to_string()));
        }
        let mut args: Vec<OsString> = vec![
            self.dimension.to_string().into(),
            output.into(),
            "0".into(),
        ];
        args.extend(images.iter().map(|i| i.path().as_os_str().to_owned()));
        self.run("AverageImages", &args, output).await
    }

    async fn sharpen(&self, image: &ImageHandle, output: &Path) -> Result<ImageHandle, AdapterError> {
        let args: Vec<OsString> = vec![
            self.dimension.to_string().into(),
            output.into(),
            "Sharpen".into(),
            image.path().into(),
        ];
        self.run("ImageMath", &args, output).await
    }
}
