//! Upscale job definitions
//!
//! An [`UpscaleJob`] describes one source file's trip through the pipeline.
//! It is owned by the orchestrator for the duration of a run and ends as a
//! [`JobOutcome`].

use crate::progress::JobProgress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Error type for job submission
#[derive(Debug, Error)]
pub enum JobError {
    /// The input file does not exist or cannot be read
    #[error("file not found: {0}")]
    InputNotFound(PathBuf),

    /// The model is not one the upscaler ships with
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// The model does not support the requested scale
    #[error("model '{model}' does not support scale x{scale} (supported: {supported:?})")]
    UnsupportedScale {
        model: String,
        scale: u32,
        supported: &'static [u32],
    },
}

/// An upscaling model and the output scales it supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpscaleModel {
    pub name: &'static str,
    pub scales: &'static [u32],
}

/// Models bundled with realesrgan-ncnn-vulkan
pub const UPSCALE_MODELS: &[UpscaleModel] = &[
    UpscaleModel { name: "realesrgan-x4plus", scales: &[4] },
    UpscaleModel { name: "realesrnet-x4plus", scales: &[4] },
    UpscaleModel { name: "realesrgan-x4plus-anime", scales: &[4] },
    UpscaleModel { name: "realesr-animevideov3", scales: &[2, 3, 4] },
];

/// Default model for new jobs
pub const DEFAULT_MODEL: &str = "realesrgan-x4plus";

/// Look up a model by name
pub fn find_model(name: &str) -> Option<&'static UpscaleModel> {
    UPSCALE_MODELS.iter().find(|m| m.name == name)
}

/// Check a model/scale pair against the catalog
pub fn validate_model_scale(model: &str, scale: u32) -> Result<(), JobError> {
    let entry = find_model(model).ok_or_else(|| JobError::UnknownModel(model.to_string()))?;
    if !entry.scales.contains(&scale) {
        return Err(JobError::UnsupportedScale {
            model: model.to_string(),
            scale,
            supported: entry.scales,
        });
    }
    Ok(())
}

/// Identity of the submitted source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Extension including the dot, e.g. `.mp4` (empty if none)
    pub extension: String,
    /// File name without extension
    pub plain_name: String,
}

impl InputFile {
    /// Describe an existing file on disk
    pub fn from_path(path: &Path) -> Result<Self, JobError> {
        let metadata =
            fs::metadata(path).map_err(|_| JobError::InputNotFound(path.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(JobError::InputNotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let plain_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes: metadata.len(),
            extension,
            plain_name,
        })
    }
}

/// What a caller asks for when submitting a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleRequest {
    pub model: String,
    /// Final upscale factor passed to the upscaler
    pub scale: u32,
    /// Upscaler tile size (0 = auto)
    pub tile_size: u32,
    /// Output frame rate (0 = inherit from source)
    pub target_fps: u32,
}

impl Default for UpscaleRequest {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            scale: 4,
            tile_size: 0,
            target_fps: 0,
        }
    }
}

/// One source file's upscale job
#[derive(Debug, Clone)]
pub struct UpscaleJob {
    /// Unique job identifier (UUID)
    pub id: String,
    pub input: InputFile,
    pub model: String,
    pub scale: u32,
    pub tile_size: u32,
    /// Output frame rate; filled from the source when submitted as 0
    pub target_fps: u32,
    /// Where the finished video is written
    pub output_path: PathBuf,
    /// Set by audio handling before any batch runs
    pub has_audio: bool,
    /// Shared progress state, reset at the start of every run
    pub progress: JobProgress,
}

impl UpscaleJob {
    /// Validate a request and build a job for `input`
    pub fn new(input: &Path, output_path: PathBuf, request: &UpscaleRequest) -> Result<Self, JobError> {
        validate_model_scale(&request.model, request.scale)?;
        let input = InputFile::from_path(input)?;
        let id = Uuid::new_v4().to_string();

        Ok(Self {
            progress: JobProgress::detached(&id),
            id,
            input,
            model: request.model.clone(),
            scale: request.scale,
            tile_size: request.tile_size,
            target_fps: request.target_fps,
            output_path,
            has_audio: false,
        })
    }

    /// Scratch root for this job under `temp_root`
    pub fn temp_dir(&self, temp_root: &Path) -> PathBuf {
        temp_root.join(format!("{}{}", JOB_DIR_PREFIX, self.id))
    }
}

/// Prefix of per-job scratch directories
pub const JOB_DIR_PREFIX: &str = "job_";

/// Default output location: `<output_dir>/<stem>_upscaled.mp4`
pub fn output_path_for(input: &Path, output_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    output_dir.join(format!("{}_upscaled.mp4", stem))
}

/// Terminal status of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success(PathBuf),
    Failed(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Success(path) => write!(f, "Success: {}", path.display()),
            JobOutcome::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}
