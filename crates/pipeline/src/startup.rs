//! Startup checks
//!
//! Preflight checks run before any job is accepted:
//! - FFmpeg present and new enough for `-fps_mode` (5.0+)
//! - FFprobe present
//! - Upscaler binary can be started
//!
//! Also sweeps job scratch directories left behind by an abnormal exit.

use crate::command::tool_command;
use crate::config::Config;
use crate::job::JOB_DIR_PREFIX;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest FFmpeg major version supporting `-fps_mode`
pub const MIN_FFMPEG_MAJOR: u32 = 5;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("FFprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("Upscaler not available: {0}")]
    UpscalerUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
/// - Distro suffixes: "ffmpeg version 4.4.2-0ubuntu0.22.04.1 ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let lower = version_line.to_lowercase();
    let version_part = lower.split("ffmpeg version").nth(1)?.split_whitespace().next()?;

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that FFmpeg runs and is at least [`MIN_FFMPEG_MAJOR`]
pub fn check_ffmpeg_version(ffmpeg: &Path) -> Result<u32, StartupError> {
    let output = tool_command(ffmpeg).arg("-version").output().map_err(|e| {
        StartupError::FfmpegVersion(format!(
            "failed to run {} -version; is FFmpeg installed and in PATH? Error: {}",
            ffmpeg.display(),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegVersion(format!(
            "{} -version failed",
            ffmpeg.display()
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }

    Ok(major)
}

/// Check that FFprobe runs
pub fn check_ffprobe_available(ffprobe: &Path) -> Result<(), StartupError> {
    let status = tool_command(ffprobe)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfprobeUnavailable(format!("{}: {}", ffprobe.display(), e))
        })?
        .status;

    if !status.success() {
        return Err(StartupError::FfprobeUnavailable(format!(
            "{} -version failed",
            ffprobe.display()
        )));
    }
    Ok(())
}

/// Check that the upscaler binary can be started
///
/// realesrgan-ncnn-vulkan exits non-zero after printing its usage, so only
/// a failure to start counts.
pub fn check_upscaler_available(upscaler: &Path) -> Result<(), StartupError> {
    tool_command(upscaler)
        .arg("-h")
        .output()
        .map(|_| ())
        .map_err(|e| StartupError::UpscalerUnavailable(format!("{}: {}", upscaler.display(), e)))
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg version
/// 2. FFprobe availability
/// 3. Upscaler availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let major = check_ffmpeg_version(&cfg.tools.ffmpeg)?;
    check_ffprobe_available(&cfg.tools.ffprobe)?;
    check_upscaler_available(&cfg.tools.realesrgan)?;
    info!("Startup checks passed (FFmpeg {})", major);
    Ok(())
}

/// Remove job scratch directories left under `temp_root` by a previous run
///
/// Only `job_*` directories are touched. A missing `temp_root` is not an
/// error. Returns how many directories were removed.
pub fn sweep_stale_job_dirs(temp_root: &Path) -> Result<usize, StartupError> {
    let entries = match fs::read_dir(temp_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let is_job_dir = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(JOB_DIR_PREFIX))
            .unwrap_or(false);
        if !is_job_dir || !entry.file_type()?.is_dir() {
            continue;
        }

        match fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove stale {}: {}", entry.path().display(), e),
        }
    }

    if removed > 0 {
        info!("Removed {} stale job directories from {}", removed, temp_root.display());
    }
    Ok(removed)
}
