//! Frame extraction
//!
//! Pulls one batch's frame range out of the source into numbered PNG files,
//! optionally shrinking large frames first so the upscaler's per-frame
//! memory use stays bounded. This pre-upscale downscale is independent of
//! the job's final scale factor.

use crate::command::{run_tool, tool_command, ToolError};
use crate::probe::VideoMetadata;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frames with either side below this are never downscaled
pub const MIN_SCALE_DIMENSION: u32 = 360;

/// Largest downscale divisor applied during extraction
pub const MAX_EXTRACT_MULTIPLIER: u32 = 2;

/// ffmpeg output pattern for extracted frames
pub const FRAME_PATTERN: &str = "frame_%06d.png";

/// ffmpeg input pattern for upscaled frames
pub const UPSCALED_FRAME_PATTERN: &str = "upscaled_frame_%06d.png";

/// Prefix that marks an upscaled frame
pub const UPSCALED_PREFIX: &str = "upscaled_";

const FRAME_PREFIX: &str = "frame_";
const FRAME_EXTENSION: &str = "png";

/// Error type for frame extraction
#[derive(Debug, Error)]
pub enum FrameExtractionError {
    /// ffmpeg failed; carries its diagnostic output
    #[error("error extracting frames: {0}")]
    Tool(#[from] ToolError),

    /// Listing the scratch directory failed
    #[error("failed to list extracted frames: {0}")]
    Io(#[from] io::Error),

    /// ffmpeg succeeded but wrote nothing
    #[error("no frames extracted into {0}")]
    NoFrames(PathBuf),
}

/// Downscale divisor actually applied for a source of `width`x`height`
///
/// Small sources are never scaled. Otherwise the requested multiplier is
/// halved (integer division) until it is at most 2.
pub fn effective_multiplier(width: u32, height: u32, requested: u32) -> u32 {
    if width < MIN_SCALE_DIMENSION || height < MIN_SCALE_DIMENSION {
        return 1;
    }

    let mut multiplier = requested.max(1);
    while multiplier > MAX_EXTRACT_MULTIPLIER {
        multiplier /= 2;
    }
    multiplier
}

/// Conditional scale filter for a divisor, or None when no scaling applies
pub fn scale_filter(multiplier: u32) -> Option<String> {
    if multiplier <= 1 {
        return None;
    }
    Some(format!(
        "scale='if(gt(iw,{min}),iw/{m},iw)':'if(gt(ih,{min}),ih/{m},ih)':force_original_aspect_ratio=decrease",
        min = MIN_SCALE_DIMENSION,
        m = multiplier
    ))
}

/// Video filter selecting frames `[start, start + count)` and optionally scaling them
pub fn extraction_filter(start: u64, count: u64, multiplier: u32) -> String {
    let last = start + count.saturating_sub(1);
    let select = format!("select=between(n\\,{}\\,{})", start, last);
    match scale_filter(multiplier) {
        Some(scale) => format!("{},{}", select, scale),
        None => select,
    }
}

/// Build the ffmpeg command extracting one batch of frames into `frame_dir`
pub fn build_extract_command(
    ffmpeg: &Path,
    frame_dir: &Path,
    input: &Path,
    start: u64,
    count: u64,
    multiplier: u32,
) -> Command {
    let mut cmd = tool_command(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error"])
        .arg("-i")
        .arg(input)
        .arg("-vf")
        .arg(extraction_filter(start, count, multiplier))
        .args(["-fps_mode", "vfr"])
        .arg("-frames:v")
        .arg(count.to_string())
        .arg(frame_dir.join(FRAME_PATTERN));
    cmd
}

/// Name of the upscaled variant of a frame file
pub fn upscaled_frame_path(frame: &Path, out_dir: &Path) -> PathBuf {
    let name = frame
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    out_dir.join(format!("{}{}", UPSCALED_PREFIX, name))
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(FRAME_EXTENSION))
        .unwrap_or(false)
}

fn list_with_prefix(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(prefix))
            .unwrap_or(false);
        if matches && is_png(&path) {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Extracted (not yet upscaled) frames in `dir`, lexicographically sorted
pub fn list_frames(dir: &Path) -> io::Result<Vec<PathBuf>> {
    list_with_prefix(dir, FRAME_PREFIX)
}

/// Upscaled frames in `dir`, lexicographically sorted
pub fn list_upscaled_frames(dir: &Path) -> io::Result<Vec<PathBuf>> {
    list_with_prefix(dir, UPSCALED_PREFIX)
}

/// Extract source frames `[start, start + count)` into `frame_dir`
///
/// Returns the extracted frame paths in order.
#[allow(clippy::too_many_arguments)]
pub async fn extract_frames(
    ffmpeg: &Path,
    frame_dir: &Path,
    input: &Path,
    start: u64,
    count: u64,
    requested_multiplier: u32,
    metadata: &VideoMetadata,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, FrameExtractionError> {
    let multiplier = effective_multiplier(metadata.width, metadata.height, requested_multiplier);
    debug!(start, count, multiplier, "extracting frames");

    let cmd = build_extract_command(ffmpeg, frame_dir, input, start, count, multiplier);
    run_tool(cmd, cancel).await?;

    let frames = list_frames(frame_dir)?;
    if frames.is_empty() {
        return Err(FrameExtractionError::NoFrames(frame_dir.to_path_buf()));
    }
    if frames.len() as u64 != count {
        warn!(
            expected = count,
            extracted = frames.len(),
            "extracted frame count differs from container frame count"
        );
    }
    Ok(frames)
}
