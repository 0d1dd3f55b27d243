//! Segment reassembly
//!
//! Encodes a batch's upscaled frames back into a video segment. Audio is
//! never touched here; it is only muxed back in by the final merge.

use crate::command::{run_tool, tool_command, ToolError};
use crate::frames::{list_upscaled_frames, UPSCALED_FRAME_PATTERN, UPSCALED_PREFIX};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// x264 constant rate factor used for visually lossless segments
pub const REASSEMBLY_CRF: u32 = 18;

/// Pixel format every mainstream player decodes
pub const REASSEMBLY_PIX_FMT: &str = "yuv420p";

/// yuv420p needs even dimensions; pad odd ones by a single pixel
const EVEN_PAD_FILTER: &str = "pad=ceil(iw/2)*2:ceil(ih/2)*2";

/// Error type for segment reassembly
#[derive(Debug, Error)]
pub enum ReassemblyError {
    /// The scratch directory holds no upscaled frames
    #[error("no upscaled frames found in {0}")]
    NoFramesFound(PathBuf),

    #[error("failed to list upscaled frames: {0}")]
    Io(#[from] io::Error),

    #[error("error creating video: {0}")]
    Tool(#[from] ToolError),
}

/// Sequence number of an upscaled frame file, e.g. 12 for `upscaled_frame_000012.png`
pub fn frame_number(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits = stem.strip_prefix(UPSCALED_PREFIX)?.rsplit('_').next()?;
    digits.parse().ok()
}

/// Build the ffmpeg command encoding the upscaled frames in `frame_dir`
///
/// # Arguments
/// * `ffmpeg` - ffmpeg binary
/// * `frame_dir` - Batch scratch directory holding `upscaled_frame_*.png`
/// * `start_number` - Sequence number of the first frame
/// * `fps` - Output frame rate
/// * `output` - Segment path to write
pub fn build_reassembly_command(
    ffmpeg: &Path,
    frame_dir: &Path,
    start_number: u32,
    fps: u32,
    output: &Path,
) -> Command {
    let mut cmd = tool_command(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y"])
        .arg("-framerate")
        .arg(fps.to_string())
        .arg("-start_number")
        .arg(start_number.to_string())
        .arg("-i")
        .arg(frame_dir.join(UPSCALED_FRAME_PATTERN))
        .arg("-vf")
        .arg(EVEN_PAD_FILTER)
        .arg("-c:v")
        .arg("libx264")
        .arg("-crf")
        .arg(REASSEMBLY_CRF.to_string())
        .arg("-pix_fmt")
        .arg(REASSEMBLY_PIX_FMT)
        .arg(output);
    cmd
}

/// Encode the upscaled frames in `frame_dir` into `output` at `fps`
///
/// Frames are consumed in lexicographic file-name order, which matches
/// source order because sequence numbers are zero-padded.
pub async fn reassemble_segment(
    ffmpeg: &Path,
    frame_dir: &Path,
    fps: u32,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, ReassemblyError> {
    let frames = list_upscaled_frames(frame_dir)?;
    let first = frames
        .first()
        .ok_or_else(|| ReassemblyError::NoFramesFound(frame_dir.to_path_buf()))?;
    let start_number = frame_number(first).unwrap_or(1);

    debug!(frames = frames.len(), start_number, fps, "reassembling segment");
    let cmd = build_reassembly_command(ffmpeg, frame_dir, start_number, fps, output);
    run_tool(cmd, cancel).await?;
    Ok(output.to_path_buf())
}
