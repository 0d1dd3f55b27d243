//! Audio track detection and extraction
//!
//! The source's audio is pulled out once, before any batch runs, with a
//! stream copy into a Matroska audio container so any codec survives. It is
//! only muxed back in at the final merge.

use crate::command::{run_tool, tool_command, ToolError};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// File name of the extracted audio track inside the job temp root
pub const AUDIO_FILE_NAME: &str = "audio.mka";

/// Error type for audio operations
#[derive(Debug, Error)]
pub enum AudioError {
    /// Probing for an audio stream failed
    #[error("audio probe failed: {0}")]
    Probe(#[source] ToolError),

    /// Copying the audio stream out failed
    #[error("audio extraction failed: {0}")]
    Extract(#[source] ToolError),
}

/// Build the ffprobe command listing audio streams
pub fn build_audio_probe_command(ffprobe: &Path, input: &Path) -> Command {
    let mut cmd = tool_command(ffprobe);
    cmd.arg("-i")
        .arg(input)
        .args(["-show_streams", "-select_streams", "a", "-loglevel", "error"]);
    cmd
}

/// Build the ffmpeg command copying the audio stream without re-encoding
pub fn build_audio_extract_command(ffmpeg: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = tool_command(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y"])
        .arg("-i")
        .arg(input)
        .args(["-vn", "-acodec", "copy"])
        .arg(output);
    cmd
}

/// Non-empty probe output means at least one audio stream
pub fn has_audio_stream(probe_stdout: &[u8]) -> bool {
    probe_stdout.iter().any(|b| !b.is_ascii_whitespace())
}

/// Detect whether the source carries audio
///
/// A probe failure is an error, never "no audio".
pub async fn detect_audio(
    ffprobe: &Path,
    input: &Path,
    cancel: &CancellationToken,
) -> Result<bool, AudioError> {
    let output = run_tool(build_audio_probe_command(ffprobe, input), cancel)
        .await
        .map_err(AudioError::Probe)?;
    Ok(has_audio_stream(&output.stdout))
}

/// Detect and, if present, extract the audio track into `output`
///
/// Returns whether audio was found.
pub async fn extract_audio(
    ffprobe: &Path,
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<bool, AudioError> {
    if !detect_audio(ffprobe, input, cancel).await? {
        info!("No audio stream found, output will be silent");
        return Ok(false);
    }

    run_tool(build_audio_extract_command(ffmpeg, input, output), cancel)
        .await
        .map_err(AudioError::Extract)?;
    info!("Extracted audio to {}", output.display());
    Ok(true)
}
