//! Final merge
//!
//! Concatenates the batch segments with ffmpeg's concat demuxer and muxes
//! the extracted audio back in. Video is stream-copied; only audio is
//! encoded.

use crate::command::{run_tool, tool_command, ToolError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// File name of the concat manifest inside the job temp root
pub const MANIFEST_FILE_NAME: &str = "segments.txt";

/// Codec the audio track is encoded to in the final container
pub const MERGED_AUDIO_CODEC: &str = "aac";

/// Error type for the final merge
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no segments to merge")]
    NoSegments,

    #[error("failed to write segment manifest {}: {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error merging final video: {0}")]
    Tool(#[from] ToolError),
}

/// Quote a path for a concat manifest line
///
/// Backslashes become forward slashes and embedded single quotes are
/// closed, escaped and reopened.
pub fn manifest_entry(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    format!("file '{}'", normalized.replace('\'', r"'\''"))
}

/// Manifest text listing `segments` in the given order
pub fn manifest_contents(segments: &[PathBuf]) -> String {
    let mut text = String::new();
    for segment in segments {
        text.push_str(&manifest_entry(segment));
        text.push('\n');
    }
    text
}

/// Write the concat manifest for `segments` to `path`
pub fn write_manifest(path: &Path, segments: &[PathBuf]) -> Result<(), MergeError> {
    if segments.is_empty() {
        return Err(MergeError::NoSegments);
    }
    fs::write(path, manifest_contents(segments)).map_err(|source| MergeError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

/// Build the ffmpeg concat command
///
/// With `audio` the extracted track becomes a second input mapped next to
/// the copied video. The output is always overwritten.
pub fn build_merge_command(
    ffmpeg: &Path,
    manifest: &Path,
    audio: Option<&Path>,
    output: &Path,
) -> Command {
    let mut cmd = tool_command(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error"])
        .args(["-f", "concat", "-safe", "0"])
        .arg("-i")
        .arg(manifest);

    if let Some(audio) = audio {
        cmd.arg("-i").arg(audio);
    }

    cmd.args(["-map", "0:v"]);
    if audio.is_some() {
        cmd.args(["-map", "1:a"]);
    }

    cmd.args(["-c:v", "copy"]);
    if audio.is_some() {
        cmd.args(["-c:a", MERGED_AUDIO_CODEC]);
    }

    cmd.arg("-y").arg(output);
    cmd
}

/// Remove whatever ffmpeg left at `output` after a failed merge
fn remove_partial_output(output: &Path) {
    if let Err(e) = fs::remove_file(output) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial output {}: {}", output.display(), e);
        }
    }
}

/// Merge `segments`, in order, into `output`
///
/// `audio` is the extracted track when the job has one. The manifest is
/// written to `manifest`. If ffmpeg ran and failed, the partial output is
/// removed; a file already at `output` is untouched by earlier failures.
pub async fn merge_segments(
    ffmpeg: &Path,
    segments: &[PathBuf],
    manifest: &Path,
    audio: Option<&Path>,
    output: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, MergeError> {
    write_manifest(manifest, segments)?;
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled.into());
    }

    let cmd = build_merge_command(ffmpeg, manifest, audio, output);
    if let Err(e) = run_tool(cmd, cancel).await {
        if !matches!(e, ToolError::Spawn { .. }) {
            remove_partial_output(output);
        }
        return Err(e.into());
    }

    info!(
        segments = segments.len(),
        audio = audio.is_some(),
        "Merged final video {}",
        output.display()
    );
    Ok(output.to_path_buf())
}
