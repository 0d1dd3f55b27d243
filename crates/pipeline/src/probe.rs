//! Video metadata probing
//!
//! Runs ffprobe against the first video stream and extracts frame count,
//! integer frame rate and frame dimensions.

use crate::command::{run_tool, tool_command, ToolError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be run or exited unsuccessfully.
    #[error("ffprobe failed: {0}")]
    Tool(#[from] ToolError),

    /// ffprobe output could not be interpreted.
    #[error("Failed to parse ffprobe output: {0}")]
    Parse(String),

    /// The frame rate had a zero denominator.
    #[error("Invalid frame rate '{0}': denominator is zero")]
    ZeroDenominator(String),
}

/// Metadata of a source video, derived once per job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoMetadata {
    /// Total number of frames in the first video stream.
    pub total_frames: u64,
    /// Integer frames per second (`num / den`, truncated).
    pub fps: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub nb_frames: Option<String>,
        pub nb_read_packets: Option<String>,
        pub r_frame_rate: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }
}

/// Build the ffprobe command reading the first video stream's metadata
pub fn build_metadata_command(ffprobe: &Path, input: &Path) -> Command {
    let mut cmd = tool_command(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=nb_frames,r_frame_rate,width,height",
        "-of",
        "json",
    ])
    .arg(input);
    cmd
}

/// Build the ffprobe command that counts packets when the container has no frame count
pub fn build_packet_count_command(ffprobe: &Path, input: &Path) -> Command {
    let mut cmd = tool_command(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-count_packets",
        "-show_entries",
        "stream=nb_read_packets",
        "-of",
        "json",
    ])
    .arg(input);
    cmd
}

/// Convert a rational frame rate such as `"30000/1001"` to integer FPS
///
/// Integer division, no rounding. A zero denominator is an error.
pub fn parse_frame_rate(rate: &str) -> Result<u32, ProbeError> {
    let (num, den) = rate
        .trim()
        .split_once('/')
        .ok_or_else(|| ProbeError::Parse(format!("frame rate '{}' is not N/D", rate)))?;

    let num: u64 = num
        .trim()
        .parse()
        .map_err(|_| ProbeError::Parse(format!("invalid frame rate numerator in '{}'", rate)))?;
    let den: u64 = den
        .trim()
        .parse()
        .map_err(|_| ProbeError::Parse(format!("invalid frame rate denominator in '{}'", rate)))?;

    if den == 0 {
        return Err(ProbeError::ZeroDenominator(rate.to_string()));
    }

    u32::try_from(num / den)
        .map_err(|_| ProbeError::Parse(format!("frame rate '{}' out of range", rate)))
}

fn first_stream(json_str: &str) -> Result<ffprobe_json::Stream, ProbeError> {
    let output: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    output
        .streams
        .unwrap_or_default()
        .into_iter()
        .next()
        .ok_or_else(|| ProbeError::Parse("no video stream found".to_string()))
}

fn parse_count(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

/// Parse ffprobe metadata JSON
///
/// Returns the metadata and whether the frame count was present. A missing
/// or `N/A` count yields `total_frames == 0` and `false`.
pub fn parse_metadata_output(json_str: &str) -> Result<(VideoMetadata, bool), ProbeError> {
    let stream = first_stream(json_str)?;

    let rate = stream
        .r_frame_rate
        .as_deref()
        .ok_or_else(|| ProbeError::Parse("missing r_frame_rate".to_string()))?;
    let fps = parse_frame_rate(rate)?;

    let width = stream
        .width
        .ok_or_else(|| ProbeError::Parse("missing width".to_string()))?;
    let height = stream
        .height
        .ok_or_else(|| ProbeError::Parse("missing height".to_string()))?;

    let frames = parse_count(stream.nb_frames.as_deref());

    Ok((
        VideoMetadata {
            total_frames: frames.unwrap_or(0),
            fps,
            width,
            height,
        },
        frames.is_some(),
    ))
}

/// Parse the packet-count fallback output
pub fn parse_packet_count_output(json_str: &str) -> Result<u64, ProbeError> {
    let stream = first_stream(json_str)?;
    parse_count(stream.nb_read_packets.as_deref())
        .ok_or_else(|| ProbeError::Parse("missing nb_read_packets".to_string()))
}

/// Probe a video file for frame count, FPS and dimensions
pub async fn probe_metadata(
    ffprobe: &Path,
    input: &Path,
    cancel: &CancellationToken,
) -> Result<VideoMetadata, ProbeError> {
    let output = run_tool(build_metadata_command(ffprobe, input), cancel).await?;
    let (mut metadata, has_count) = parse_metadata_output(&String::from_utf8_lossy(&output.stdout))?;

    if !has_count {
        debug!(input = %input.display(), "container has no frame count, counting packets");
        let output = run_tool(build_packet_count_command(ffprobe, input), cancel).await?;
        metadata.total_frames = parse_packet_count_output(&String::from_utf8_lossy(&output.stdout))?;
    }

    if metadata.fps == 0 {
        return Err(ProbeError::Parse(
            "frame rate truncates to 0 frames per second".to_string(),
        ));
    }

    info!(
        "Video has {} frames at {} FPS ({}x{})",
        metadata.total_frames, metadata.fps, metadata.width, metadata.height
    );
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // For any N/D with D != 0 the FPS is the truncating quotient.
        #[test]
        fn prop_frame_rate_integer_division(num in 0u32..1_000_000, den in 1u32..10_000) {
            let fps = parse_frame_rate(&format!("{}/{}", num, den)).unwrap();
            prop_assert_eq!(fps, num / den);
        }

        #[test]
        fn prop_zero_denominator_is_error(num in 0u32..1_000_000) {
            let result = parse_frame_rate(&format!("{}/0", num));
            prop_assert!(matches!(result, Err(ProbeError::ZeroDenominator(_))));
        }
    }

    #[test]
    fn test_common_frame_rates() {
        assert_eq!(parse_frame_rate("30/1").unwrap(), 30);
        assert_eq!(parse_frame_rate("30000/1001").unwrap(), 29);
        assert_eq!(parse_frame_rate("24000/1001").unwrap(), 23);
        assert!(matches!(parse_frame_rate("0/0"), Err(ProbeError::ZeroDenominator(_))));
    }

    #[test]
    fn test_malformed_frame_rates() {
        assert!(matches!(parse_frame_rate("30"), Err(ProbeError::Parse(_))));
        assert!(matches!(parse_frame_rate("a/1"), Err(ProbeError::Parse(_))));
        assert!(matches!(parse_frame_rate("30/x"), Err(ProbeError::Parse(_))));
        assert!(matches!(parse_frame_rate("-30/1"), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn test_parse_metadata_output() {
        let json = r#"{
            "programs": [],
            "streams": [
                { "width": 1920, "height": 1080, "r_frame_rate": "30/1", "nb_frames": "300" }
            ]
        }"#;

        let (metadata, has_count) = parse_metadata_output(json).unwrap();
        assert!(has_count);
        assert_eq!(
            metadata,
            VideoMetadata { total_frames: 300, fps: 30, width: 1920, height: 1080 }
        );
    }

    #[test]
    fn test_parse_metadata_without_frame_count() {
        let json = r#"{"streams": [{ "width": 640, "height": 480, "r_frame_rate": "25/1" }]}"#;
        let (metadata, has_count) = parse_metadata_output(json).unwrap();
        assert!(!has_count);
        assert_eq!(metadata.total_frames, 0);

        let json = r#"{"streams": [{ "width": 640, "height": 480, "r_frame_rate": "25/1", "nb_frames": "N/A" }]}"#;
        let (_, has_count) = parse_metadata_output(json).unwrap();
        assert!(!has_count);
    }

    #[test]
    fn test_parse_metadata_rejects_bad_output() {
        assert!(matches!(parse_metadata_output("not json"), Err(ProbeError::Parse(_))));
        assert!(matches!(parse_metadata_output(r#"{"streams": []}"#), Err(ProbeError::Parse(_))));
        assert!(matches!(parse_metadata_output("{}"), Err(ProbeError::Parse(_))));

        let zero_den = r#"{"streams": [{ "width": 640, "height": 480, "r_frame_rate": "0/0", "nb_frames": "10" }]}"#;
        assert!(matches!(
            parse_metadata_output(zero_den),
            Err(ProbeError::ZeroDenominator(_))
        ));

        let no_width = r#"{"streams": [{ "height": 480, "r_frame_rate": "25/1", "nb_frames": "10" }]}"#;
        assert!(matches!(parse_metadata_output(no_width), Err(ProbeError::Parse(_))));
    }

    #[test]
    fn test_parse_packet_count_output() {
        let json = r#"{"streams": [{ "nb_read_packets": "1234" }]}"#;
        assert_eq!(parse_packet_count_output(json).unwrap(), 1234);
        assert!(parse_packet_count_output(r#"{"streams": [{}]}"#).is_err());
    }

    #[test]
    fn test_metadata_command_args() {
        let cmd = build_metadata_command(Path::new("/opt/ffprobe"), Path::new("/videos/in.mp4"));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("/opt/ffprobe"));
        assert_eq!(
            args,
            vec![
                "-v", "error", "-select_streams", "v:0", "-show_entries",
                "stream=nb_frames,r_frame_rate,width,height", "-of", "json", "/videos/in.mp4",
            ]
        );

        let cmd = build_packet_count_command(Path::new("ffprobe"), Path::new("in.mkv"));
        let args = get_command_args(&cmd);
        assert!(args.contains(&"-count_packets".to_string()));
        assert!(args.contains(&"stream=nb_read_packets".to_string()));
    }
}
