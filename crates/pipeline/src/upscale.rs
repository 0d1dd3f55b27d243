//! Frame upscaling
//!
//! Runs the upscaler once per frame on a fixed pool of workers. Each worker
//! pulls the next frame index from a shared counter and invokes the tool
//! while holding a semaphore permit. Per-frame results are collected from a
//! `JoinSet` and classified once every worker has finished, so one failed
//! frame never aborts its siblings.

use crate::command::{run_tool, tool_command, ToolError};
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::frames::upscaled_frame_path;
use crate::job::UpscaleJob;
use crate::progress::{progress_step, BatchWindow, JobProgress, FRAMES_LABEL};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code the upscaler sometimes reports after writing a valid frame
pub const SPURIOUS_EXIT_CODE: i32 = 1;

/// Failure of a single frame
#[derive(Debug, Error)]
pub enum FrameUpscaleError {
    /// The upscaler failed on this frame
    #[error("failed to upscale frame {}: {source}", frame.display())]
    Tool {
        frame: PathBuf,
        #[source]
        source: ToolError,
        /// Whether a non-empty output file exists despite the failure
        output_present: bool,
    },

    /// A worker task panicked or was aborted
    #[error("upscale worker failed: {0}")]
    Worker(String),
}

impl FrameUpscaleError {
    /// Whether this failure is noise rather than a lost frame
    ///
    /// Only two cases qualify: the job was cancelled, or the upscaler
    /// returned exit code 1 after writing a non-empty output frame.
    pub fn is_ignorable(&self) -> bool {
        match self {
            FrameUpscaleError::Tool { source: ToolError::Cancelled, .. } => true,
            FrameUpscaleError::Tool {
                source,
                output_present,
                ..
            } => *output_present && source.exit_code() == Some(SPURIOUS_EXIT_CODE),
            FrameUpscaleError::Worker(_) => false,
        }
    }
}

/// Error type for a batch of frame upscales
#[derive(Debug, Error)]
pub enum UpscaleError {
    /// One or more frames failed with non-ignorable errors
    #[error("{failed} of {total} frames failed to upscale:\n{}", .messages.join("\n"))]
    Frames {
        failed: usize,
        total: usize,
        messages: Vec<String>,
    },
}

/// How the upscaler binary is invoked
#[derive(Debug, Clone, PartialEq)]
pub struct UpscalerSettings {
    pub program: PathBuf,
    /// GPU device (`auto` leaves the choice to the tool)
    pub gpu_id: String,
    /// load:proc:save thread counts
    pub threads: String,
    /// Concurrent upscaler processes
    pub workers: usize,
}

impl UpscalerSettings {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            program: cfg.tools.realesrgan.clone(),
            gpu_id: cfg.upscaler.gpu_id.clone(),
            threads: cfg.upscaler.threads.clone(),
            workers: plan.upscale_workers.max(1) as usize,
        }
    }
}

/// Build the upscaler command for one frame
pub fn build_upscale_command(
    settings: &UpscalerSettings,
    input: &Path,
    output: &Path,
    model: &str,
    scale: u32,
    tile_size: u32,
) -> Command {
    let mut cmd = tool_command(&settings.program);
    cmd.arg("-i")
        .arg(input)
        .arg("-o")
        .arg(output)
        .arg("-s")
        .arg(scale.to_string())
        .arg("-t")
        .arg(tile_size.to_string())
        .arg("-n")
        .arg(model);

    if !settings.gpu_id.eq_ignore_ascii_case("auto") {
        cmd.arg("-g").arg(&settings.gpu_id);
    }

    cmd.arg("-j").arg(&settings.threads);
    cmd
}

fn output_present(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Per-frame invocation details shared by all workers of a batch
struct BatchRun {
    frames: Vec<PathBuf>,
    frame_dir: PathBuf,
    model: String,
    scale: u32,
    tile_size: u32,
    settings: UpscalerSettings,
    next: AtomicUsize,
    completed: AtomicUsize,
    step: usize,
    window: BatchWindow,
    progress: JobProgress,
}

impl BatchRun {
    fn record_completion(&self) {
        let total = self.frames.len();
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if completed % self.step == 0 || completed == total {
            let bp = self.window.progress_at(completed, total);
            self.progress.advance_to(bp, FRAMES_LABEL);
        }
    }

    async fn upscale_one(
        &self,
        frame: &Path,
        semaphore: &Semaphore,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FrameUpscaleError> {
        let output = upscaled_frame_path(frame, &self.frame_dir);
        let cmd = build_upscale_command(
            &self.settings,
            frame,
            &output,
            &self.model,
            self.scale,
            self.tile_size,
        );

        let result = match semaphore.acquire().await {
            Ok(_permit) => run_tool(cmd, cancel).await,
            Err(_) => Err(ToolError::Cancelled),
        };

        match result {
            Ok(_) => Ok(output),
            Err(source) => Err(FrameUpscaleError::Tool {
                frame: frame.to_path_buf(),
                output_present: output_present(&output),
                source,
            }),
        }
    }

    async fn work(
        self: Arc<Self>,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> Vec<Result<PathBuf, FrameUpscaleError>> {
        let mut results = Vec::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            let Some(frame) = self.frames.get(index) else {
                break;
            };

            let result = self.upscale_one(frame, &semaphore, &cancel).await;
            if let Err(FrameUpscaleError::Tool { source: ToolError::Cancelled, .. }) = &result {
                results.push(result);
                break;
            }
            results.push(result);
            self.record_completion();
        }
        results
    }
}

/// Upscale every frame of a batch
///
/// Output files are named by prefixing the input file name, so sorting the
/// outputs recovers frame order regardless of completion order. Progress
/// moves through the job's current batch window and reaches its end exactly
/// when every frame has completed.
///
/// Returns the upscaled frame paths, sorted.
pub async fn upscale_frames(
    frames: &[PathBuf],
    frame_dir: &Path,
    job: &UpscaleJob,
    settings: &UpscalerSettings,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, UpscaleError> {
    let total = frames.len();
    let (current_batch, total_batches) = job.progress.batches();
    let workers = settings.workers.max(1).min(total.max(1));

    let run = Arc::new(BatchRun {
        frames: frames.to_vec(),
        frame_dir: frame_dir.to_path_buf(),
        model: job.model.clone(),
        scale: job.scale,
        tile_size: job.tile_size,
        settings: settings.clone(),
        next: AtomicUsize::new(0),
        completed: AtomicUsize::new(0),
        step: progress_step(total),
        window: BatchWindow::for_batch(current_batch, total_batches),
        progress: job.progress.clone(),
    });
    let semaphore = Arc::new(Semaphore::new(workers));

    debug!(frames = total, workers, "upscaling batch");

    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        tasks.spawn(run.clone().work(semaphore.clone(), cancel.clone()));
    }

    let mut outputs = Vec::with_capacity(total);
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(output) => outputs.push(output),
                        Err(e) => failures.push(e),
                    }
                }
            }
            Err(join_err) => failures.push(FrameUpscaleError::Worker(join_err.to_string())),
        }
    }

    let (ignored, fatal): (Vec<_>, Vec<_>) =
        failures.into_iter().partition(FrameUpscaleError::is_ignorable);
    for failure in &ignored {
        warn!("ignoring frame failure: {}", failure);
        if let FrameUpscaleError::Tool {
            output_present: true,
            frame,
            ..
        } = failure
        {
            outputs.push(upscaled_frame_path(frame, frame_dir));
        }
    }

    if !fatal.is_empty() {
        return Err(UpscaleError::Frames {
            failed: fatal.len(),
            total,
            messages: fatal.iter().map(|e| e.to_string()).collect(),
        });
    }

    outputs.sort();
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{UpscaleRequest, DEFAULT_MODEL};
    use crate::progress::BATCH_WINDOW_END_BP;
    use std::ffi::OsStr;
    use std::fs;
    use tempfile::TempDir;

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn settings(program: &Path, workers: usize) -> UpscalerSettings {
        UpscalerSettings {
            program: program.to_path_buf(),
            gpu_id: "auto".to_string(),
            threads: "2:2:2".to_string(),
            workers,
        }
    }

    fn tool_failure(code: Option<i32>) -> ToolError {
        ToolError::Failed {
            program: "realesrgan-ncnn-vulkan".to_string(),
            code,
            stderr: String::new(),
        }
    }

    #[test]
    fn test_upscale_command_args() {
        let mut s = settings(Path::new("/opt/realesrgan"), 4);
        let cmd = build_upscale_command(
            &s,
            Path::new("/b/frame_000001.png"),
            Path::new("/b/upscaled_frame_000001.png"),
            "realesr-animevideov3",
            3,
            256,
        );
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("/opt/realesrgan"));
        assert!(has_flag_with_value(&args, "-i", "/b/frame_000001.png"));
        assert!(has_flag_with_value(&args, "-o", "/b/upscaled_frame_000001.png"));
        assert!(has_flag_with_value(&args, "-s", "3"));
        assert!(has_flag_with_value(&args, "-t", "256"));
        assert!(has_flag_with_value(&args, "-n", "realesr-animevideov3"));
        assert!(has_flag_with_value(&args, "-j", "2:2:2"));
        assert!(!args.contains(&"-g".to_string()));

        s.gpu_id = "1".to_string();
        let cmd = build_upscale_command(&s, Path::new("a"), Path::new("b"), DEFAULT_MODEL, 4, 0);
        assert!(has_flag_with_value(&get_command_args(&cmd), "-g", "1"));
    }

    #[test]
    fn test_failure_classification() {
        let frame = PathBuf::from("frame_000001.png");
        let classify = |source: ToolError, output_present: bool| {
            FrameUpscaleError::Tool {
                frame: frame.clone(),
                source,
                output_present,
            }
            .is_ignorable()
        };

        assert!(classify(ToolError::Cancelled, false));
        assert!(classify(tool_failure(Some(1)), true));
        assert!(!classify(tool_failure(Some(1)), false));
        assert!(!classify(tool_failure(Some(2)), true));
        assert!(!classify(tool_failure(None), true));
        assert!(!FrameUpscaleError::Worker("panicked".to_string()).is_ignorable());
    }

    #[test]
    fn test_upscale_error_joins_messages() {
        let err = UpscaleError::Frames {
            failed: 2,
            total: 10,
            messages: vec!["first".to_string(), "second".to_string()],
        };
        assert_eq!(err.to_string(), "2 of 10 frames failed to upscale:\nfirst\nsecond");
    }

    #[cfg(unix)]
    mod with_fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const FAKE_UPSCALER: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -i) in="$2"; shift 2 ;;
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
case "$in" in
  *fail*) echo "vkQueueSubmit failed" >&2; exit 3 ;;
  *soft*) cp "$in" "$out"; exit 1 ;;
  *lost*) exit 1 ;;
esac
cp "$in" "$out"
"#;

        struct Fixture {
            dir: TempDir,
            tool: PathBuf,
            job: UpscaleJob,
        }

        fn fixture() -> Fixture {
            let dir = TempDir::new().unwrap();
            let tool = dir.path().join("fake-realesrgan");
            fs::write(&tool, FAKE_UPSCALER).unwrap();
            fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

            let input = dir.path().join("source.mp4");
            fs::write(&input, b"not really a video").unwrap();
            let job = UpscaleJob::new(&input, dir.path().join("out.mp4"), &UpscaleRequest::default())
                .unwrap();
            job.progress.begin_batch(1, 1);

            Fixture { dir, tool, job }
        }

        fn write_frames(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
            names
                .iter()
                .map(|name| {
                    let path = dir.join(name);
                    fs::write(&path, name.as_bytes()).unwrap();
                    path
                })
                .collect()
        }

        #[tokio::test]
        async fn test_all_frames_upscaled_in_order() {
            let fx = fixture();
            let names: Vec<String> = (1..=12).map(|i| format!("frame_{:06}.png", i)).collect();
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let frames = write_frames(fx.dir.path(), &names);

            let outputs = upscale_frames(
                &frames,
                fx.dir.path(),
                &fx.job,
                &settings(&fx.tool, 3),
                &CancellationToken::new(),
            )
            .await
            .expect("all frames should upscale");

            assert_eq!(outputs.len(), 12);
            for (frame, output) in frames.iter().zip(&outputs) {
                assert_eq!(output, &upscaled_frame_path(frame, fx.dir.path()));
                assert_eq!(fs::read(frame).unwrap(), fs::read(output).unwrap());
            }
            assert_eq!(fx.job.progress.basis_points(), BATCH_WINDOW_END_BP);
        }

        #[tokio::test]
        async fn test_failures_aggregated_without_stopping_siblings() {
            let fx = fixture();
            let frames = write_frames(
                fx.dir.path(),
                &[
                    "frame_000001.png",
                    "frame_000002_fail.png",
                    "frame_000003.png",
                    "frame_000004_lost.png",
                    "frame_000005.png",
                ],
            );

            let err = upscale_frames(
                &frames,
                fx.dir.path(),
                &fx.job,
                &settings(&fx.tool, 2),
                &CancellationToken::new(),
            )
            .await
            .expect_err("hard failures should fail the batch");

            let UpscaleError::Frames { failed, total, messages } = err;
            assert_eq!(failed, 2);
            assert_eq!(total, 5);
            assert!(messages.iter().any(|m| m.contains("frame_000002_fail.png")));
            assert!(messages.iter().any(|m| m.contains("frame_000004_lost.png")));

            for sibling in ["frame_000001.png", "frame_000003.png", "frame_000005.png"] {
                assert!(fx.dir.path().join(format!("upscaled_{}", sibling)).exists());
            }
        }

        #[tokio::test]
        async fn test_exit_one_with_output_is_ignored() {
            let fx = fixture();
            let frames = write_frames(
                fx.dir.path(),
                &["frame_000001.png", "frame_000002_soft.png"],
            );

            let outputs = upscale_frames(
                &frames,
                fx.dir.path(),
                &fx.job,
                &settings(&fx.tool, 2),
                &CancellationToken::new(),
            )
            .await
            .expect("spurious exit 1 should be ignored");

            assert_eq!(outputs.len(), 2);
        }

        #[tokio::test]
        async fn test_cancelled_batch_reports_no_fatal_errors() {
            let fx = fixture();
            let frames = write_frames(fx.dir.path(), &["frame_000001.png", "frame_000002.png"]);
            let cancel = CancellationToken::new();
            cancel.cancel();

            let outputs = upscale_frames(
                &frames,
                fx.dir.path(),
                &fx.job,
                &settings(&fx.tool, 2),
                &cancel,
            )
            .await
            .expect("cancellation is not a frame failure");

            assert!(outputs.is_empty());
            assert_eq!(fx.job.progress.basis_points(), 0);
        }
    }
}
