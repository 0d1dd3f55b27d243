//! Pipeline orchestrator
//!
//! Drives one job through probe, audio, the batch loop (extract, upscale,
//! reassemble, cleanup) and the final merge. Any stage failure stops the
//! job; the job temp root is removed on every return path.

use crate::audio::{extract_audio, AudioError, AUDIO_FILE_NAME};
use crate::batch::plan_batches;
use crate::concurrency::ConcurrencyPlan;
use crate::config::{Config, ToolsConfig};
use crate::frames::{extract_frames, FrameExtractionError};
use crate::job::{JobOutcome, UpscaleJob};
use crate::merge::{merge_segments, MergeError, MANIFEST_FILE_NAME};
use crate::probe::{probe_metadata, ProbeError};
use crate::progress::{
    BatchWindow, JobProgress, ProgressSink, AUDIO_DONE_BP, BATCHES_DONE_BP, COMPLETE_BP,
    MERGE_DONE_BP, METADATA_DONE_BP, SETUP_DONE_BP,
};
use crate::reassemble::{reassemble_segment, ReassemblyError};
use crate::upscale::{upscale_frames, UpscaleError, UpscalerSettings};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Directory under the job temp root holding finished segments
const SEGMENTS_DIR: &str = "segments";

/// Prefix of per-batch scratch directories
pub const BATCH_DIR_PREFIX: &str = "batch_";

/// Where a job currently is in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Init,
    MetadataProbed,
    AudioHandled,
    Extracting { batch: u32 },
    Upscaling { batch: u32 },
    Reassembling { batch: u32 },
    BatchCleanup { batch: u32 },
    Merging,
    Cleanup,
    Done,
    Failed,
}

impl PipelineStage {
    /// Stage name for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Init => "init",
            PipelineStage::MetadataProbed => "metadata_probed",
            PipelineStage::AudioHandled => "audio_handled",
            PipelineStage::Extracting { .. } => "extracting",
            PipelineStage::Upscaling { .. } => "upscaling",
            PipelineStage::Reassembling { .. } => "reassembling",
            PipelineStage::BatchCleanup { .. } => "batch_cleanup",
            PipelineStage::Merging => "merging",
            PipelineStage::Cleanup => "cleanup",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

/// Error type for a pipeline run, carrying the failing stage's context
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to create directory {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("error getting video details: {0}")]
    Probe(#[from] ProbeError),

    #[error("video reports no frames")]
    EmptyVideo,

    #[error("error extracting audio: {0}")]
    Audio(#[from] AudioError),

    #[error("error extracting batch {batch}: {source}")]
    Extract {
        batch: u32,
        #[source]
        source: FrameExtractionError,
    },

    #[error("error upscaling batch {batch}: {source}")]
    Upscale {
        batch: u32,
        #[source]
        source: UpscaleError,
    },

    #[error("error reassembling batch {batch}: {source}")]
    Reassemble {
        batch: u32,
        #[source]
        source: ReassemblyError,
    },

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("job cancelled")]
    Cancelled,
}

/// Advisory time left, from the average time per processed frame
///
/// Returns None until at least one frame has been processed.
pub fn estimate_remaining(elapsed: Duration, processed: u64, total: u64) -> Option<Duration> {
    if processed == 0 {
        return None;
    }
    let remaining = total.saturating_sub(processed);
    let per_frame = elapsed.as_secs_f64() / processed as f64;
    Some(Duration::from_secs_f64(per_frame * remaining as f64))
}

/// ETA measured from when the job started, so setup and probe time count
fn job_eta(job_started: Instant, processed: u64, total: u64) -> Option<Duration> {
    estimate_remaining(job_started.elapsed(), processed, total)
}

fn create_dir(path: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(path).map_err(|source| PipelineError::Workspace {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_scratch(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Runs upscale jobs one at a time
pub struct Orchestrator {
    tools: ToolsConfig,
    batch_size: u64,
    temp_root: PathBuf,
    upscaler: UpscalerSettings,
    sink: Arc<dyn ProgressSink>,
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// # Arguments
    /// * `config` - Tool paths, batch size and temp root
    /// * `plan` - Upscaler worker count
    /// * `sink` - Receives every job's progress events
    pub fn new(config: &Config, plan: &ConcurrencyPlan, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            tools: config.tools.clone(),
            batch_size: u64::from(config.pipeline.batch_size.max(1)),
            temp_root: config.pipeline.resolved_temp_root(),
            upscaler: UpscalerSettings::from_config(config, plan),
            sink,
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Run `job` to completion and report the outcome
    pub async fn process(&self, job: &mut UpscaleJob, cancel: &CancellationToken) -> JobOutcome {
        match self.run(job, cancel).await {
            Ok(output) => JobOutcome::Success(output),
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    /// Run `job` through every stage
    ///
    /// Progress restarts from zero. On success the merged output path is
    /// returned; on failure no partial output is left at the save path.
    pub async fn run(
        &self,
        job: &mut UpscaleJob,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        job.progress = JobProgress::new(&job.id, self.sink.clone());
        let started = Instant::now();
        let job_dir = job.temp_dir(&self.temp_root);
        let mut stage = PipelineStage::Init;

        info!(job = %job.id, "Upscaling {}", job.input.path.display());
        let result = self
            .run_stages(job, &job_dir, started, &mut stage, cancel)
            .await;
        remove_scratch(&job_dir);

        match result {
            Ok(output) => {
                job.progress.advance_to(COMPLETE_BP, "complete");
                let elapsed = started.elapsed().as_secs_f64();
                info!(
                    job = %job.id,
                    stage = PipelineStage::Done.as_str(),
                    "Upscaling completed in {}m{:.2}s",
                    (elapsed / 60.0) as u64,
                    elapsed % 60.0
                );
                Ok(output)
            }
            Err(e) => {
                let e = if cancel.is_cancelled() {
                    PipelineError::Cancelled
                } else {
                    e
                };
                error!(
                    job = %job.id,
                    stage = PipelineStage::Failed.as_str(),
                    failed_in = stage.as_str(),
                    "{}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        job: &mut UpscaleJob,
        job_dir: &Path,
        started: Instant,
        stage: &mut PipelineStage,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let segments_dir = job_dir.join(SEGMENTS_DIR);
        create_dir(&segments_dir)?;
        if let Some(parent) = job.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir(parent)?;
        }
        job.progress.advance_to(SETUP_DONE_BP, "setup complete");

        let metadata = probe_metadata(&self.tools.ffprobe, &job.input.path, cancel).await?;
        if metadata.total_frames == 0 {
            return Err(PipelineError::EmptyVideo);
        }
        if job.target_fps == 0 {
            job.target_fps = metadata.fps;
        }
        *stage = PipelineStage::MetadataProbed;
        job.progress.advance_to(METADATA_DONE_BP, "metadata probed");

        let audio_path = job_dir.join(AUDIO_FILE_NAME);
        job.has_audio = extract_audio(
            &self.tools.ffprobe,
            &self.tools.ffmpeg,
            &job.input.path,
            &audio_path,
            cancel,
        )
        .await?;
        *stage = PipelineStage::AudioHandled;
        job.progress.advance_to(AUDIO_DONE_BP, "audio handled");

        let batches = plan_batches(metadata.total_frames, self.batch_size);
        let total_batches = batches.len() as u32;
        let mut segments = Vec::with_capacity(batches.len());
        let mut processed = 0u64;

        for batch in &batches {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let number = batch.number();
            let batch_started = Instant::now();
            job.progress.begin_batch(number, total_batches);
            info!("Processing frames {} - {}", batch.start + 1, batch.end());

            let batch_dir = job_dir.join(format!("{}{}", BATCH_DIR_PREFIX, Uuid::new_v4()));
            create_dir(&batch_dir)?;

            *stage = PipelineStage::Extracting { batch: number };
            let frames = extract_frames(
                &self.tools.ffmpeg,
                &batch_dir,
                &job.input.path,
                batch.start,
                batch.count,
                job.scale,
                &metadata,
                cancel,
            )
            .await
            .map_err(|source| PipelineError::Extract { batch: number, source })?;

            *stage = PipelineStage::Upscaling { batch: number };
            upscale_frames(&frames, &batch_dir, job, &self.upscaler, cancel)
                .await
                .map_err(|source| PipelineError::Upscale { batch: number, source })?;
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            *stage = PipelineStage::Reassembling { batch: number };
            let segment = segments_dir.join(format!("segment_{:04}.mp4", number));
            reassemble_segment(&self.tools.ffmpeg, &batch_dir, job.target_fps, &segment, cancel)
                .await
                .map_err(|source| PipelineError::Reassemble { batch: number, source })?;
            segments.push(segment);

            *stage = PipelineStage::BatchCleanup { batch: number };
            remove_scratch(&batch_dir);

            processed += batch.count;
            let eta = job_eta(started, processed, metadata.total_frames);
            job.progress.set_eta(eta);
            job.progress.advance_to(
                BatchWindow::for_batch(number, total_batches).end_bp,
                "batch complete",
            );
            info!(
                "Batch {}/{} completed in {:.2}s. ETA: {}s",
                number,
                total_batches,
                batch_started.elapsed().as_secs_f64(),
                eta.map(|d| d.as_secs()).unwrap_or(0)
            );
        }
        job.progress.advance_to(BATCHES_DONE_BP, "all batches complete");

        *stage = PipelineStage::Merging;
        let audio = job.has_audio.then_some(audio_path.as_path());
        let output = merge_segments(
            &self.tools.ffmpeg,
            &segments,
            &job_dir.join(MANIFEST_FILE_NAME),
            audio,
            &job.output_path,
            cancel,
        )
        .await?;
        job.progress.advance_to(MERGE_DONE_BP, "merged");
        *stage = PipelineStage::Cleanup;

        Ok(output)
    }
}
