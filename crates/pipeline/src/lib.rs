//! Revive Pixels
//!
//! Batched video upscaling pipeline: probe, audio extraction, per-batch frame
//! extraction, AI upscaling and reassembly, then a stream-copy merge.

pub mod audio;
pub mod batch;
pub mod command;
pub mod concurrency;
pub mod frames;
pub mod job;
pub mod merge;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod reassemble;
pub mod scan;
pub mod service;
pub mod startup;
pub mod upscale;

pub use revive_pixels_config as config;
pub use revive_pixels_config::Config;
pub use audio::{extract_audio, AudioError};
pub use batch::{plan_batches, Batch};
pub use command::{run_tool, ToolError};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use frames::{extract_frames, FrameExtractionError};
pub use job::{
    output_path_for, JobError, JobOutcome, UpscaleJob, UpscaleRequest, DEFAULT_MODEL,
    UPSCALE_MODELS,
};
pub use merge::{merge_segments, MergeError};
pub use metrics::{
    new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics, SystemMetrics,
    SystemSampler,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError, METRICS_ADDR};
pub use orchestrator::{Orchestrator, PipelineError, PipelineStage};
pub use probe::{probe_metadata, ProbeError, VideoMetadata};
pub use progress::{
    ChannelProgress, FanoutProgress, JobProgress, NoOpProgress, ProgressEvent, ProgressSink,
    TracingProgress,
};
pub use reassemble::{reassemble_segment, ReassemblyError};
pub use scan::{collect_inputs, is_video_file};
pub use service::{JobReport, UpscaleService};
pub use startup::{run_startup_checks, sweep_stale_job_dirs, StartupError};
pub use upscale::{upscale_frames, FrameUpscaleError, UpscaleError, UpscalerSettings};
