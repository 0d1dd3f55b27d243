//! Metrics for upscale runs
//!
//! Job progress, system load and run counters gathered into one
//! JSON-serializable snapshot.

use crate::job::{JobOutcome, UpscaleJob};
use crate::progress::ProgressEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::RwLock;

/// Stage reported for a job that has not started yet
pub const STAGE_QUEUED: &str = "queued";
/// Stage reported for a finished job
pub const STAGE_COMPLETED: &str = "completed";
/// Stage reported for a failed job
pub const STAGE_FAILED: &str = "failed";

/// Per-job metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub input_path: String,
    pub output_path: String,
    /// Latest checkpoint label, or queued/completed/failed
    pub stage: String,
    /// Percent complete, 0.0 - 100.0
    pub progress: f32,
    pub model: String,
    pub scale: u32,
    pub workers: u32,
    pub current_batch: u32,
    pub total_batches: u32,
    pub est_remaining_secs: Option<f32>,
    pub size_in_bytes_before: u64,
    /// Failure reason, once failed
    pub error: Option<String>,
}

impl JobMetrics {
    /// Metrics for a job that has not started yet
    pub fn queued(job: &UpscaleJob, workers: u32) -> Self {
        Self {
            id: job.id.clone(),
            input_path: job.input.path.to_string_lossy().to_string(),
            output_path: job.output_path.to_string_lossy().to_string(),
            stage: STAGE_QUEUED.to_string(),
            progress: 0.0,
            model: job.model.clone(),
            scale: job.scale,
            workers,
            current_batch: 0,
            total_batches: 0,
            est_remaining_secs: None,
            size_in_bytes_before: job.input.size_bytes,
            error: None,
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and run counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
}

/// Shared metrics state for the service and the HTTP endpoint
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

impl MetricsSnapshot {
    fn recount_running(&mut self) {
        self.running_jobs = self
            .jobs
            .iter()
            .filter(|j| ![STAGE_QUEUED, STAGE_COMPLETED, STAGE_FAILED].contains(&j.stage.as_str()))
            .count();
    }

    /// Fold a progress event into the matching job
    ///
    /// Events for unknown or already finished jobs are ignored. Progress
    /// never moves backwards.
    pub fn apply_progress_event(&mut self, event: &ProgressEvent) {
        let Some(job) = self.jobs.iter_mut().find(|j| j.id == event.job_id) else {
            return;
        };
        if job.stage == STAGE_COMPLETED || job.stage == STAGE_FAILED {
            return;
        }
        if job.stage == STAGE_QUEUED {
            self.queue_len = self.queue_len.saturating_sub(1);
        }
        job.stage = event.label.clone();
        job.progress = job.progress.max(event.percent);
        job.current_batch = event.current_batch;
        job.total_batches = event.total_batches;
        job.est_remaining_secs = event.eta_secs;
        self.recount_running();
    }

    /// Record a job's terminal outcome
    pub fn record_outcome(&mut self, job_id: &str, outcome: &JobOutcome) {
        let Some(job) = self.jobs.iter_mut().find(|j| j.id == job_id) else {
            return;
        };
        let was_queued = job.stage == STAGE_QUEUED;
        match outcome {
            JobOutcome::Success(_) => {
                job.stage = STAGE_COMPLETED.to_string();
                job.progress = 100.0;
                job.est_remaining_secs = Some(0.0);
                self.completed_jobs += 1;
            }
            JobOutcome::Failed(reason) => {
                job.stage = STAGE_FAILED.to_string();
                job.error = Some(reason.clone());
                self.failed_jobs += 1;
            }
        }
        if was_queued {
            self.queue_len = self.queue_len.saturating_sub(1);
        }
        self.recount_running();
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Samples system metrics with sysinfo
///
/// CPU usage is the delta between two refreshes, so one sampler has to live
/// across samples taken at least `sysinfo::MINIMUM_CPU_UPDATE_INTERVAL` apart.
pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self { sys }
    }

    /// Refresh and return current system metrics
    pub fn sample(&mut self) -> SystemMetrics {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let total_memory = self.sys.total_memory();
        let mem_usage = if total_memory > 0 {
            (self.sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };
        let load_avg = System::load_average();

        SystemMetrics {
            cpu_usage_percent: self.sys.global_cpu_usage(),
            mem_usage_percent: mem_usage,
            load_avg_1: load_avg.one as f32,
            load_avg_5: load_avg.five as f32,
            load_avg_15: load_avg.fifteen as f32,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
