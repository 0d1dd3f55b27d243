//! Upscale service
//!
//! Owns configuration, shared metrics and the cancellation token, and runs
//! submitted jobs one after another. Progress events are forwarded into the
//! metrics snapshot as they happen.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::Config;
use crate::job::{output_path_for, JobError, JobOutcome, UpscaleJob, UpscaleRequest};
use crate::metrics::{
    new_shared_metrics, timestamp_ms, JobMetrics, SharedMetrics, SystemSampler,
};
use crate::metrics_server::run_metrics_server;
use crate::orchestrator::{Orchestrator, PipelineError};
use crate::progress::{ChannelProgress, FanoutProgress, ProgressSink};
use crate::startup::{run_startup_checks, sweep_stale_job_dirs, StartupError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How often system metrics are refreshed while serving
const SYSTEM_METRICS_INTERVAL: Duration = Duration::from_millis(500);

/// Result of one submitted input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub input: PathBuf,
    pub outcome: JobOutcome,
}

/// Runs upscale jobs sequentially
pub struct UpscaleService {
    config: Config,
    plan: ConcurrencyPlan,
    metrics: SharedMetrics,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl UpscaleService {
    /// Create a service
    ///
    /// `sink` receives every progress event in addition to the metrics
    /// snapshot.
    pub fn new(config: Config, sink: Arc<dyn ProgressSink>) -> Self {
        let plan = derive_plan(&config);
        Self {
            config,
            plan,
            metrics: new_shared_metrics(),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan(&self) -> &ConcurrencyPlan {
        &self.plan
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Token that cancels the running job and every job after it
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sweep stale scratch directories and optionally run startup checks
    pub fn prepare(&self, run_checks: bool) -> Result<(), StartupError> {
        if run_checks {
            run_startup_checks(&self.config)?;
        }
        sweep_stale_job_dirs(&self.config.pipeline.resolved_temp_root())?;
        Ok(())
    }

    /// Validate a request for `input` and build its job
    ///
    /// The output lands in `output_dir` as `<stem>_upscaled.mp4`.
    pub fn submit(
        &self,
        input: &Path,
        request: &UpscaleRequest,
        output_dir: &Path,
    ) -> Result<UpscaleJob, JobError> {
        UpscaleJob::new(input, output_path_for(input, output_dir), request)
    }

    /// Run `jobs` one at a time, in order
    ///
    /// After cancellation the remaining jobs are reported as cancelled
    /// without being started.
    pub async fn run_jobs(&self, jobs: Vec<UpscaleJob>) -> Vec<JobReport> {
        {
            let mut snapshot = self.metrics.write().await;
            for job in &jobs {
                snapshot.jobs.push(JobMetrics::queued(job, self.plan.upscale_workers));
            }
            snapshot.queue_len += jobs.len();
        }

        let (channel, mut rx) = ChannelProgress::channel();
        let channel: Arc<dyn ProgressSink> = Arc::new(channel);
        let sink = FanoutProgress::new(vec![self.sink.clone(), channel]);
        let orchestrator = Orchestrator::new(&self.config, &self.plan, Arc::new(sink));

        let metrics = self.metrics.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                metrics.write().await.apply_progress_event(&event);
            }
        });

        let mut reports = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            let outcome = if self.cancel.is_cancelled() {
                JobOutcome::Failed(PipelineError::Cancelled.to_string())
            } else {
                orchestrator.process(&mut job, &self.cancel).await
            };
            info!("{}: {}", job.input.path.display(), outcome);

            self.metrics.write().await.record_outcome(&job.id, &outcome);
            reports.push(JobReport {
                input: job.input.path.clone(),
                outcome,
            });
        }

        // The orchestrator holds the only sender; dropping it ends the forwarder.
        drop(orchestrator);
        if let Err(e) = forwarder.await {
            error!("Progress forwarder failed: {}", e);
        }

        reports
    }

    /// Serve metrics on `addr` and keep system metrics fresh
    ///
    /// Both tasks run until the runtime shuts down.
    pub fn serve_metrics(&self, addr: SocketAddr) -> (JoinHandle<()>, JoinHandle<()>) {
        let metrics = self.metrics.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, addr).await {
                error!("Metrics server error: {}", e);
            }
        });

        let metrics = self.metrics.clone();
        let updater = tokio::spawn(async move {
            let mut sampler = SystemSampler::new();
            loop {
                tokio::time::sleep(SYSTEM_METRICS_INTERVAL).await;
                let system = sampler.sample();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.system = system;
                    snapshot.timestamp_unix_ms = timestamp_ms();
                }
            }
        });

        (server, updater)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{STAGE_FAILED, STAGE_QUEUED};
    use crate::progress::NoOpProgress;
    use std::fs;
    use tempfile::TempDir;

    fn service_in(dir: &Path) -> UpscaleService {
        let mut config = Config::default();
        config.tools.ffprobe = PathBuf::from("definitely-not-a-real-ffprobe");
        config.tools.ffmpeg = PathBuf::from("definitely-not-a-real-ffmpeg");
        config.pipeline.temp_root = Some(dir.join("scratch"));
        config.upscaler.logical_cores = Some(8);
        UpscaleService::new(config, Arc::new(NoOpProgress))
    }

    fn input_in(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"fake").unwrap();
        path
    }

    #[test]
    fn test_submit_names_output_and_validates() {
        let dir = TempDir::new().unwrap();
        let service = service_in(dir.path());
        let input = input_in(dir.path(), "clip.mkv");
        let out_dir = dir.path().join("output_videos");

        let job = service.submit(&input, &UpscaleRequest::default(), &out_dir).unwrap();
        assert_eq!(job.output_path, out_dir.join("clip_upscaled.mp4"));
        assert_eq!(service.plan().upscale_workers, 4);

        let bad = UpscaleRequest {
            model: "unknown-model".to_string(),
            ..UpscaleRequest::default()
        };
        assert!(matches!(
            service.submit(&input, &bad, &out_dir),
            Err(JobError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_jobs_are_reported_and_counted() {
        let dir = TempDir::new().unwrap();
        let service = service_in(dir.path());
        let out_dir = dir.path().join("out");
        let jobs = vec![
            service
                .submit(&input_in(dir.path(), "a.mp4"), &UpscaleRequest::default(), &out_dir)
                .unwrap(),
            service
                .submit(&input_in(dir.path(), "b.mp4"), &UpscaleRequest::default(), &out_dir)
                .unwrap(),
        ];

        let reports = service.run_jobs(jobs).await;

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].input, dir.path().join("a.mp4"));
        assert!(reports
            .iter()
            .all(|r| matches!(&r.outcome, JobOutcome::Failed(reason) if reason.starts_with("error getting video details"))));

        let snapshot = service.metrics().read().await.clone();
        assert_eq!(snapshot.failed_jobs, 2);
        assert_eq!(snapshot.queue_len, 0);
        assert_eq!(snapshot.running_jobs, 0);
        assert!(snapshot.jobs.iter().all(|j| j.stage == STAGE_FAILED));
    }

    #[tokio::test]
    async fn test_cancelled_service_skips_remaining_jobs() {
        let dir = TempDir::new().unwrap();
        let service = service_in(dir.path());
        let job = service
            .submit(&input_in(dir.path(), "a.mp4"), &UpscaleRequest::default(), dir.path())
            .unwrap();
        service.cancel_token().cancel();

        let reports = service.run_jobs(vec![job]).await;

        assert_eq!(reports[0].outcome, JobOutcome::Failed("job cancelled".to_string()));
        let snapshot = service.metrics().read().await.clone();
        assert_ne!(snapshot.jobs[0].stage, STAGE_QUEUED);
        assert_eq!(snapshot.failed_jobs, 1);
    }

    #[test]
    fn test_prepare_sweeps_stale_job_dirs() {
        let dir = TempDir::new().unwrap();
        let service = service_in(dir.path());
        let stale = dir.path().join("scratch").join("job_left-over");
        fs::create_dir_all(&stale).unwrap();

        service.prepare(false).unwrap();

        assert!(!stale.exists());
    }
}
