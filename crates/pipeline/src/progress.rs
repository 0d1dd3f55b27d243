//! Progress reporting for upscale jobs
//!
//! A job's progress lives in a [`JobProgress`] shared between the orchestrator
//! and the frame-upscale workers. Values are kept in basis points (1/100 of a
//! percent) so per-batch windows divide without rounding drift, and every
//! update goes through a single writer lock so sinks never observe a value
//! lower than one they have already seen.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, trace};

/// Basis points in one percent
pub const BP_PER_PERCENT: u32 = 100;

/// Progress after temp directories are prepared
pub const SETUP_DONE_BP: u32 = 5 * BP_PER_PERCENT;
/// Progress after the metadata probe
pub const METADATA_DONE_BP: u32 = 10 * BP_PER_PERCENT;
/// Progress after audio detection/extraction
pub const AUDIO_DONE_BP: u32 = 15 * BP_PER_PERCENT;
/// Start of the window shared by all batches
pub const BATCH_WINDOW_START_BP: u32 = 15 * BP_PER_PERCENT;
/// End of the window shared by all batches
pub const BATCH_WINDOW_END_BP: u32 = 85 * BP_PER_PERCENT;
/// Progress once every batch segment exists
pub const BATCHES_DONE_BP: u32 = 90 * BP_PER_PERCENT;
/// Progress after the final merge
pub const MERGE_DONE_BP: u32 = 95 * BP_PER_PERCENT;
/// Progress after cleanup
pub const COMPLETE_BP: u32 = 100 * BP_PER_PERCENT;

/// A progress notification for one job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    /// Percent complete, 0.0 - 100.0
    pub percent: f32,
    /// Human-readable checkpoint label
    pub label: String,
    /// 1-based index of the batch in flight (0 before the batch loop)
    pub current_batch: u32,
    pub total_batches: u32,
    /// Advisory estimate of the time left
    pub eta_secs: Option<f32>,
}

/// Receiver of progress events
///
/// Implementations must be [`Send`] and [`Sync`]: events are emitted from
/// frame-upscale workers running on the tokio thread pool.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Discards every event.
pub struct NoOpProgress;

impl ProgressSink for NoOpProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Logs checkpoints at info level and intra-batch updates at trace level.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        if event.label == FRAMES_LABEL {
            trace!(
                job = %event.job_id,
                percent = event.percent,
                batch = event.current_batch,
                "upscaling frames"
            );
        } else {
            info!(
                job = %event.job_id,
                percent = event.percent,
                eta_secs = ?event.eta_secs,
                "{}",
                event.label
            );
        }
    }
}

/// Forwards events over an unbounded channel to an async consumer.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        // A closed receiver only means nobody is listening any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Delivers every event to each inner sink in order.
pub struct FanoutProgress {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutProgress {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for FanoutProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.on_progress(event);
        }
    }
}

/// Label used for intra-batch frame updates
pub const FRAMES_LABEL: &str = "upscaling frames";

#[derive(Debug, Default)]
struct ProgressInner {
    bp: u32,
    current_batch: u32,
    total_batches: u32,
    eta: Option<Duration>,
}

/// Shared, monotonic progress state for one job run
#[derive(Clone)]
pub struct JobProgress {
    job_id: Arc<str>,
    inner: Arc<Mutex<ProgressInner>>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for JobProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("JobProgress")
            .field("job_id", &self.job_id)
            .field("bp", &inner.bp)
            .field("current_batch", &inner.current_batch)
            .field("total_batches", &inner.total_batches)
            .finish()
    }
}

impl JobProgress {
    pub fn new(job_id: &str, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            job_id: Arc::from(job_id),
            inner: Arc::new(Mutex::new(ProgressInner::default())),
            sink,
        }
    }

    /// Progress that reports nowhere
    pub fn detached(job_id: &str) -> Self {
        Self::new(job_id, Arc::new(NoOpProgress))
    }

    fn lock(&self) -> MutexGuard<'_, ProgressInner> {
        // A panicking writer cannot leave the counters half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current progress in basis points
    pub fn basis_points(&self) -> u32 {
        self.lock().bp
    }

    /// Current progress in percent
    pub fn percent(&self) -> f32 {
        bp_to_percent(self.basis_points())
    }

    /// (current, total) batch indices
    pub fn batches(&self) -> (u32, u32) {
        let inner = self.lock();
        (inner.current_batch, inner.total_batches)
    }

    /// Record the batch now in flight
    pub fn begin_batch(&self, current: u32, total: u32) {
        let mut inner = self.lock();
        inner.current_batch = current;
        inner.total_batches = total;
    }

    /// Record the latest advisory time-remaining estimate
    pub fn set_eta(&self, eta: Option<Duration>) {
        self.lock().eta = eta;
    }

    /// Advance to `bp` and notify the sink
    ///
    /// Values below the recorded progress are ignored, so concurrent writers
    /// can never move a job backwards. Returns the progress after the call.
    pub fn advance_to(&self, bp: u32, label: &str) -> u32 {
        let mut inner = self.lock();
        if bp < inner.bp {
            return inner.bp;
        }
        inner.bp = bp.min(COMPLETE_BP);

        let event = ProgressEvent {
            job_id: self.job_id.to_string(),
            percent: bp_to_percent(inner.bp),
            label: label.to_string(),
            current_batch: inner.current_batch,
            total_batches: inner.total_batches,
            eta_secs: inner.eta.map(|d| d.as_secs_f32()),
        };
        // Emitting under the lock keeps sink order identical to value order.
        self.sink.on_progress(&event);
        inner.bp
    }
}

pub fn bp_to_percent(bp: u32) -> f32 {
    bp as f32 / BP_PER_PERCENT as f32
}

/// The slice of the global batch window owned by one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub start_bp: u32,
    pub end_bp: u32,
}

impl BatchWindow {
    /// Window for a 1-based `current` batch out of `total`
    ///
    /// The global window is split evenly; consecutive batches share their
    /// boundary and the last batch ends exactly at the window end.
    pub fn for_batch(current: u32, total: u32) -> Self {
        Self::within(BATCH_WINDOW_START_BP, BATCH_WINDOW_END_BP, current, total)
    }

    pub fn within(window_start: u32, window_end: u32, current: u32, total: u32) -> Self {
        let total = total.max(1) as u64;
        let current = (current.max(1) as u64).min(total);
        let range = window_end.saturating_sub(window_start) as u64;

        let start_bp = window_start + (range * (current - 1) / total) as u32;
        let end_bp = window_start + (range * current / total) as u32;
        Self { start_bp, end_bp }
    }

    /// Progress after `completed` of `total_frames` frames are done
    ///
    /// Equals `end_bp` exactly when `completed == total_frames`.
    pub fn progress_at(&self, completed: usize, total_frames: usize) -> u32 {
        if total_frames == 0 || completed >= total_frames {
            return self.end_bp;
        }
        let span = (self.end_bp - self.start_bp) as u64;
        self.start_bp + (span * completed as u64 / total_frames as u64) as u32
    }
}

/// Frames between progress updates: roughly every 5%, at least one
pub fn progress_step(total_frames: usize) -> usize {
    (total_frames / 20).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Sink that remembers everything it saw
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, event: &ProgressEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Batch windows tile the global window without gaps or overlaps.
        #[test]
        fn prop_batch_windows_tile_global_window(total in 1u32..500) {
            let mut expected_start = BATCH_WINDOW_START_BP;
            for current in 1..=total {
                let window = BatchWindow::for_batch(current, total);
                prop_assert_eq!(window.start_bp, expected_start);
                prop_assert!(window.end_bp >= window.start_bp);
                expected_start = window.end_bp;
            }
            prop_assert_eq!(expected_start, BATCH_WINDOW_END_BP);
        }

        // Intra-batch progress is non-decreasing and lands exactly on the window end.
        #[test]
        fn prop_progress_monotonic_and_reaches_end(
            total in 1u32..100,
            frames in 1usize..2000,
            seed in any::<u32>(),
        ) {
            let current = seed % total + 1;
            let window = BatchWindow::for_batch(current, total);

            let mut last = window.start_bp;
            for completed in 0..=frames {
                let bp = window.progress_at(completed, frames);
                prop_assert!(bp >= last);
                prop_assert!(bp <= window.end_bp);
                last = bp;
            }
            prop_assert_eq!(window.progress_at(frames, frames), window.end_bp);
        }

        #[test]
        fn prop_progress_step_cadence(frames in 0usize..100_000) {
            let step = progress_step(frames);
            prop_assert!(step >= 1);
            if frames >= 20 {
                prop_assert_eq!(step, frames / 20);
            }
        }
    }

    #[test]
    fn test_three_batches_split_window() {
        assert_eq!(
            BatchWindow::for_batch(1, 3),
            BatchWindow { start_bp: 1500, end_bp: 3833 }
        );
        assert_eq!(
            BatchWindow::for_batch(3, 3),
            BatchWindow { start_bp: 6166, end_bp: 8500 }
        );
    }

    #[test]
    fn test_advance_ignores_regressions() {
        let sink = Arc::new(RecordingSink::default());
        let progress = JobProgress::new("job-1", sink.clone());

        progress.advance_to(1000, "a");
        assert_eq!(progress.advance_to(500, "b"), 1000);
        progress.advance_to(1000, "c");
        progress.advance_to(2000, "d");

        let events = sink.events.lock().unwrap();
        let labels: Vec<&str> = events.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "c", "d"]);
        assert_eq!(progress.percent(), 20.0);
    }

    #[test]
    fn test_advance_clamps_to_complete() {
        let progress = JobProgress::detached("job-2");
        assert_eq!(progress.advance_to(COMPLETE_BP + 500, "done"), COMPLETE_BP);
    }

    #[test]
    fn test_events_carry_batch_and_eta() {
        let sink = Arc::new(RecordingSink::default());
        let progress = JobProgress::new("job-3", sink.clone());
        progress.begin_batch(2, 5);
        progress.set_eta(Some(Duration::from_secs(90)));
        progress.advance_to(4000, FRAMES_LABEL);

        let events = sink.events.lock().unwrap();
        assert_eq!(events[0].current_batch, 2);
        assert_eq!(events[0].total_batches, 5);
        assert_eq!(events[0].eta_secs, Some(90.0));
        assert_eq!(events[0].percent, 40.0);
    }

    #[test]
    fn test_concurrent_writers_emit_non_decreasing_values() {
        let sink = Arc::new(RecordingSink::default());
        let progress = JobProgress::new("job-4", sink.clone());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let progress = progress.clone();
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        progress.advance_to(i * 8 + worker, FRAMES_LABEL);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let events = sink.events.lock().unwrap();
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let sinks: Vec<Arc<dyn ProgressSink>> =
            vec![first.clone(), Arc::new(NoOpProgress), second.clone()];
        let fanout = FanoutProgress::new(sinks);
        let progress = JobProgress::new("job-6", Arc::new(fanout));

        progress.advance_to(METADATA_DONE_BP, "metadata probed");

        assert_eq!(first.events.lock().unwrap().len(), 1);
        assert_eq!(second.events.lock().unwrap()[0].label, "metadata probed");
    }

    #[tokio::test]
    async fn test_channel_progress_forwards_events() {
        let (sink, mut rx) = ChannelProgress::channel();
        let progress = JobProgress::new("job-5", Arc::new(sink));
        progress.advance_to(SETUP_DONE_BP, "setup");

        let event = rx.recv().await.expect("event should be forwarded");
        assert_eq!(event.job_id, "job-5");
        assert_eq!(event.percent, 5.0);
    }
}
