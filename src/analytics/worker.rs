use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::storage::{CoverageRecord, Recorder};
use crate::transport::{Delivery, FrameSource};

use super::pipeline::{PipelineError, StreamingPipeline};

const IDLE_WAIT: Duration = Duration::from_millis(50);
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Counters for one run of the stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub processed: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub recorder_failures: u64,
    coverage_sum: f64,
    coverage_min: Option<f64>,
    coverage_max: Option<f64>,
}

impl RunSummary {
    fn observe(&mut self, coverage: f64) {
        self.processed += 1;
        self.coverage_sum += coverage;
        self.coverage_min = Some(self.coverage_min.map_or(coverage, |m| m.min(coverage)));
        self.coverage_max = Some(self.coverage_max.map_or(coverage, |m| m.max(coverage)));
    }

    pub fn mean_coverage(&self) -> Option<f64> {
        (self.processed > 0).then(|| self.coverage_sum / self.processed as f64)
    }

    fn log(&self) {
        tracing::info!(
            processed = self.processed,
            buffered = self.buffered,
            dropped = self.dropped,
            rejected = self.rejected,
            recorder_failures = self.recorder_failures,
            mean_coverage = ?self.mean_coverage().map(|c| format!("{c:.2}")),
            min_coverage = ?self.coverage_min,
            max_coverage = ?self.coverage_max,
            "run summary"
        );
    }
}

/// Single consumer for one stream. Pulls one delivery at a time and settles
/// it before asking for the next.
pub struct StreamWorker {
    pipeline: StreamingPipeline,
    source: Box<dyn FrameSource>,
    recorder: Box<dyn Recorder>,
    hive_id: Option<String>,
    summary: RunSummary,
}

impl StreamWorker {
    pub fn new(
        pipeline: StreamingPipeline,
        source: Box<dyn FrameSource>,
        recorder: Box<dyn Recorder>,
        hive_id: Option<String>,
    ) -> Self {
        Self {
            pipeline,
            source,
            recorder,
            hive_id,
            summary: RunSummary::default(),
        }
    }

    /// Runs until the source is exhausted, `shutdown` is raised, or a fatal
    /// error stops the stream.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<RunSummary, PipelineError> {
        tracing::info!("stream worker started");

        let outcome = loop {
            if shutdown.load(Ordering::Relaxed) {
                tracing::info!("shutdown requested, stopping stream");
                break Ok(());
            }

            match self.source.next_delivery() {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle(delivery) {
                        break Err(e);
                    }
                }
                Ok(None) if self.source.is_finished() => {
                    tracing::info!("source exhausted");
                    break Ok(());
                }
                Ok(None) => thread::sleep(IDLE_WAIT),
                Err(e) => {
                    tracing::error!(error = %e, "failed to fetch delivery");
                    thread::sleep(SOURCE_ERROR_BACKOFF);
                }
            }
        };

        self.summary.log();
        match outcome {
            Ok(()) => Ok(self.summary),
            Err(e) => {
                tracing::error!(error = %e, "stream stopped");
                Err(e)
            }
        }
    }

    /// Processes and settles one delivery. Only fatal errors are returned.
    pub fn handle(&mut self, delivery: Delivery) -> Result<(), PipelineError> {
        let tag = delivery.tag;

        match self.pipeline.ingest(&delivery.body, &delivery.metadata) {
            Ok(Some(result)) => {
                let record = CoverageRecord::from_result(&result, self.hive_id.as_deref());
                if let Err(e) = self.recorder.record(&record) {
                    self.summary.recorder_failures += 1;
                    tracing::warn!(filename = %record.filename, error = %e, "failed to record result");
                }
                self.summary.observe(result.coverage_percent);
                tracing::info!(
                    hive = %record.hive_id,
                    filename = %record.filename,
                    coverage = format!("{:.2}", record.coverage_percent),
                    background = ?self.pipeline.background_version(),
                    "bee coverage"
                );
                self.ack(tag);
            }
            Ok(None) => {
                self.summary.buffered += 1;
                tracing::trace!(
                    tag,
                    state = ?self.pipeline.state(),
                    frames = self.pipeline.frames_seen(),
                    "frame held without a result"
                );
                self.ack(tag);
            }
            Err(PipelineError::Decode(e)) => {
                self.summary.dropped += 1;
                tracing::warn!(tag, error = %e, "undecodable frame dropped");
                self.ack(tag);
            }
            Err(e) if e.is_fatal() => {
                self.summary.rejected += 1;
                self.nack(tag);
                return Err(e);
            }
            Err(e) => {
                self.summary.rejected += 1;
                tracing::warn!(tag, error = %e, "frame rejected");
                self.nack(tag);
            }
        }

        Ok(())
    }

    fn ack(&mut self, tag: u64) {
        if let Err(e) = self.source.ack(tag) {
            tracing::error!(tag, error = %e, "ack failed");
        }
    }

    fn nack(&mut self, tag: u64) {
        if let Err(e) = self.source.nack(tag) {
            tracing::error!(tag, error = %e, "nack failed");
        }
    }
}

pub fn spawn_worker(
    worker: StreamWorker,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<Result<RunSummary, PipelineError>> {
    tokio::task::spawn_blocking(move || worker.run(shutdown))
}
