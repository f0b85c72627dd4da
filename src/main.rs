use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod analytics;
mod buffer;
mod config;
mod storage;
mod transport;

use analytics::{spawn_worker, StreamWorker, StreamingPipeline};
use config::{Config, RecorderKind};
use storage::{
    ArtifactWriter, CsvRecorder, MemoryRecorder, Recorder, RegionSource, RegionStore,
    SqliteRecorder,
};
use transport::DirectorySource;

const DRY_RUN_RECORDS: usize = 10_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hivecover=debug".parse()?))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };
    tracing::info!(
        source = %config.source.dir.display(),
        window = config.background.size,
        update_every = config.background.update_every,
        thresholds = ?config.detection.thresholds,
        "loaded config"
    );

    let mut dry_run = None;
    let recorder: Box<dyn Recorder> = match config.recorder.kind {
        RecorderKind::Sqlite => {
            let recorder = SqliteRecorder::open(&config.recorder.database_path)?;
            tracing::info!(path = %config.recorder.database_path.display(), "sqlite recorder ready");
            Box::new(recorder)
        }
        RecorderKind::Csv => {
            let recorder = CsvRecorder::open(&config.recorder.csv_path)?;
            tracing::info!(path = %config.recorder.csv_path.display(), "csv recorder ready");
            Box::new(recorder)
        }
        RecorderKind::Memory => {
            let recorder = MemoryRecorder::new(DRY_RUN_RECORDS);
            dry_run = Some(recorder.clone());
            tracing::info!("dry run, results are not persisted");
            Box::new(recorder)
        }
    };

    let source = DirectorySource::new(&config.source)?;
    let region_source = RegionSource::new(
        config.region.points.clone(),
        RegionStore::new(config.region.path.clone()),
        None,
    );

    let mut pipeline = StreamingPipeline::new(&config, region_source);
    if config.artifacts.enabled {
        pipeline = pipeline.with_artifacts(ArtifactWriter::new(config.artifacts.dir.clone())?);
        tracing::info!(dir = %config.artifacts.dir.display(), "writing debug artifacts");
    }

    let worker = StreamWorker::new(
        pipeline,
        Box::new(source),
        recorder,
        config.recorder.hive_id.clone(),
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handle = spawn_worker(worker, Arc::clone(&shutdown));

    let outcome = tokio::select! {
        result = &mut handle => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            shutdown.store(true, Ordering::Relaxed);
            handle.await
        }
    };

    match outcome {
        Ok(Ok(summary)) => {
            if let Some(memory) = dry_run {
                tracing::info!(
                    kept = memory.len(),
                    last = ?memory.last().map(|r| format!("{} {:.2}", r.filename, r.coverage_percent)),
                    "dry run results"
                );
            }
            tracing::info!(processed = summary.processed, "shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "stream failed");
            Err(e.into())
        }
        Err(e) => {
            tracing::error!(error = %e, "stream worker task failed");
            Err(e.into())
        }
    }
}
