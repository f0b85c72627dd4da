use chrono::{Local, NaiveDateTime};
use opencv::core::Mat;
use thiserror::Error;

use crate::buffer::FrameBuffer;
use crate::config::Config;
use crate::storage::{ArtifactWriter, RegionSource, RegionStoreError};
use crate::transport::{
    decode_body, parse_timestamp, sanitize_filename, synthesize_filename, DecodeError,
    FrameMetadata,
};

use super::background::{build_background, BackgroundError, BackgroundModel};
use super::detector::{
    DetectError, DetectionParameters, DetectionResult, OccupancyDetector, ValidArea,
};
use super::region::{crop_to_region, Region, RegionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No region resolved yet.
    Uninitialized,
    /// Filling the frame window; nothing is emitted.
    Buffering,
    /// A reference exists; every frame yields a result.
    Ready,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no region configured and none could be obtained")]
    RegionUnavailable,
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    RegionStore(#[from] RegionStoreError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Background(#[from] BackgroundError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
}

impl PipelineError {
    /// Errors after which the stream cannot continue. A frame that misses
    /// the polygon is a per-frame failure, not a bad polygon.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::RegionUnavailable
                | PipelineError::Region(RegionError::InvalidRegion(_))
                | PipelineError::RegionStore(_)
        )
    }
}

/// Per-stream state machine: resolves the region on the first frame, fills
/// the frame window, then analyses every frame against a background that is
/// rebuilt from the window every `update_every` frames.
pub struct StreamingPipeline {
    state: StreamState,
    region_source: RegionSource,
    pre_cropped: bool,
    region: Option<Region>,
    buffer: FrameBuffer,
    params: DetectionParameters,
    detector: Option<OccupancyDetector>,
    update_every: u64,
    frames_decoded: u64,
    frames_seen: u64,
    background_version: u64,
    artifacts: Option<ArtifactWriter>,
}

impl StreamingPipeline {
    pub fn new(config: &Config, region_source: RegionSource) -> Self {
        Self {
            state: StreamState::Uninitialized,
            region_source,
            pre_cropped: config.region.pre_cropped,
            region: None,
            buffer: FrameBuffer::new(config.background.size),
            params: config.detection.parameters(),
            detector: None,
            update_every: config.background.update_every.max(1),
            frames_decoded: 0,
            frames_seen: 0,
            background_version: 0,
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactWriter) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Frames that made it into the window.
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn background_version(&self) -> Option<u64> {
        self.detector.as_ref().map(|d| d.background().version())
    }

    /// Decodes one message body and feeds it through the pipeline.
    pub fn ingest(
        &mut self,
        body: &[u8],
        metadata: &FrameMetadata,
    ) -> Result<Option<DetectionResult>, PipelineError> {
        let decoded = decode_body(body)?;
        self.frames_decoded += 1;

        let timestamp = metadata
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(|| Local::now().naive_local());

        let filename = match metadata.filename.as_deref().or(decoded.embedded_filename.as_deref()) {
            Some(name) => sanitize_filename(name),
            None => synthesize_filename(self.frames_decoded, &timestamp),
        };

        self.ingest_frame(&decoded.image, &filename, timestamp)
    }

    pub fn ingest_frame(
        &mut self,
        frame: &Mat,
        filename: &str,
        timestamp: NaiveDateTime,
    ) -> Result<Option<DetectionResult>, PipelineError> {
        if self.state == StreamState::Uninitialized {
            self.initialize(frame)?;
        }

        let cropped = crop_to_region(frame, self.region.as_ref())?;
        // Size conflicts are settled before buffering so the window stays uniform.
        let image = match self.detector.as_ref() {
            Some(detector) => detector.reconcile(&cropped.image)?,
            None => cropped.image,
        };
        self.buffer.push(image.try_clone()?);
        self.frames_seen += 1;

        if let Some(ref artifacts) = self.artifacts {
            if self.frames_seen == 1 {
                if let Some(ref mask) = cropped.mask {
                    artifacts.save_region_mask(mask);
                }
            }
            artifacts.save_cropped(filename, &image);
        }

        match self.state {
            StreamState::Ready => {
                if self.frames_seen % self.update_every == 0 {
                    self.refresh_background();
                }
            }
            _ if self.buffer.is_full() => self.become_ready()?,
            _ => {
                tracing::debug!(
                    frame = self.frames_seen,
                    buffered = self.buffer.len(),
                    capacity = self.buffer.capacity(),
                    filename = %filename,
                    "buffering"
                );
                return Ok(None);
            }
        }

        let Some(detector) = self.detector.as_mut() else {
            return Ok(None);
        };
        let result = detector.analyze(&image, filename, timestamp)?;

        tracing::debug!(
            frame = self.frames_seen,
            filename = %result.filename,
            coverage = result.coverage_percent,
            bee_area = result.bee_area_pixels,
            total_area = result.total_area_pixels,
            score = result.score,
            contours = result.contour_count,
            threshold = %result.threshold_used,
            method = %result.detection_method,
            "frame analysed"
        );

        if let Some(ref artifacts) = self.artifacts {
            artifacts.save_result(&image, &result);
        }

        Ok(Some(result))
    }

    fn initialize(&mut self, first_frame: &Mat) -> Result<(), PipelineError> {
        if !self.pre_cropped {
            let region = self
                .region_source
                .resolve(first_frame)?
                .ok_or(PipelineError::RegionUnavailable)?;
            tracing::info!(
                points = region.points().len(),
                valid_area = region.valid_area_pixels(),
                "region established"
            );
            self.region = Some(region);
        } else {
            tracing::info!("frames are pre-cropped, counting non-black pixels as valid area");
        }

        self.state = StreamState::Buffering;
        Ok(())
    }

    fn build_model(&mut self) -> Result<BackgroundModel, BackgroundError> {
        let image = build_background(self.buffer.iter())?;
        self.background_version += 1;

        if let Some(ref artifacts) = self.artifacts {
            artifacts.save_background(self.frames_seen, &image);
        }
        BackgroundModel::new(image, self.background_version)
    }

    fn become_ready(&mut self) -> Result<(), PipelineError> {
        let model = self.build_model()?;
        let valid_area = match self.region {
            Some(ref region) => ValidArea::Fixed(region.valid_area_pixels()),
            None => ValidArea::NonZeroPixels,
        };

        tracing::info!(
            frames = self.buffer.len(),
            version = model.version(),
            "background built, stream ready"
        );
        self.detector = Some(OccupancyDetector::new(model, valid_area, self.params.clone()));
        self.state = StreamState::Ready;
        Ok(())
    }

    /// A failed rebuild keeps the current reference.
    fn refresh_background(&mut self) {
        match self.build_model() {
            Ok(model) => {
                if let Some(detector) = self.detector.as_mut() {
                    detector.update_background(model);
                }
            }
            Err(e) => tracing::warn!(
                frame = self.frames_seen,
                error = %e,
                "background refresh failed, keeping previous reference"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::DetectionMethod;
    use crate::storage::RegionStore;
    use chrono::NaiveDate;
    use opencv::core::{Rect, Scalar, Vector, CV_8UC3};
    use opencv::imgcodecs;
    use opencv::imgproc;
    use opencv::prelude::*;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn gray_frame(size: i32) -> Mat {
        Mat::new_rows_cols_with_default(size, size, CV_8UC3, Scalar::all(120.0)).unwrap()
    }

    fn pipeline(
        dir: &std::path::Path,
        size: usize,
        update_every: u64,
        points: Option<Vec<[i32; 2]>>,
    ) -> StreamingPipeline {
        let mut config = Config::default();
        config.background.size = size;
        config.background.update_every = update_every;
        config.region.pre_cropped = points.is_none();
        let source = RegionSource::new(points, RegionStore::new(dir.join("region.json")), None);
        StreamingPipeline::new(&config, source)
    }

    #[test]
    fn test_sixteen_identical_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path(), 15, 1, None);
        let frame = gray_frame(100);
        assert_eq!(pipeline.state(), StreamState::Uninitialized);

        for i in 1..=14 {
            let result = pipeline
                .ingest_frame(&frame, &format!("f{i}.jpg"), ts())
                .unwrap();
            assert!(result.is_none(), "frame {i} should only buffer");
            assert_eq!(pipeline.state(), StreamState::Buffering);
        }

        let fifteenth = pipeline.ingest_frame(&frame, "f15.jpg", ts()).unwrap().unwrap();
        assert_eq!(pipeline.state(), StreamState::Ready);
        assert_eq!(pipeline.background_version(), Some(1));
        assert_eq!(fifteenth.coverage_percent, 0.0);
        assert_eq!(fifteenth.total_area_pixels, 10_000);
        assert_eq!(fifteenth.filename, "f15.jpg");

        let sixteenth = pipeline.ingest_frame(&frame, "f16.jpg", ts()).unwrap().unwrap();
        assert_eq!(sixteenth.coverage_percent, 0.0);
        assert_eq!(sixteenth.bee_area_pixels, 0);
        assert_eq!(pipeline.background_version(), Some(2));
        assert_eq!(pipeline.frames_seen(), 16);
    }

    #[test]
    fn test_one_result_per_frame_once_ready_and_refresh_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path(), 3, 2, None);
        let frame = gray_frame(40);

        let emitted = (1..=8)
            .filter(|i| {
                pipeline
                    .ingest_frame(&frame, &format!("{i}.jpg"), ts())
                    .unwrap()
                    .is_some()
            })
            .count();

        assert_eq!(emitted, 6);
        // built at frame 3, refreshed at 4, 6 and 8
        assert_eq!(pipeline.background_version(), Some(4));
    }

    #[test]
    fn test_dark_square_is_detected_against_region() {
        let dir = tempfile::tempdir().unwrap();
        let points = vec![[0, 0], [99, 0], [99, 99], [0, 99]];
        let mut pipeline = pipeline(dir.path(), 3, 1, Some(points));
        let frame = gray_frame(100);
        for i in 0..3 {
            pipeline.ingest_frame(&frame, &format!("{i}.jpg"), ts()).unwrap();
        }

        let mut bee = gray_frame(100);
        imgproc::rectangle(
            &mut bee,
            Rect::new(35, 35, 30, 30),
            Scalar::all(20.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();

        let result = pipeline.ingest_frame(&bee, "bee.jpg", ts()).unwrap().unwrap();
        assert_eq!(result.detection_method, DetectionMethod::BackgroundSubtraction);
        assert_eq!(result.contour_count, 1);
        assert!(result.coverage_percent > 5.0 && result.coverage_percent < 15.0);
        assert!(result.bee_area_pixels <= result.total_area_pixels);
    }

    #[test]
    fn test_region_unavailable_leaves_stream_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.background.size = 2;
        let source = RegionSource::new(None, RegionStore::new(dir.path().join("none.json")), None);
        let mut pipeline = StreamingPipeline::new(&config, source);

        let err = pipeline.ingest_frame(&gray_frame(20), "a.jpg", ts()).unwrap_err();
        assert!(matches!(err, PipelineError::RegionUnavailable));
        assert!(err.is_fatal());
        assert_eq!(pipeline.state(), StreamState::Uninitialized);
        assert_eq!(pipeline.frames_seen(), 0);
    }

    #[test]
    fn test_ingest_names_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path(), 1, 1, None);
        let mut bytes = Vector::<u8>::new();
        imgcodecs::imencode(".png", &gray_frame(30), &mut bytes, &Vector::new()).unwrap();

        let named = pipeline
            .ingest(
                &bytes.to_vec(),
                &FrameMetadata {
                    filename: Some("hive 2.png".into()),
                    timestamp: Some("2024-07-01T12:30:00".into()),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(named.filename, "hive_2.png");
        assert_eq!(named.timestamp.to_string(), "2024-07-01 12:30:00");

        let anonymous = pipeline
            .ingest(&bytes.to_vec(), &FrameMetadata::default())
            .unwrap()
            .unwrap();
        assert!(anonymous.filename.starts_with("image_000002_"));

        let err = pipeline.ingest(b"garbage", &FrameMetadata::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_artifacts_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path().join("out")).unwrap();
        let points = vec![[0, 0], [19, 0], [19, 19], [0, 19]];
        let mut pipeline = pipeline(dir.path(), 2, 1, Some(points)).with_artifacts(writer);
        let frame = gray_frame(20);
        pipeline.ingest_frame(&frame, "a.jpg", ts()).unwrap();
        pipeline.ingest_frame(&frame, "b.jpg", ts()).unwrap();

        let out = dir.path().join("out");
        assert!(out.join("region_mask.png").exists());
        assert!(out.join("cropped_a.jpg").exists());
        assert!(out.join("background_2.jpg").exists());
        assert!(out.join("bee_mask_b.jpg").exists());
        assert!(out.join("visualization_b.jpg").exists());
    }

    #[test]
    fn test_frame_missing_the_polygon_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let points = vec![[20, 20], [39, 20], [39, 39], [20, 39]];
        let mut pipeline = pipeline(dir.path(), 2, 1, Some(points));
        let frame = gray_frame(40);
        pipeline.ingest_frame(&frame, "a.jpg", ts()).unwrap();
        pipeline.ingest_frame(&frame, "b.jpg", ts()).unwrap();
        assert_eq!(pipeline.state(), StreamState::Ready);

        let err = pipeline.ingest_frame(&gray_frame(10), "thumb.jpg", ts()).unwrap_err();
        assert!(matches!(err, PipelineError::Region(RegionError::OutsideFrame { .. })));
        assert!(!err.is_fatal());
        assert_eq!(pipeline.frames_seen(), 2);

        assert!(pipeline.ingest_frame(&frame, "c.jpg", ts()).unwrap().is_some());
    }

    #[test]
    fn test_rejected_size_is_kept_out_of_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.background.size = 2;
        config.region.pre_cropped = true;
        config.detection.on_dimension_mismatch = crate::analytics::MismatchPolicy::Reject;
        let source = RegionSource::new(None, RegionStore::new(dir.path().join("r.json")), None);
        let mut pipeline = StreamingPipeline::new(&config, source);

        let frame = gray_frame(40);
        pipeline.ingest_frame(&frame, "a.jpg", ts()).unwrap();
        pipeline.ingest_frame(&frame, "b.jpg", ts()).unwrap();

        let err = pipeline.ingest_frame(&gray_frame(30), "small.jpg", ts()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Detect(DetectError::DimensionMismatch { .. })
        ));
        assert!(!err.is_fatal());
        assert_eq!(pipeline.frames_seen(), 2);

        let next = pipeline.ingest_frame(&frame, "c.jpg", ts()).unwrap().unwrap();
        assert_eq!(next.coverage_percent, 0.0);
    }
}
