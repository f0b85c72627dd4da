use std::fmt;

use chrono::NaiveDateTime;
use opencv::core::{self, Mat, Point, Scalar, Size, Vector, CV_8UC1};
use opencv::imgproc;
use opencv::prelude::*;
use serde::Deserialize;
use thiserror::Error;

use super::background::BackgroundModel;
use super::region::{bgr, count_valid_pixels, grayscale};

const COVERAGE_SCORE_CAP: f64 = 60.0;
const CONTOUR_SCORE_CAP: f64 = 20.0;
const CONTOUR_WEIGHT: f64 = 2.0;
const COLOR_FALLBACK_RATIO: f64 = 1.2;
const COLOR_FALLBACK_FLOOR: f64 = 3.0;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("frame is {frame_width}x{frame_height} but the reference is {reference_width}x{reference_height}")]
    DimensionMismatch {
        frame_width: i32,
        frame_height: i32,
        reference_width: i32,
        reference_height: i32,
    },
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
}

/// What to do when a frame and the reference disagree on size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Resize the frame to the reference's size.
    Resize,
    /// Fail with `DimensionMismatch`.
    Reject,
}

#[derive(Debug, Clone)]
pub struct DetectionParameters {
    pub thresholds: Vec<u8>,
    pub min_area: f64,
    pub max_area: f64,
    /// HSV lower bound (OpenCV hue scale, 0..180).
    pub color_lower: [u8; 3],
    pub color_upper: [u8; 3],
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub min_solidity: f64,
    pub on_dimension_mismatch: MismatchPolicy,
}

impl Default for DetectionParameters {
    fn default() -> Self {
        Self {
            thresholds: vec![10, 15, 20, 25, 30],
            min_area: 8.0,
            max_area: 12000.0,
            color_lower: [5, 20, 20],
            color_upper: [25, 255, 180],
            min_aspect_ratio: 0.2,
            max_aspect_ratio: 5.0,
            min_solidity: 0.2,
            on_dimension_mismatch: MismatchPolicy::Resize,
        }
    }
}

/// Denominator for coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidArea {
    /// Polygon area of the configured region.
    Fixed(u64),
    /// Count non-black pixels of each frame (frames cropped upstream).
    NonZeroPixels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    BackgroundSubtraction,
    ColorSegmentation,
}

impl DetectionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMethod::BackgroundSubtraction => "background_subtraction",
            DetectionMethod::ColorSegmentation => "color_segmentation",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdUsed {
    Fixed(u8),
    ColorBased,
}

impl fmt::Display for ThresholdUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdUsed::Fixed(t) => write!(f, "{t}"),
            ThresholdUsed::ColorBased => f.write_str("color_based"),
        }
    }
}

/// Output of one fixed-threshold pass.
pub struct DetectionCandidate {
    pub threshold: u8,
    pub mask: Mat,
    pub contours: Vector<Vector<Point>>,
    pub bee_area_pixels: u64,
    pub coverage_percent: f64,
    pub score: f64,
}

impl DetectionCandidate {
    pub fn contour_count(&self) -> usize {
        self.contours.len()
    }
}

pub struct DetectionResult {
    pub filename: String,
    pub timestamp: NaiveDateTime,
    pub bee_area_pixels: u64,
    pub total_area_pixels: u64,
    pub coverage_percent: f64,
    pub contour_count: usize,
    pub threshold_used: ThresholdUsed,
    pub detection_method: DetectionMethod,
    pub score: f64,
    pub mask: Mat,
    pub contours: Vector<Vector<Point>>,
}

struct ColorCandidate {
    mask: Mat,
    bee_area_pixels: u64,
    /// Unrounded; rounding happens only for the reported result.
    raw_percent: f64,
}

impl ColorCandidate {
    fn overrides(&self, diff_coverage: f64) -> bool {
        prefers_color(self.raw_percent, diff_coverage)
    }

    fn coverage_percent(&self) -> f64 {
        round_percent(self.raw_percent)
    }
}

/// Background-subtraction occupancy detector with a colour-segmentation
/// fallback for dense clusters.
pub struct OccupancyDetector {
    params: DetectionParameters,
    valid_area: ValidArea,
    background: BackgroundModel,
}

impl OccupancyDetector {
    pub fn new(
        background: BackgroundModel,
        valid_area: ValidArea,
        params: DetectionParameters,
    ) -> Self {
        Self {
            params,
            valid_area,
            background,
        }
    }

    pub fn background(&self) -> &BackgroundModel {
        &self.background
    }

    /// Swaps in a new reference. The previous model is dropped; taking
    /// `&mut self` keeps any `analyze` from observing a partial swap.
    pub fn update_background(&mut self, background: BackgroundModel) {
        let previous = std::mem::replace(&mut self.background, background);
        tracing::debug!(
            previous_version = previous.version(),
            previous_age = previous.age(),
            version = self.background.version(),
            "background reference replaced"
        );
    }

    pub fn detect_at_threshold(
        &self,
        frame: &Mat,
        threshold: u8,
        min_area: f64,
        max_area: f64,
    ) -> Result<(Mat, Vector<Vector<Point>>), DetectError> {
        let frame = self.reconcile(frame)?;
        let diff = self.difference(&frame)?;
        let otsu = otsu_mask(&diff)?;
        self.segment(&diff, &otsu, threshold, min_area, max_area)
    }

    pub fn analyze(
        &mut self,
        frame: &Mat,
        filename: &str,
        timestamp: NaiveDateTime,
    ) -> Result<DetectionResult, DetectError> {
        let frame = self.reconcile(frame)?;
        let total_area = self.total_area(&frame)?;

        let diff = self.difference(&frame)?;
        let otsu = otsu_mask(&diff)?;

        let mut best: Option<DetectionCandidate> = None;
        for &threshold in &self.params.thresholds {
            let (mask, contours) =
                self.segment(&diff, &otsu, threshold, self.params.min_area, self.params.max_area)?;
            let bee_area = (core::count_non_zero(&mask)? as u64).min(total_area);
            let coverage = coverage_percent(bee_area, total_area);
            let score = selection_score(coverage, contours.len());

            tracing::trace!(
                threshold,
                coverage,
                contours = contours.len(),
                score,
                "threshold candidate"
            );

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(DetectionCandidate {
                    threshold,
                    mask,
                    contours,
                    bee_area_pixels: bee_area,
                    coverage_percent: coverage,
                    score,
                });
            }
        }

        let primary = match best {
            Some(candidate) => candidate,
            None => DetectionCandidate {
                threshold: 0,
                mask: Mat::zeros(frame.rows(), frame.cols(), CV_8UC1)?.to_mat()?,
                contours: Vector::new(),
                bee_area_pixels: 0,
                coverage_percent: 0.0,
                score: 0.0,
            },
        };

        let color = self.color_candidate(&frame, total_area)?;
        self.background.touch();

        if color.overrides(primary.coverage_percent) {
            let contours = self.area_filtered_contours(&color.mask)?;
            tracing::debug!(
                filename,
                color_coverage = color.raw_percent,
                diff_coverage = primary.coverage_percent,
                "colour segmentation overrides background subtraction"
            );
            return Ok(DetectionResult {
                filename: filename.to_string(),
                timestamp,
                bee_area_pixels: color.bee_area_pixels,
                total_area_pixels: total_area,
                coverage_percent: color.coverage_percent(),
                contour_count: contours.len(),
                threshold_used: ThresholdUsed::ColorBased,
                detection_method: DetectionMethod::ColorSegmentation,
                score: primary.score,
                mask: color.mask,
                contours,
            });
        }

        Ok(DetectionResult {
            filename: filename.to_string(),
            timestamp,
            bee_area_pixels: primary.bee_area_pixels,
            total_area_pixels: total_area,
            coverage_percent: primary.coverage_percent,
            contour_count: primary.contour_count(),
            threshold_used: ThresholdUsed::Fixed(primary.threshold),
            detection_method: DetectionMethod::BackgroundSubtraction,
            score: primary.score,
            mask: primary.mask,
            contours: primary.contours,
        })
    }

    /// Applies the mismatch policy against the current reference size.
    pub fn reconcile(&self, frame: &Mat) -> Result<Mat, DetectError> {
        let reference = self.background.size()?;
        let size = frame.size()?;
        if size == reference {
            return Ok(frame.try_clone()?);
        }

        match self.params.on_dimension_mismatch {
            MismatchPolicy::Reject => Err(DetectError::DimensionMismatch {
                frame_width: size.width,
                frame_height: size.height,
                reference_width: reference.width,
                reference_height: reference.height,
            }),
            MismatchPolicy::Resize => {
                tracing::warn!(
                    frame = ?(size.width, size.height),
                    reference = ?(reference.width, reference.height),
                    "resizing frame to reference size"
                );
                let mut resized = Mat::default();
                imgproc::resize(frame, &mut resized, reference, 0.0, 0.0, imgproc::INTER_LINEAR)?;
                Ok(resized)
            }
        }
    }

    fn total_area(&self, frame: &Mat) -> Result<u64, DetectError> {
        match self.valid_area {
            ValidArea::Fixed(area) => Ok(area),
            ValidArea::NonZeroPixels => Ok(count_valid_pixels(frame)?),
        }
    }

    fn difference(&self, frame: &Mat) -> Result<Mat, DetectError> {
        let gray = grayscale(frame)?;
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&gray, &mut blurred, Size::new(3, 3), 0.0)?;

        let mut diff = Mat::default();
        core::absdiff(self.background.blurred_gray(), &blurred, &mut diff)?;
        Ok(diff)
    }

    fn segment(
        &self,
        diff: &Mat,
        otsu: &Mat,
        threshold: u8,
        min_area: f64,
        max_area: f64,
    ) -> Result<(Mat, Vector<Vector<Point>>), DetectError> {
        let mut fixed = Mat::default();
        imgproc::threshold(diff, &mut fixed, threshold as f64, 255.0, imgproc::THRESH_BINARY)?;

        let mut combined = Mat::default();
        core::bitwise_or_def(&fixed, otsu, &mut combined)?;

        let cleaned = open_close(&combined, 2, 3)?;
        let contours = external_contours(&cleaned)?;

        let mut kept = Vector::<Vector<Point>>::new();
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;
            if area < min_area || area > max_area {
                continue;
            }
            if self.is_bee_shaped(&contour, area)? {
                kept.push(contour);
            }
        }

        let mask = rasterize(&kept, diff.rows(), diff.cols())?;
        Ok((mask, kept))
    }

    fn is_bee_shaped(&self, contour: &Vector<Point>, area: f64) -> Result<bool, DetectError> {
        let rect = imgproc::bounding_rect(contour)?;
        if rect.height == 0 {
            return Ok(false);
        }
        let aspect_ratio = rect.width as f64 / rect.height as f64;

        let mut hull = Vector::<Point>::new();
        imgproc::convex_hull(contour, &mut hull, false, true)?;
        let hull_area = imgproc::contour_area(&hull, false)?;
        let solidity = if hull_area > 0.0 { area / hull_area } else { 0.0 };

        Ok(aspect_ratio >= self.params.min_aspect_ratio
            && aspect_ratio <= self.params.max_aspect_ratio
            && solidity > self.params.min_solidity)
    }

    fn color_candidate(&self, frame: &Mat, total_area: u64) -> Result<ColorCandidate, DetectError> {
        let bgr = bgr(frame)?;
        let mut hsv = Mat::default();
        imgproc::cvt_color_def(&bgr, &mut hsv, imgproc::COLOR_BGR2HSV)?;

        let [lh, ls, lv] = self.params.color_lower;
        let [uh, us, uv] = self.params.color_upper;
        let lower = Scalar::new(lh as f64, ls as f64, lv as f64, 0.0);
        let upper = Scalar::new(uh as f64, us as f64, uv as f64, 0.0);

        let mut raw = Mat::default();
        core::in_range(&hsv, &lower, &upper, &mut raw)?;
        let mask = open_close(&raw, 3, 3)?;

        let bee_area = (core::count_non_zero(&mask)? as u64).min(total_area);
        Ok(ColorCandidate {
            mask,
            bee_area_pixels: bee_area,
            raw_percent: raw_percent(bee_area, total_area),
        })
    }

    fn area_filtered_contours(&self, mask: &Mat) -> Result<Vector<Vector<Point>>, DetectError> {
        let contours = external_contours(mask)?;
        let mut kept = Vector::<Vector<Point>>::new();
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;
            if area >= self.params.min_area && area <= self.params.max_area {
                kept.push(contour);
            }
        }
        Ok(kept)
    }
}

fn otsu_mask(diff: &Mat) -> opencv::Result<Mat> {
    let mut otsu = Mat::default();
    imgproc::threshold(
        diff,
        &mut otsu,
        0.0,
        255.0,
        imgproc::THRESH_BINARY | imgproc::THRESH_OTSU,
    )?;
    Ok(otsu)
}

/// Opening with a `open_size` ellipse removes specks, closing with a
/// `close_size` ellipse merges fragments of one body.
fn open_close(mask: &Mat, open_size: i32, close_size: i32) -> opencv::Result<Mat> {
    let anchor = Point::new(-1, -1);
    let border = imgproc::morphology_default_border_value()?;

    let open_kernel = imgproc::get_structuring_element(
        imgproc::MORPH_ELLIPSE,
        Size::new(open_size, open_size),
        anchor,
    )?;
    let mut opened = Mat::default();
    imgproc::morphology_ex(
        mask,
        &mut opened,
        imgproc::MORPH_OPEN,
        &open_kernel,
        anchor,
        1,
        core::BORDER_CONSTANT,
        border,
    )?;

    let close_kernel = imgproc::get_structuring_element(
        imgproc::MORPH_ELLIPSE,
        Size::new(close_size, close_size),
        anchor,
    )?;
    let mut closed = Mat::default();
    imgproc::morphology_ex(
        &opened,
        &mut closed,
        imgproc::MORPH_CLOSE,
        &close_kernel,
        anchor,
        1,
        core::BORDER_CONSTANT,
        border,
    )?;

    Ok(closed)
}

fn external_contours(mask: &Mat) -> opencv::Result<Vector<Vector<Point>>> {
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;
    Ok(contours)
}

fn rasterize(contours: &Vector<Vector<Point>>, rows: i32, cols: i32) -> opencv::Result<Mat> {
    let mut mask = Mat::zeros(rows, cols, CV_8UC1)?.to_mat()?;
    if !contours.is_empty() {
        imgproc::fill_poly_def(&mut mask, contours, Scalar::all(255.0))?;
    }
    Ok(mask)
}

fn raw_percent(bee_area: u64, total_area: u64) -> f64 {
    if total_area == 0 {
        return 0.0;
    }
    100.0 * bee_area as f64 / total_area as f64
}

fn round_percent(percent: f64) -> f64 {
    (percent * 1000.0).round() / 1000.0
}

/// Share of the valid area, rounded to three decimals.
pub fn coverage_percent(bee_area: u64, total_area: u64) -> f64 {
    round_percent(raw_percent(bee_area, total_area))
}

/// Coverage capped at 60 plus twice the contour count capped at 20.
pub fn selection_score(coverage: f64, contour_count: usize) -> f64 {
    coverage.min(COVERAGE_SCORE_CAP) + (CONTOUR_WEIGHT * contour_count as f64).min(CONTOUR_SCORE_CAP)
}

/// Colour segmentation wins only when it beats the diff coverage by more than
/// 20% and clears an absolute 3% floor. Both comparisons are strict.
pub fn prefers_color(color_coverage: f64, diff_coverage: f64) -> bool {
    color_coverage > diff_coverage * COLOR_FALLBACK_RATIO && color_coverage > COLOR_FALLBACK_FLOOR
}
