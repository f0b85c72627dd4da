use ndarray::{Array4, ArrayView1, Axis};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use thiserror::Error;

use super::region::grayscale;

const BILATERAL_DIAMETER: i32 = 5;
const BILATERAL_SIGMA: f64 = 50.0;
const SMOOTH_KERNEL: i32 = 3;

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("no frames available to build a background")]
    EmptyFrameSet,
    #[error("frame {index} has type {found}, expected {expected}")]
    FrameType {
        index: usize,
        found: i32,
        expected: i32,
    },
    #[error("frame stack shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
}

/// Reference image of the empty hive entrance.
///
/// Replaced wholesale on every refresh; the blurred grayscale copy used for
/// diffing is computed once at construction.
pub struct BackgroundModel {
    image: Mat,
    gray: Mat,
    version: u64,
    age: u64,
}

impl BackgroundModel {
    pub fn new(image: Mat, version: u64) -> Result<Self, BackgroundError> {
        let gray = grayscale(&image)?;
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&gray, &mut blurred, Size::new(3, 3), 0.0)?;

        Ok(Self {
            image,
            gray: blurred,
            version,
            age: 0,
        })
    }

    pub fn blurred_gray(&self) -> &Mat {
        &self.gray
    }

    pub fn size(&self) -> opencv::Result<Size> {
        self.image.size()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Frames analysed against this reference since it was built.
    pub fn age(&self) -> u64 {
        self.age
    }

    pub(crate) fn touch(&mut self) {
        self.age += 1;
    }
}

/// Builds a reference image as the per-pixel median of `frames`, followed by
/// an edge-preserving bilateral pass and a light Gaussian blur.
///
/// Frames whose size differs from the first one are resized to match it.
pub fn build_background<'a, I>(frames: I) -> Result<Mat, BackgroundError>
where
    I: IntoIterator<Item = &'a Mat>,
{
    let frames: Vec<&Mat> = frames.into_iter().collect();
    let first = frames.first().ok_or(BackgroundError::EmptyFrameSet)?;

    let size = first.size()?;
    let typ = first.typ();
    let channels = first.channels() as usize;
    let rows = size.height as usize;
    let cols = size.width as usize;

    let mut data = Vec::with_capacity(frames.len() * rows * cols * channels);
    for (index, frame) in frames.iter().enumerate() {
        if frame.typ() != typ {
            return Err(BackgroundError::FrameType {
                index,
                found: frame.typ(),
                expected: typ,
            });
        }

        let normalized = if frame.size()? != size {
            let mut resized = Mat::default();
            imgproc::resize(
                *frame,
                &mut resized,
                size,
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;
            resized
        } else {
            frame.try_clone()?
        };
        data.extend_from_slice(normalized.data_bytes()?);
    }

    let stack = Array4::from_shape_vec((frames.len(), rows, cols, channels), data)?;
    let median = stack.map_axis(Axis(0), median_of);
    let median_bytes: Vec<u8> = median.iter().copied().collect();

    let median = Mat::from_slice(&median_bytes)?
        .reshape(channels as i32, rows as i32)?
        .try_clone()?;

    let mut smoothed = Mat::default();
    imgproc::bilateral_filter_def(
        &median,
        &mut smoothed,
        BILATERAL_DIAMETER,
        BILATERAL_SIGMA,
        BILATERAL_SIGMA,
    )?;

    let mut background = Mat::default();
    imgproc::gaussian_blur_def(
        &smoothed,
        &mut background,
        Size::new(SMOOTH_KERNEL, SMOOTH_KERNEL),
        0.0,
    )?;

    Ok(background)
}

fn median_of(lane: ArrayView1<u8>) -> u8 {
    let mut values = lane.to_vec();
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        ((values[mid - 1] as u16 + values[mid] as u16) / 2) as u8
    }
}
