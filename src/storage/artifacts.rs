use std::path::PathBuf;

use opencv::core::{self, Mat, Point, Scalar, Vector};
use opencv::imgcodecs;
use opencv::imgproc;
use opencv::prelude::*;

use crate::analytics::DetectionResult;

const OVERLAY_WEIGHT: f64 = 0.3;

/// Writes debugging images next to the stream. Failures are logged and
/// never reach the detection path.
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Polygon mask over the cropped frame, written once per stream.
    pub fn save_region_mask(&self, mask: &Mat) {
        self.write("region_mask.png", mask);
    }

    pub fn save_cropped(&self, filename: &str, image: &Mat) {
        self.write(&format!("cropped_{filename}"), image);
    }

    pub fn save_background(&self, frame_index: u64, background: &Mat) {
        self.write(&format!("background_{frame_index}.jpg"), background);
    }

    pub fn save_result(&self, frame: &Mat, result: &DetectionResult) {
        self.write(&format!("bee_mask_{}", result.filename), &result.mask);

        match visualize(frame, &result.mask, &result.contours) {
            Ok(vis) => self.write(&format!("visualization_{}", result.filename), &vis),
            Err(e) => tracing::warn!(
                filename = %result.filename,
                error = %e,
                "failed to render visualization"
            ),
        }
    }

    fn write(&self, name: &str, image: &Mat) {
        let path = self.dir.join(name);
        let Some(path_str) = path.to_str() else {
            tracing::warn!(path = %path.display(), "artifact path is not valid utf-8");
            return;
        };

        match imgcodecs::imwrite(path_str, image, &Vector::new()) {
            Ok(true) => tracing::trace!(path = %path.display(), "wrote artifact"),
            Ok(false) => tracing::warn!(path = %path.display(), "encoder refused artifact"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write artifact"),
        }
    }
}

/// Mask blended in red over the frame with contour outlines in green.
pub fn visualize(frame: &Mat, mask: &Mat, contours: &Vector<Vector<Point>>) -> opencv::Result<Mat> {
    let base = if frame.channels() == 3 {
        frame.try_clone()?
    } else {
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(frame, &mut bgr, imgproc::COLOR_GRAY2BGR)?;
        bgr
    };

    let zeros = Mat::zeros(mask.rows(), mask.cols(), core::CV_8UC1)?.to_mat()?;
    let mut planes = Vector::<Mat>::new();
    planes.push(zeros.try_clone()?);
    planes.push(zeros);
    planes.push(mask.try_clone()?);
    let mut red = Mat::default();
    core::merge(&planes, &mut red)?;

    let mut vis = Mat::default();
    core::add_weighted(&base, 1.0 - OVERLAY_WEIGHT, &red, OVERLAY_WEIGHT, 0.0, &mut vis, -1)?;

    if !contours.is_empty() {
        imgproc::draw_contours(
            &mut vis,
            contours,
            -1,
            Scalar::new(0.0, 255.0, 0.0, 0.0),
            2,
            imgproc::LINE_8,
            &core::no_array(),
            i32::MAX,
            Point::new(0, 0),
        )?;
    }

    Ok(vis)
}
