use opencv::core::{self, Mat, Point, Rect, Scalar, Vector, CV_8UC1};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("polygon lies outside the {width}x{height} frame")]
    OutsideFrame { width: i32, height: i32 },
    #[error("opencv error: {0}")]
    Cv(#[from] opencv::Error),
}

/// Observation polygon at the hive entrance, in raw frame coordinates.
///
/// Built once and shared read-only afterwards. Serializes as a plain list of
/// `[x, y]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[i32; 2]>", into = "Vec<[i32; 2]>")]
pub struct Region {
    points: Vec<[i32; 2]>,
    area: f64,
}

impl Region {
    pub fn new(points: Vec<[i32; 2]>) -> Result<Self, RegionError> {
        if points.len() < 3 {
            return Err(RegionError::InvalidRegion(format!(
                "polygon needs at least 3 points, got {}",
                points.len()
            )));
        }

        let area = polygon_area(&points);
        if area < 1.0 {
            return Err(RegionError::InvalidRegion(
                "polygon is degenerate (zero area)".into(),
            ));
        }

        Ok(Self { points, area })
    }

    pub fn points(&self) -> &[[i32; 2]] {
        &self.points
    }

    /// Mathematical polygon area, used as the denominator for coverage.
    pub fn valid_area_pixels(&self) -> u64 {
        self.area.round() as u64
    }

    fn contour(&self) -> Vector<Point> {
        self.points.iter().map(|&[x, y]| Point::new(x, y)).collect()
    }

    fn bounding_rect(&self) -> Rect {
        let min_x = self.points.iter().map(|p| p[0]).min().unwrap_or(0);
        let max_x = self.points.iter().map(|p| p[0]).max().unwrap_or(0);
        let min_y = self.points.iter().map(|p| p[1]).min().unwrap_or(0);
        let max_y = self.points.iter().map(|p| p[1]).max().unwrap_or(0);
        Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
    }
}

impl TryFrom<Vec<[i32; 2]>> for Region {
    type Error = RegionError;

    fn try_from(points: Vec<[i32; 2]>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<Region> for Vec<[i32; 2]> {
    fn from(region: Region) -> Self {
        region.points
    }
}

fn polygon_area(points: &[[i32; 2]]) -> f64 {
    let n = points.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let [x0, y0] = points[i];
            let [x1, y1] = points[(i + 1) % n];
            x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64
        })
        .sum();
    twice.abs() as f64 / 2.0
}

pub struct CroppedFrame {
    pub image: Mat,
    /// Valid-area mask; `None` in pass-through mode.
    pub mask: Option<Mat>,
}

/// Masks out everything outside the region and crops to its bounding box.
/// Without a region the frame passes through untouched.
pub fn crop_to_region(frame: &Mat, region: Option<&Region>) -> Result<CroppedFrame, RegionError> {
    let Some(region) = region else {
        return Ok(CroppedFrame {
            image: frame.try_clone()?,
            mask: None,
        });
    };

    let rows = frame.rows();
    let cols = frame.cols();

    let mut mask = Mat::zeros(rows, cols, CV_8UC1)?.to_mat()?;
    let polygons: Vector<Vector<Point>> = Vector::from_iter([region.contour()]);
    imgproc::fill_poly_def(&mut mask, &polygons, Scalar::all(255.0))?;

    let mut masked = Mat::default();
    core::bitwise_and(frame, frame, &mut masked, &mask)?;

    let bounds = clip_rect(region.bounding_rect(), cols, rows).ok_or(RegionError::OutsideFrame {
        width: cols,
        height: rows,
    })?;

    let image = Mat::roi(&masked, bounds)?.try_clone()?;
    let mask = Mat::roi(&mask, bounds)?.try_clone()?;

    Ok(CroppedFrame {
        image,
        mask: Some(mask),
    })
}

fn clip_rect(rect: Rect, cols: i32, rows: i32) -> Option<Rect> {
    let x0 = rect.x.max(0);
    let y0 = rect.y.max(0);
    let x1 = (rect.x + rect.width).min(cols);
    let y1 = (rect.y + rect.height).min(rows);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
}

/// Counts non-black pixels; approximates the valid area of frames that were
/// cropped upstream.
pub fn count_valid_pixels(image: &Mat) -> opencv::Result<u64> {
    let gray = grayscale(image)?;
    Ok(core::count_non_zero(&gray)? as u64)
}

pub(crate) fn grayscale(image: &Mat) -> opencv::Result<Mat> {
    let code = match image.channels() {
        1 => return image.try_clone(),
        4 => imgproc::COLOR_BGRA2GRAY,
        _ => imgproc::COLOR_BGR2GRAY,
    };
    let mut gray = Mat::default();
    imgproc::cvt_color_def(image, &mut gray, code)?;
    Ok(gray)
}

pub(crate) fn bgr(image: &Mat) -> opencv::Result<Mat> {
    let code = match image.channels() {
        3 => return image.try_clone(),
        4 => imgproc::COLOR_BGRA2BGR,
        _ => imgproc::COLOR_GRAY2BGR,
    };
    let mut out = Mat::default();
    imgproc::cvt_color_def(image, &mut out, code)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC3;

    fn solid(rows: i32, cols: i32, value: f64) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(value)).unwrap()
    }

    #[test]
    fn test_region_needs_three_points() {
        assert!(matches!(
            Region::new(vec![[0, 0], [10, 10]]),
            Err(RegionError::InvalidRegion(_))
        ));
    }

    #[test]
    fn test_degenerate_region_is_rejected() {
        let collinear = vec![[0, 0], [5, 5], [10, 10]];
        assert!(matches!(
            Region::new(collinear),
            Err(RegionError::InvalidRegion(_))
        ));
    }

    #[test]
    fn test_polygon_area() {
        let square = Region::new(vec![[0, 0], [10, 0], [10, 10], [0, 10]]).unwrap();
        assert_eq!(square.valid_area_pixels(), 100);

        let triangle = Region::new(vec![[0, 0], [20, 0], [0, 10]]).unwrap();
        assert_eq!(triangle.valid_area_pixels(), 100);
    }

    #[test]
    fn test_region_serde_round_trip_validates() {
        let region: Region = serde_json::from_str("[[1,1],[30,1],[30,20]]").unwrap();
        assert_eq!(region.points().len(), 3);
        assert_eq!(serde_json::to_string(&region).unwrap(), "[[1,1],[30,1],[30,20]]");

        assert!(serde_json::from_str::<Region>("[[1,1],[30,1]]").is_err());
    }

    #[test]
    fn test_pass_through_without_region() {
        let frame = solid(40, 60, 77.0);
        let cropped = crop_to_region(&frame, None).unwrap();
        assert!(cropped.mask.is_none());
        assert_eq!(cropped.image.rows(), 40);
        assert_eq!(cropped.image.cols(), 60);
        assert_eq!(count_valid_pixels(&cropped.image).unwrap(), 2400);
    }

    #[test]
    fn test_crop_masks_and_trims_to_bounds() {
        let frame = solid(100, 100, 200.0);
        let region = Region::new(vec![[10, 20], [59, 20], [59, 69], [10, 69]]).unwrap();

        let cropped = crop_to_region(&frame, Some(&region)).unwrap();
        assert_eq!(cropped.image.cols(), 50);
        assert_eq!(cropped.image.rows(), 50);

        let mask = cropped.mask.unwrap();
        assert_eq!(core::count_non_zero(&mask).unwrap(), 2500);
        assert_eq!(count_valid_pixels(&cropped.image).unwrap(), 2500);
    }

    #[test]
    fn test_triangle_crop_zeroes_outside() {
        let frame = solid(50, 50, 120.0);
        let region = Region::new(vec![[0, 0], [49, 0], [0, 49]]).unwrap();

        let cropped = crop_to_region(&frame, Some(&region)).unwrap();
        let valid = count_valid_pixels(&cropped.image).unwrap();
        assert!(valid < 2500);
        assert!(valid > 1200);

        let corner = cropped.image.at_2d::<core::Vec3b>(49, 49).unwrap();
        assert_eq!(corner[0], 0);
    }

    #[test]
    fn test_region_outside_frame() {
        let frame = solid(20, 20, 10.0);
        let region = Region::new(vec![[100, 100], [150, 100], [150, 150]]).unwrap();
        assert!(matches!(
            crop_to_region(&frame, Some(&region)),
            Err(RegionError::OutsideFrame {
                width: 20,
                height: 20
            })
        ));
    }
}
