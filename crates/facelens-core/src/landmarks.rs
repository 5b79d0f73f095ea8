//! 68-point facial landmark regressor via ONNX Runtime, plus the mapping of
//! raw point sets onto named facial features.

use crate::pixels::PixelArray;
use crate::types::{FaceLandmarks, FaceLocation, FacialFeature, Point};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: u32 = 112;
const LANDMARK_POINTS: usize = 68;
/// Crop side relative to the larger face box edge.
const LANDMARK_CROP_SCALE: f32 = 1.2;

// iBUG 300-W index ranges.
const CHIN: Range<usize> = 0..17;
const LEFT_EYEBROW: Range<usize> = 17..22;
const RIGHT_EYEBROW: Range<usize> = 22..27;
const NOSE_BRIDGE: Range<usize> = 27..31;
const NOSE_TIP: Range<usize> = 31..36;
const LEFT_EYE: Range<usize> = 36..42;
const RIGHT_EYE: Range<usize> = 42..48;
const TOP_LIP: [usize; 12] = [48, 49, 50, 51, 52, 53, 54, 64, 63, 62, 61, 60];
const BOTTOM_LIP: [usize; 12] = [54, 55, 56, 57, 58, 59, 48, 60, 67, 66, 65, 64];
const NOSE_TIP_CENTER: usize = 30;
const MOUTH_LEFT: usize = 48;
const MOUTH_RIGHT: usize = 54;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Square crop region in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CropWindow {
    x0: f32,
    y0: f32,
    side: f32,
}

impl CropWindow {
    fn around(location: &FaceLocation) -> Self {
        let cx = (location.left + location.right) as f32 / 2.0;
        let cy = (location.top + location.bottom) as f32 / 2.0;
        let side = (location.width().max(location.height()).max(1) as f32) * LANDMARK_CROP_SCALE;
        Self {
            x0: cx - side / 2.0,
            y0: cy - side / 2.0,
            side,
        }
    }

    /// Map a normalized [0, 1] crop coordinate back to the image.
    fn unmap(&self, u: f32, v: f32) -> (f32, f32) {
        (self.x0 + u * self.side, self.y0 + v * self.side)
    }
}

/// 68-point landmark regressor (112×112 RGB crop in, 136 normalized values out).
pub struct LandmarkRegressor {
    session: Session,
}

impl LandmarkRegressor {
    pub fn load(model_path: &str) -> Result<Self, LandmarkError> {
        if !Path::new(model_path).exists() {
            return Err(LandmarkError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded 68-point landmark model"
        );

        Ok(Self { session })
    }

    /// Predict 68 points for the face inside `location`.
    pub fn predict(
        &mut self,
        image: &PixelArray,
        location: &FaceLocation,
    ) -> Result<Vec<(f32, f32)>, LandmarkError> {
        let window = CropWindow::around(location);
        let crop = crop_square(&image.to_rgb_image(), &window);
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        if raw.len() != LANDMARK_POINTS * 2 {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {} values, got {}",
                LANDMARK_POINTS * 2,
                raw.len()
            )));
        }

        Ok(raw
            .chunks_exact(2)
            .map(|uv| window.unmap(uv[0], uv[1]))
            .collect())
    }
}

/// Cut a square window out of `rgb` (black outside the image) and resize it
/// to the regressor input.
fn crop_square(rgb: &RgbImage, window: &CropWindow) -> RgbImage {
    let side = window.side.round().max(1.0) as u32;
    let mut canvas = RgbImage::new(side, side);
    imageops::overlay(
        &mut canvas,
        rgb,
        -(window.x0.round() as i64),
        -(window.y0.round() as i64),
    );
    imageops::resize(&canvas, LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE, FilterType::Triangle)
}

fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = LANDMARK_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = px[c] as f32 / 255.0;
        }
    }
    tensor
}

fn collect(points: &[(f32, f32)], indices: impl IntoIterator<Item = usize>) -> Vec<Point> {
    indices
        .into_iter()
        .filter_map(|i| points.get(i).copied())
        .map(Point::from_f32)
        .collect()
}

/// Group a 68-point set into named features.
pub fn from_68_points(points: &[(f32, f32)]) -> FaceLandmarks {
    let mut lm = FaceLandmarks::new();
    lm.insert(FacialFeature::Chin, collect(points, CHIN));
    lm.insert(FacialFeature::LeftEyebrow, collect(points, LEFT_EYEBROW));
    lm.insert(FacialFeature::RightEyebrow, collect(points, RIGHT_EYEBROW));
    lm.insert(FacialFeature::NoseBridge, collect(points, NOSE_BRIDGE));
    lm.insert(FacialFeature::NoseTip, collect(points, NOSE_TIP));
    lm.insert(FacialFeature::LeftEye, collect(points, LEFT_EYE));
    lm.insert(FacialFeature::RightEye, collect(points, RIGHT_EYE));
    lm.insert(FacialFeature::TopLip, collect(points, TOP_LIP));
    lm.insert(FacialFeature::BottomLip, collect(points, BOTTOM_LIP));
    lm
}

/// Group five keypoints [left_eye, right_eye, nose, left_mouth, right_mouth]
/// into named features. The mouth corners are reported under `top_lip`.
pub fn from_5_points(kps: &[(f32, f32); 5]) -> FaceLandmarks {
    let mut lm = FaceLandmarks::new();
    lm.insert(FacialFeature::LeftEye, vec![Point::from_f32(kps[0])]);
    lm.insert(FacialFeature::RightEye, vec![Point::from_f32(kps[1])]);
    lm.insert(FacialFeature::NoseTip, vec![Point::from_f32(kps[2])]);
    lm.insert(
        FacialFeature::TopLip,
        vec![Point::from_f32(kps[3]), Point::from_f32(kps[4])],
    );
    lm
}

fn mean(points: &[(f32, f32)], range: Range<usize>) -> (f32, f32) {
    let n = range.len() as f32;
    let (sx, sy) = points[range]
        .iter()
        .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
    (sx / n, sy / n)
}

/// Reduce a 68-point set to the five alignment keypoints.
pub fn five_from_68(points: &[(f32, f32)]) -> Option<[(f32, f32); 5]> {
    if points.len() < LANDMARK_POINTS {
        return None;
    }
    Some([
        mean(points, LEFT_EYE),
        mean(points, RIGHT_EYE),
        points[NOSE_TIP_CENTER],
        points[MOUTH_LEFT],
        points[MOUTH_RIGHT],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn indexed_points() -> Vec<(f32, f32)> {
        (0..68).map(|i| (i as f32, 0.0)).collect()
    }

    #[test]
    fn test_68_point_feature_sizes() {
        let lm = from_68_points(&indexed_points());
        assert_eq!(lm.get(FacialFeature::Chin).unwrap().len(), 17);
        assert_eq!(lm.get(FacialFeature::LeftEyebrow).unwrap().len(), 5);
        assert_eq!(lm.get(FacialFeature::NoseBridge).unwrap().len(), 4);
        assert_eq!(lm.get(FacialFeature::NoseTip).unwrap().len(), 5);
        assert_eq!(lm.get(FacialFeature::LeftEye).unwrap().len(), 6);
        assert_eq!(lm.get(FacialFeature::TopLip).unwrap().len(), 12);
        assert_eq!(lm.get(FacialFeature::BottomLip).unwrap().len(), 12);
        assert_eq!(lm.points().count(), 17 + 5 + 5 + 4 + 5 + 6 + 6 + 12 + 12);
    }

    #[test]
    fn test_68_point_lip_order() {
        let lm = from_68_points(&indexed_points());
        let top: Vec<i32> = lm.get(FacialFeature::TopLip).unwrap().iter().map(|p| p.x).collect();
        assert_eq!(top, vec![48, 49, 50, 51, 52, 53, 54, 64, 63, 62, 61, 60]);
    }

    #[test]
    fn test_5_point_features() {
        let kps = [(1.0, 1.0), (2.0, 1.0), (1.5, 2.0), (1.2, 3.0), (1.8, 3.0)];
        let lm = from_5_points(&kps);
        assert_eq!(lm.get(FacialFeature::LeftEye).unwrap(), &[Point::new(1, 1)]);
        assert_eq!(lm.get(FacialFeature::TopLip).unwrap().len(), 2);
        assert!(lm.get(FacialFeature::Chin).is_none());
        assert_eq!(lm.points().count(), 5);
    }

    #[test]
    fn test_five_from_68_eye_centers() {
        let points = indexed_points();
        let five = five_from_68(&points).unwrap();
        assert!((five[0].0 - 38.5).abs() < 1e-6); // mean of 36..42
        assert!((five[1].0 - 44.5).abs() < 1e-6); // mean of 42..48
        assert_eq!(five[2].0, 30.0);
        assert_eq!(five[3].0, 48.0);
        assert_eq!(five[4].0, 54.0);
        assert!(five_from_68(&points[..10]).is_none());
    }

    #[test]
    fn test_crop_window_unmap() {
        let loc = FaceLocation::new(100, 200, 200, 100);
        let window = CropWindow::around(&loc);
        assert!((window.side - 120.0).abs() < 1e-6);
        let (x, y) = window.unmap(0.5, 0.5);
        assert!((x - 150.0).abs() < 1e-4);
        assert!((y - 150.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_square_pads_outside_with_black() {
        let rgb = RgbImage::from_pixel(50, 50, Rgb([200, 200, 200]));
        let window = CropWindow { x0: -50.0, y0: 0.0, side: 100.0 };
        let crop = crop_square(&rgb, &window);
        assert_eq!(crop.dimensions(), (LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE));
        assert_eq!(crop.get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(crop.get_pixel(70, 20), &Rgb([200, 200, 200]));
    }
}
