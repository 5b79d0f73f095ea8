//! Recognition backend: the pretrained models behind one trait.
//!
//! The facade only forwards parameters and memoizes; everything that touches
//! a model file lives behind [`RecognitionBackend`]. [`OnnxBackend`] loads
//! each model lazily on first use, so a missing heavy detector only matters
//! to callers that ask for it.

use crate::alignment::{ALIGNED_SIZE, REFERENCE_LANDMARKS_112};
use crate::config::ModelPaths;
use crate::detector::FaceDetector;
use crate::error::FaceError;
use crate::fast_detector::CascadeDetector;
use crate::landmarks::{self, LandmarkRegressor};
use crate::pixels::PixelArray;
use crate::recognizer::FaceRecognizer;
use crate::types::{
    BoundingBox, DetectionModel, FaceEncoding, FaceLandmarks, FaceLocation, FastFaceLocation,
    LandmarkModel,
};

/// Upsample count used when encodings or landmarks are requested without
/// known locations.
pub const IMPLICIT_UPSAMPLE_COUNT: u32 = 1;

/// Window around a known location searched for five-point keypoints,
/// relative to the location's size.
const KEYPOINT_SEARCH_SCALE: f32 = 1.5;

/// Five alignment keypoints: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Keypoints = [(f32, f32); 5];

/// The external recognition capability.
///
/// Implementations take the normalized array and return results in image
/// coordinates. Errors propagate to the caller unchanged.
pub trait RecognitionBackend: Send {
    fn face_locations(
        &mut self,
        image: &PixelArray,
        upsample_count: u32,
        model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, FaceError>;

    fn face_locations_fast(&mut self, image: &PixelArray)
        -> Result<Vec<FastFaceLocation>, FaceError>;

    fn face_landmarks(
        &mut self,
        image: &PixelArray,
        known_locations: Option<&[FaceLocation]>,
        model: LandmarkModel,
    ) -> Result<Vec<FaceLandmarks>, FaceError>;

    fn face_encodings(
        &mut self,
        image: &PixelArray,
        known_locations: Option<&[FaceLocation]>,
        jitter_count: u32,
        model: LandmarkModel,
    ) -> Result<Vec<FaceEncoding>, FaceError>;
}

/// Fill `slot` on first use.
fn lazy<T, E>(slot: &mut Option<T>, load: impl FnOnce() -> Result<T, E>) -> Result<&mut T, E> {
    let value = match slot.take() {
        Some(value) => value,
        None => load()?,
    };
    Ok(slot.insert(value))
}

/// SCRFD + landmark regressor + encoder via ONNX Runtime, cascade via rustface.
pub struct OnnxBackend {
    paths: ModelPaths,
    light_detector: Option<FaceDetector>,
    heavy_detector: Option<FaceDetector>,
    regressor: Option<LandmarkRegressor>,
    encoder: Option<FaceRecognizer>,
    cascade: Option<CascadeDetector>,
}

impl OnnxBackend {
    pub fn new(paths: ModelPaths) -> Self {
        Self {
            paths,
            light_detector: None,
            heavy_detector: None,
            regressor: None,
            encoder: None,
            cascade: None,
        }
    }

    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    fn detector(&mut self, model: DetectionModel) -> Result<&mut FaceDetector, FaceError> {
        let (slot, path) = match model {
            DetectionModel::Hog => (&mut self.light_detector, &self.paths.light_detector),
            DetectionModel::Cnn => (&mut self.heavy_detector, &self.paths.heavy_detector),
        };
        Ok(lazy(slot, || FaceDetector::load(path))?)
    }

    fn regressor(&mut self) -> Result<&mut LandmarkRegressor, FaceError> {
        let path = &self.paths.landmarks_68;
        Ok(lazy(&mut self.regressor, || LandmarkRegressor::load(path))?)
    }

    fn encoder(&mut self) -> Result<&mut FaceRecognizer, FaceError> {
        let path = &self.paths.encoder;
        Ok(lazy(&mut self.encoder, || FaceRecognizer::load(path))?)
    }

    fn cascade(&mut self) -> Result<&mut CascadeDetector, FaceError> {
        let path = &self.paths.cascade;
        Ok(lazy(&mut self.cascade, || CascadeDetector::load(path))?)
    }

    fn detect(
        &mut self,
        image: &PixelArray,
        upsample_count: u32,
        model: DetectionModel,
    ) -> Result<Vec<BoundingBox>, FaceError> {
        let boxes = self.detector(model)?.detect(image, upsample_count)?;
        tracing::debug!(model = %model, upsample_count, faces = boxes.len(), "detection done");
        Ok(boxes)
    }

    /// Locations plus, when the detector produced them, their keypoints.
    fn faces(
        &mut self,
        image: &PixelArray,
        known_locations: Option<&[FaceLocation]>,
    ) -> Result<Vec<(FaceLocation, Option<Keypoints>)>, FaceError> {
        match known_locations {
            Some(locations) => Ok(locations.iter().map(|l| (*l, None)).collect()),
            None => {
                let (w, h) = (image.width(), image.height());
                let boxes = self.detect(image, IMPLICIT_UPSAMPLE_COUNT, DetectionModel::Hog)?;
                Ok(boxes
                    .iter()
                    .map(|b| (b.to_location(w, h), b.landmarks))
                    .collect())
            }
        }
    }

    /// Five keypoints for a face at a known location.
    ///
    /// Runs the light detector on a window around the location and keeps the
    /// most confident face. If nothing is found the reference template is
    /// stretched over the location instead.
    fn keypoints_at(
        &mut self,
        image: &PixelArray,
        location: &FaceLocation,
    ) -> Result<Keypoints, FaceError> {
        let side_w = (location.width().max(1) as f32 * KEYPOINT_SEARCH_SCALE).round() as i32;
        let side_h = (location.height().max(1) as f32 * KEYPOINT_SEARCH_SCALE).round() as i32;
        let cx = (location.left + location.right) / 2;
        let cy = (location.top + location.bottom) / 2;
        let x0 = (cx - side_w / 2).max(0);
        let y0 = (cy - side_h / 2).max(0);
        let window = image.crop(x0, y0, side_w as u32, side_h as u32);

        let found = self
            .detect(&window, 0, DetectionModel::Hog)?
            .into_iter()
            .find_map(|b| b.landmarks);

        Ok(match found {
            Some(kps) => kps.map(|(x, y)| (x + x0 as f32, y + y0 as f32)),
            None => {
                tracing::debug!(?location, "no keypoints in window, using template");
                template_keypoints(location)
            }
        })
    }

    fn keypoints_for(
        &mut self,
        image: &PixelArray,
        location: &FaceLocation,
        detected: Option<Keypoints>,
        model: LandmarkModel,
    ) -> Result<Keypoints, FaceError> {
        match model {
            LandmarkModel::Large => {
                let points = self.regressor()?.predict(image, location)?;
                Ok(landmarks::five_from_68(&points).unwrap_or_else(|| template_keypoints(location)))
            }
            LandmarkModel::Small => match detected {
                Some(kps) => Ok(kps),
                None => self.keypoints_at(image, location),
            },
        }
    }
}

/// Reference keypoints scaled into `location`.
fn template_keypoints(location: &FaceLocation) -> Keypoints {
    let sx = location.width() as f32 / ALIGNED_SIZE as f32;
    let sy = location.height() as f32 / ALIGNED_SIZE as f32;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (location.left as f32 + x * sx, location.top as f32 + y * sy))
}

impl RecognitionBackend for OnnxBackend {
    fn face_locations(
        &mut self,
        image: &PixelArray,
        upsample_count: u32,
        model: DetectionModel,
    ) -> Result<Vec<FaceLocation>, FaceError> {
        let (w, h) = (image.width(), image.height());
        Ok(self
            .detect(image, upsample_count, model)?
            .iter()
            .map(|b| b.to_location(w, h))
            .collect())
    }

    fn face_locations_fast(
        &mut self,
        image: &PixelArray,
    ) -> Result<Vec<FastFaceLocation>, FaceError> {
        Ok(self.cascade()?.detect(image))
    }

    fn face_landmarks(
        &mut self,
        image: &PixelArray,
        known_locations: Option<&[FaceLocation]>,
        model: LandmarkModel,
    ) -> Result<Vec<FaceLandmarks>, FaceError> {
        let faces = self.faces(image, known_locations)?;
        let mut result = Vec::with_capacity(faces.len());
        for (location, detected) in faces {
            let landmarks = match model {
                LandmarkModel::Large => {
                    landmarks::from_68_points(&self.regressor()?.predict(image, &location)?)
                }
                LandmarkModel::Small => {
                    let kps = self.keypoints_for(image, &location, detected, model)?;
                    landmarks::from_5_points(&kps)
                }
            };
            result.push(landmarks);
        }
        Ok(result)
    }

    fn face_encodings(
        &mut self,
        image: &PixelArray,
        known_locations: Option<&[FaceLocation]>,
        jitter_count: u32,
        model: LandmarkModel,
    ) -> Result<Vec<FaceEncoding>, FaceError> {
        let faces = self.faces(image, known_locations)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        let rgb = image.to_rgb_image();
        let mut result = Vec::with_capacity(faces.len());
        for (location, detected) in faces {
            let kps = self.keypoints_for(image, &location, detected, model)?;
            result.push(self.encoder()?.encode(&rgb, &kps, jitter_count)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::fast_detector::FastDetectorError;
    use crate::pixels::ChannelOrder;
    use std::path::Path;

    fn missing_models() -> OnnxBackend {
        OnnxBackend::new(ModelPaths::in_dir(Path::new("/nonexistent/models")))
    }

    #[test]
    fn test_lazy_loads_once() {
        let mut slot: Option<u32> = None;
        let mut calls = 0;
        for _ in 0..3 {
            let v = lazy::<_, ()>(&mut slot, || {
                calls += 1;
                Ok(7)
            })
            .unwrap();
            assert_eq!(*v, 7);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_lazy_failure_leaves_slot_empty() {
        let mut slot: Option<u32> = None;
        assert!(lazy(&mut slot, || Err("boom")).is_err());
        assert!(slot.is_none());
    }

    #[test]
    fn test_missing_heavy_model_propagates() {
        let mut backend = missing_models();
        let image = PixelArray::filled(32, 32, ChannelOrder::Rgb, [0, 0, 0]);
        let err = backend.face_locations(&image, 1, DetectionModel::Cnn).unwrap_err();
        match err {
            FaceError::Detector(DetectorError::ModelNotFound(path)) => {
                assert!(path.ends_with("det_10g.onnx"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_cascade_propagates() {
        let mut backend = missing_models();
        let image = PixelArray::filled(32, 32, ChannelOrder::Bgr, [0, 0, 0]);
        let err = backend.face_locations_fast(&image).unwrap_err();
        assert!(matches!(err, FaceError::FastDetector(FastDetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_encodings_without_faces_skip_encoder() {
        let mut backend = missing_models();
        let image = PixelArray::filled(32, 32, ChannelOrder::Rgb, [0, 0, 0]);
        let encodings = backend
            .face_encodings(&image, Some(&[][..]), 1, LandmarkModel::Small)
            .unwrap();
        assert!(encodings.is_empty());
    }

    #[test]
    fn test_template_keypoints_inside_location() {
        let location = FaceLocation::new(10, 122, 122, 10);
        let kps = template_keypoints(&location);
        for (x, y) in kps {
            assert!((10.0..=122.0).contains(&x));
            assert!((10.0..=122.0).contains(&y));
        }
        // Left eye left of right eye, mouth below eyes.
        assert!(kps[0].0 < kps[1].0);
        assert!(kps[3].1 > kps[0].1);
    }
}
