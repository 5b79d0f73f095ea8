//! Cascade face detector backed by `rustface` (SeetaFace funnel cascade).
//!
//! Classical, CPU-only and much cheaper than the SCRFD networks. Always runs
//! on the luma derivative of the frame and reports (x, y, width, height).

use crate::pixels::PixelArray;
use crate::types::FastFaceLocation;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

const CASCADE_MIN_FACE_SIZE: u32 = 20;
const CASCADE_SCORE_THRESHOLD: f64 = 2.0;
const CASCADE_PYRAMID_SCALE: f32 = 0.8;
const CASCADE_WINDOW_STEP: u32 = 4;

#[derive(Error, Debug)]
pub enum FastDetectorError {
    #[error("cascade model not found: {0}")]
    ModelNotFound(String),
    #[error("failed to read cascade model {path}: {source}")]
    ModelLoad {
        path: String,
        source: std::io::Error,
    },
}

/// SeetaFace cascade detector.
pub struct CascadeDetector {
    model: rustface::Model,
}

impl CascadeDetector {
    /// Load a SeetaFace model file (`seeta_fd_frontal_v1.0.bin`).
    pub fn load(model_path: &str) -> Result<Self, FastDetectorError> {
        if !Path::new(model_path).exists() {
            return Err(FastDetectorError::ModelNotFound(model_path.to_string()));
        }
        let file = File::open(model_path).map_err(|source| FastDetectorError::ModelLoad {
            path: model_path.to_string(),
            source,
        })?;
        let model = rustface::read_model(BufReader::new(file)).map_err(|source| {
            FastDetectorError::ModelLoad {
                path: model_path.to_string(),
                source,
            }
        })?;
        tracing::info!(path = model_path, "loaded SeetaFace cascade");
        Ok(Self { model })
    }

    /// Detect faces in the grayscale derivative of `image`.
    pub fn detect(&self, image: &PixelArray) -> Vec<FastFaceLocation> {
        if image.width() == 0 || image.height() == 0 {
            return Vec::new();
        }

        let gray = image.to_gray();
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(CASCADE_MIN_FACE_SIZE);
        detector.set_score_thresh(CASCADE_SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(CASCADE_PYRAMID_SCALE);
        detector.set_slide_window_step(CASCADE_WINDOW_STEP, CASCADE_WINDOW_STEP);

        let faces = detector.detect(&rustface::ImageData::new(
            gray.as_raw(),
            gray.width(),
            gray.height(),
        ));

        tracing::debug!(faces = faces.len(), "cascade detection done");

        faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                FastFaceLocation {
                    x: bbox.x(),
                    y: bbox.y(),
                    width: bbox.width() as i32,
                    height: bbox.height() as i32,
                }
            })
            .collect()
    }
}
