//! Face encoder via ONNX Runtime.
//!
//! Extracts 128-dimensional face encodings from aligned 112×112 crops.
//! With jitter, the alignment is re-sampled several times under small random
//! perturbations and the resulting encodings are averaged.

use crate::alignment::{self, REFERENCE_LANDMARKS_112};
use crate::types::FaceEncoding;
use image::imageops;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ENCODER_INPUT_SIZE: usize = 112;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 127.5;
pub const ENCODING_DIM: usize = 128;
const ENCODER_MODEL_VERSION: &str = "face_encoder_128";

// Jitter ranges, applied to the reference landmarks.
const JITTER_SEED: u64 = 0x5eed_face;
const JITTER_MAX_ROTATION_RAD: f32 = 0.05;
const JITTER_MAX_SCALE: f32 = 0.05;
const JITTER_MAX_SHIFT_PX: f32 = 2.0;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// 128-dimensional face encoder.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the encoder ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face encoder model"
        );

        Ok(Self { session })
    }

    /// Encode one face given its five alignment keypoints.
    ///
    /// `jitter_count` ≤ 1 encodes the canonical alignment only. Larger values
    /// add `jitter_count - 1` perturbed alignments and average all of them.
    /// Perturbations are seeded, so equal inputs give equal encodings.
    pub fn encode(
        &mut self,
        rgb: &RgbImage,
        keypoints: &[(f32, f32); 5],
        jitter_count: u32,
    ) -> Result<FaceEncoding, RecognizerError> {
        let mut sum = vec![0.0f32; ENCODING_DIM];

        let canonical = alignment::align_face(rgb, keypoints);
        accumulate(&mut sum, &self.run(&canonical)?);

        let mut rng = StdRng::seed_from_u64(JITTER_SEED);
        let samples = jitter_count.max(1);
        for _ in 1..samples {
            let (target, flip) = jittered_reference(&mut rng);
            let mut crop = alignment::align_face_to(rgb, keypoints, &target);
            if flip {
                imageops::flip_horizontal_in_place(&mut crop);
            }
            accumulate(&mut sum, &self.run(&crop)?);
        }

        let n = samples as f32;
        let mean: Vec<f32> = sum.into_iter().map(|v| v / n).collect();

        Ok(FaceEncoding {
            values: l2_normalize(mean),
            model_version: Some(ENCODER_MODEL_VERSION.to_string()),
        })
    }

    fn run(&mut self, aligned: &RgbImage) -> Result<Vec<f32>, RecognizerError> {
        let input = preprocess(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("encoding extraction: {e}")))?;

        if raw.len() != ENCODING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ENCODING_DIM}-dim encoding, got {}",
                raw.len()
            )));
        }
        Ok(raw.to_vec())
    }
}

fn accumulate(sum: &mut [f32], values: &[f32]) {
    for (s, v) in sum.iter_mut().zip(values) {
        *s += v;
    }
}

fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|x| x / norm).collect()
    } else {
        values
    }
}

/// Reference landmarks under a random small similarity perturbation, plus
/// whether to mirror the crop.
fn jittered_reference(rng: &mut StdRng) -> ([(f32, f32); 5], bool) {
    let angle = rng.gen_range(-JITTER_MAX_ROTATION_RAD..=JITTER_MAX_ROTATION_RAD);
    let scale = 1.0 + rng.gen_range(-JITTER_MAX_SCALE..=JITTER_MAX_SCALE);
    let shift_x = rng.gen_range(-JITTER_MAX_SHIFT_PX..=JITTER_MAX_SHIFT_PX);
    let shift_y = rng.gen_range(-JITTER_MAX_SHIFT_PX..=JITTER_MAX_SHIFT_PX);
    let flip = rng.gen_bool(0.5);

    let c = ENCODER_INPUT_SIZE as f32 / 2.0;
    let (sin, cos) = angle.sin_cos();
    let target = REFERENCE_LANDMARKS_112.map(|(x, y)| {
        let (dx, dy) = (x - c, y - c);
        (
            c + scale * (cos * dx - sin * dy) + shift_x,
            c + scale * (sin * dx + cos * dy) + shift_y,
        )
    });
    (target, flip)
}

/// Aligned RGB crop → normalized NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ENCODER_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, px) in aligned.enumerate_pixels() {
        if x as usize >= size || y as usize >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::new(112, 112);
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ENCODER_INPUT_SIZE, ENCODER_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([128, 0, 255]));
        let tensor = preprocess(&aligned);
        let expected_r = (128.0 - ENCODER_MEAN) / ENCODER_STD;
        assert!((tensor[[0, 0, 3, 3]] - expected_r).abs() < 1e-6);
        assert!((tensor[[0, 1, 3, 3]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 3, 3]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_jitter_is_deterministic_and_small() {
        let mut a = StdRng::seed_from_u64(JITTER_SEED);
        let mut b = StdRng::seed_from_u64(JITTER_SEED);
        let (ta, fa) = jittered_reference(&mut a);
        let (tb, fb) = jittered_reference(&mut b);
        assert_eq!(ta, tb);
        assert_eq!(fa, fb);
        for ((x, y), (rx, ry)) in ta.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            assert!((x - rx).abs() < 6.0 && (y - ry).abs() < 6.0);
        }
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load("/nonexistent/encoder.onnx").err().unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
