use crate::detector::DetectorError;
use crate::fast_detector::FastDetectorError;
use crate::landmarks::LandmarkError;
use crate::recognizer::RecognizerError;
use thiserror::Error;

/// Errors surfaced by the public facade and renderer.
///
/// `InvalidInput` and the encoding checks are raised by this crate. Every
/// other variant wraps a backend failure unchanged.
#[derive(Error, Debug)]
pub enum FaceError {
    #[error("image is absent, provide a valid image")]
    InvalidInput,
    #[error("pixel buffer does not match dimensions: expected {expected} bytes, got {actual}")]
    InvalidDimensions { expected: usize, actual: usize },
    #[error("face encoding is empty")]
    EmptyEncoding,
    #[error("face encodings differ in length: {expected} vs {actual}")]
    EncodingLengthMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    FastDetector(#[from] FastDetectorError),
    #[error(transparent)]
    Landmark(#[from] LandmarkError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}
