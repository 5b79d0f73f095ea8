//! Face detection, landmarks, encodings and annotation.
//!
//! Inputs are normalized once into a [`PixelArray`], handed to a
//! [`RecognitionBackend`] through the memoizing [`FaceService`], and drawn
//! back onto the image by the [`render`] functions. Detection and encoding
//! run on SCRFD and encoder networks via ONNX Runtime; the fast path uses the
//! SeetaFace cascade.

pub mod alignment;
pub mod backend;
pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod facade;
pub mod fast_detector;
pub mod landmarks;
pub mod live;
pub mod pixels;
pub mod recognizer;
pub mod render;
pub mod types;

pub use backend::{OnnxBackend, RecognitionBackend};
pub use cache::{CacheStats, FaceCache};
pub use config::{Config, ModelPaths};
pub use error::FaceError;
pub use facade::{
    Annotated, EncodeOptions, FaceService, LandmarkOptions, LocateOptions, RETRY_UPSAMPLE_COUNT,
};
pub use live::FrameAnnotator;
pub use pixels::{normalize, ChannelOrder, ImageInput, PixelArray};
pub use render::{BoxStyle, DotStyle, OutputFormat, Rendered};
pub use types::{
    Color, DetectionModel, FaceEncoding, FaceLandmarks, FaceLocation, FacialFeature,
    FastFaceLocation, LandmarkModel, Point, DEFAULT_TOLERANCE,
};
