//! Per-frame annotation for the live camera path.
//!
//! Each frame is handled on its own: cascade detection, outline, optional
//! JPEG re-encode. Nothing is carried from one frame to the next.

use crate::backend::RecognitionBackend;
use crate::error::FaceError;
use crate::facade::FaceService;
use crate::pixels::PixelArray;
use crate::render::{self, BoxStyle, OutputFormat};
use crate::types::FastFaceLocation;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// One annotated frame.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    /// Same channel order as the input frame.
    pub frame: PixelArray,
    pub faces: Vec<FastFaceLocation>,
}

pub struct FrameAnnotator<'a, B> {
    service: &'a FaceService<B>,
    style: BoxStyle,
    jpeg_quality: u8,
}

impl<'a, B: RecognitionBackend> FrameAnnotator<'a, B> {
    pub fn new(service: &'a FaceService<B>) -> Self {
        Self {
            service,
            style: BoxStyle::LIVE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_style(mut self, style: BoxStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Detect with the cascade and outline every face.
    pub fn annotate(&self, frame: &PixelArray) -> Result<AnnotatedFrame, FaceError> {
        let faces = self.service.locate_fast_in(frame)?;
        let annotated = render::draw_fast_boxes(frame, &faces, self.style, OutputFormat::Array)
            .into_array();
        Ok(AnnotatedFrame { frame: annotated, faces })
    }

    /// [`annotate`](Self::annotate), then encode as JPEG for the stream.
    pub fn annotate_to_jpeg(&self, frame: &PixelArray) -> Result<Vec<u8>, FaceError> {
        let annotated = self.annotate(frame)?;
        encode_jpeg(&annotated.frame, self.jpeg_quality)
    }
}

/// Encode a frame as JPEG, converting to RGB first.
pub fn encode_jpeg(frame: &PixelArray, quality: u8) -> Result<Vec<u8>, FaceError> {
    let rgb = frame.to_rgb_image();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}
