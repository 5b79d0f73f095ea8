//! Annotation renderer: boxes and landmark dots drawn on a working copy.
//!
//! Colors are given in RGB and written in the array's own channel order, so
//! the same `Color` reads correctly on uploads and on BGR video frames.

use crate::pixels::PixelArray;
use crate::types::{Color, FaceLandmarks, FaceLocation, FastFaceLocation};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

/// Rectangle outline style. Thickness grows outward from the location edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxStyle {
    pub color: Color,
    pub thickness: u32,
}

impl BoxStyle {
    /// Style used for annotated video frames.
    pub const LIVE: BoxStyle = BoxStyle { color: Color::BLUE, thickness: 2 };
}

impl Default for BoxStyle {
    fn default() -> Self {
        Self { color: Color::GREEN, thickness: 3 }
    }
}

/// Landmark dot style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotStyle {
    pub color: Color,
    pub radius: i32,
}

impl DotStyle {
    /// Larger dots for the landmark view.
    pub const LANDMARK_VIEW: DotStyle = DotStyle { color: Color::GREEN, radius: 2 };
}

impl Default for DotStyle {
    fn default() -> Self {
        Self { color: Color::GREEN, radius: 1 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Display-ready image, RGB order.
    #[default]
    Image,
    /// Pixel array in the input's channel order.
    Array,
}

/// Renderer output in the requested format.
#[derive(Debug, Clone)]
pub enum Rendered {
    Image(DynamicImage),
    Array(PixelArray),
}

impl Rendered {
    fn from_array(array: PixelArray, format: OutputFormat) -> Self {
        match format {
            OutputFormat::Image => Rendered::Image(DynamicImage::ImageRgb8(array.to_rgb_image())),
            OutputFormat::Array => Rendered::Array(array),
        }
    }

    pub fn into_image(self) -> DynamicImage {
        match self {
            Rendered::Image(image) => image,
            Rendered::Array(array) => DynamicImage::ImageRgb8(array.to_rgb_image()),
        }
    }

    pub fn into_array(self) -> PixelArray {
        match self {
            Rendered::Image(image) => PixelArray::from(image.to_rgb8()),
            Rendered::Array(array) => array,
        }
    }
}

fn outline(canvas: &mut RgbImage, location: &FaceLocation, thickness: u32, color: Rgb<u8>) {
    let width = location.right.saturating_sub(location.left).saturating_add(1);
    let height = location.bottom.saturating_sub(location.top).saturating_add(1);
    if width <= 0 || height <= 0 {
        tracing::trace!(?location, "skipping degenerate location");
        return;
    }
    // Rings past the canvas span are fully clipped.
    let max_rings = canvas
        .width()
        .saturating_add(canvas.height())
        .clamp(1, i32::MAX as u32);
    let rings = thickness.clamp(1, max_rings) as i32;
    for i in 0..rings {
        let grow = i.saturating_mul(2);
        let rect = Rect::at(location.left.saturating_sub(i), location.top.saturating_sub(i))
            .of_size(width.saturating_add(grow) as u32, height.saturating_add(grow) as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

/// Draw one unfilled rectangle per location, from (left, top) to
/// (right, bottom) inclusive.
///
/// With no locations the input comes back unmodified in the requested format.
pub fn draw_bounding_boxes(
    image: &PixelArray,
    locations: &[FaceLocation],
    style: BoxStyle,
    format: OutputFormat,
) -> Rendered {
    if locations.is_empty() {
        return Rendered::from_array(image.clone(), format);
    }
    let order = image.order();
    let color = Rgb(style.color.in_order(order));
    let mut canvas = image.to_buffer();
    for location in locations {
        outline(&mut canvas, location, style.thickness, color);
    }
    Rendered::from_array(PixelArray::from_buffer(canvas, order), format)
}

/// [`draw_bounding_boxes`] for cascade results in (x, y, width, height) form.
pub fn draw_fast_boxes(
    image: &PixelArray,
    locations: &[FastFaceLocation],
    style: BoxStyle,
    format: OutputFormat,
) -> Rendered {
    let converted: Vec<FaceLocation> = locations.iter().map(|&l| FaceLocation::from(l)).collect();
    draw_bounding_boxes(image, &converted, style, format)
}

/// Draw a filled dot at every point of every feature of every face.
pub fn draw_landmarks(
    image: &PixelArray,
    landmarks: &[FaceLandmarks],
    style: DotStyle,
    format: OutputFormat,
) -> Rendered {
    if landmarks.iter().all(FaceLandmarks::is_empty) {
        return Rendered::from_array(image.clone(), format);
    }
    let order = image.order();
    let color = Rgb(style.color.in_order(order));
    let mut canvas = image.to_buffer();
    for point in landmarks.iter().flat_map(FaceLandmarks::points) {
        draw_filled_circle_mut(&mut canvas, (point.x, point.y), style.radius, color);
    }
    Rendered::from_array(PixelArray::from_buffer(canvas, order), format)
}
