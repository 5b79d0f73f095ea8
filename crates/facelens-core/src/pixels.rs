//! Pixel arrays and image normalization into one canonical (height, width, 3) array.
//!
//! Every public operation resolves its input through [`normalize`] exactly
//! once. Arrays pass through borrowed; decoded images are converted to RGB.

use crate::error::FaceError;
use image::{DynamicImage, GrayImage, Luma, RgbImage};
use ndarray::{s, Array3, ArrayView3, ArrayViewMut3};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;

const CHANNELS: usize = 3;

// BT.601 luma weights, same as the usual BGR→GRAY conversion.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

/// Channel order of a pixel triple.
///
/// Decoded uploads arrive as RGB, camera frames as BGR. Callers must keep
/// track of which one they hold; the tag travels with the array so they can.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Dense 8-bit pixel array with shape (height, width, 3).
#[derive(Debug, Clone, PartialEq)]
pub struct PixelArray {
    data: Array3<u8>,
    order: ChannelOrder,
}

impl PixelArray {
    /// Wrap a row-major interleaved buffer of `width * height * 3` bytes.
    pub fn from_raw(
        width: u32,
        height: u32,
        order: ChannelOrder,
        bytes: Vec<u8>,
    ) -> Result<Self, FaceError> {
        let expected = width as usize * height as usize * CHANNELS;
        let actual = bytes.len();
        if actual != expected {
            return Err(FaceError::InvalidDimensions { expected, actual });
        }
        let data = Array3::from_shape_vec((height as usize, width as usize, CHANNELS), bytes)
            .map_err(|_| FaceError::InvalidDimensions { expected, actual })?;
        Ok(Self { data, order })
    }

    /// Wrap an existing array. The last axis must have length 3.
    pub fn from_array(data: Array3<u8>, order: ChannelOrder) -> Result<Self, FaceError> {
        let (h, w, c) = data.dim();
        if c != CHANNELS {
            return Err(FaceError::InvalidDimensions {
                expected: h * w * CHANNELS,
                actual: data.len(),
            });
        }
        Ok(Self { data, order })
    }

    /// Solid-colored array, mostly useful for tests and placeholders.
    pub fn filled(width: u32, height: u32, order: ChannelOrder, pixel: [u8; 3]) -> Self {
        let data = Array3::from_shape_fn((height as usize, width as usize, CHANNELS), |(_, _, c)| {
            pixel[c]
        });
        Self { data, order }
    }

    pub fn width(&self) -> u32 {
        self.data.dim().1 as u32
    }

    pub fn height(&self) -> u32 {
        self.data.dim().0 as u32
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn view(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut3<'_, u8> {
        self.data.view_mut()
    }

    pub fn into_array(self) -> Array3<u8> {
        self.data
    }

    /// Raw triple at (x, y) in the array's own channel order.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let (x, y) = (x as usize, y as usize);
        [
            self.data[[y, x, 0]],
            self.data[[y, x, 1]],
            self.data[[y, x, 2]],
        ]
    }

    /// Row-major interleaved bytes, borrowed when the array is contiguous.
    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self.data.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(self.data.iter().copied().collect()),
        }
    }

    /// Copy of the rectangle starting at (x, y), clipped to the array bounds.
    pub fn crop(&self, x: i32, y: i32, width: u32, height: u32) -> PixelArray {
        let x0 = x.clamp(0, self.width() as i32) as usize;
        let y0 = y.clamp(0, self.height() as i32) as usize;
        let x1 = (x as i64 + width as i64).clamp(x0 as i64, self.width() as i64) as usize;
        let y1 = (y as i64 + height as i64).clamp(y0 as i64, self.height() as i64) as usize;
        PixelArray {
            data: self.data.slice(s![y0..y1, x0..x1, ..]).to_owned(),
            order: self.order,
        }
    }

    /// Return the same pixels in `order`, swapping the first and last channel if needed.
    pub fn with_order(&self, order: ChannelOrder) -> PixelArray {
        if order == self.order {
            return self.clone();
        }
        let mut data = self.data.as_standard_layout().into_owned();
        for mut px in data.lanes_mut(ndarray::Axis(2)) {
            px.swap(0, 2);
        }
        PixelArray { data, order }
    }

    /// Copy into an `RgbImage` buffer without touching channel order.
    ///
    /// This is the working copy the renderer draws on.
    pub(crate) fn to_buffer(&self) -> RgbImage {
        let bytes = self.as_bytes().into_owned();
        RgbImage::from_raw(self.width(), self.height(), bytes)
            .expect("pixel array length matches its dimensions")
    }

    /// Inverse of [`to_buffer`](Self::to_buffer).
    pub(crate) fn from_buffer(buffer: RgbImage, order: ChannelOrder) -> PixelArray {
        let (w, h) = buffer.dimensions();
        let data = Array3::from_shape_vec((h as usize, w as usize, CHANNELS), buffer.into_raw())
            .expect("RgbImage buffer matches its dimensions");
        PixelArray { data, order }
    }

    /// RGB image suitable for display or for models expecting RGB input.
    pub fn to_rgb_image(&self) -> RgbImage {
        self.with_order(ChannelOrder::Rgb).to_buffer()
    }

    /// Single-channel luma derivative, honoring the channel order.
    pub fn to_gray(&self) -> GrayImage {
        let (r_idx, b_idx) = match self.order {
            ChannelOrder::Rgb => (0, 2),
            ChannelOrder::Bgr => (2, 0),
        };
        GrayImage::from_fn(self.width(), self.height(), |x, y| {
            let (x, y) = (x as usize, y as usize);
            let r = self.data[[y, x, r_idx]] as f32;
            let g = self.data[[y, x, 1]] as f32;
            let b = self.data[[y, x, b_idx]] as f32;
            let luma = LUMA_R * r + LUMA_G * g + LUMA_B * b;
            Luma([luma.round().clamp(0.0, 255.0) as u8])
        })
    }
}

impl From<RgbImage> for PixelArray {
    fn from(image: RgbImage) -> Self {
        PixelArray::from_buffer(image, ChannelOrder::Rgb)
    }
}

/// The two accepted input representations.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// A decoded, higher-level image (any color type the `image` crate supports).
    Decoded(DynamicImage),
    /// An already-normalized pixel array.
    Array(PixelArray),
}

impl ImageInput {
    /// Decode an image file from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FaceError> {
        Ok(ImageInput::Decoded(image::open(path)?))
    }

    /// Decode an in-memory encoded image (PNG, JPEG, ...).
    pub fn decode(bytes: &[u8]) -> Result<Self, FaceError> {
        Ok(ImageInput::Decoded(image::load_from_memory(bytes)?))
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(image: DynamicImage) -> Self {
        ImageInput::Decoded(image)
    }
}

impl From<PixelArray> for ImageInput {
    fn from(array: PixelArray) -> Self {
        ImageInput::Array(array)
    }
}

/// Resolve an input into the canonical pixel array.
///
/// Arrays are returned borrowed and untouched. Decoded images are converted
/// element-wise into an RGB array. An absent image is `InvalidInput`.
pub fn normalize(image: Option<&ImageInput>) -> Result<Cow<'_, PixelArray>, FaceError> {
    match image {
        None => Err(FaceError::InvalidInput),
        Some(ImageInput::Array(array)) => Ok(Cow::Borrowed(array)),
        Some(ImageInput::Decoded(decoded)) => Ok(Cow::Owned(PixelArray::from(decoded.to_rgb8()))),
    }
}
