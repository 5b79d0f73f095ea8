//! Video frame type and YUYV to BGR conversion.

use facelens_core::{ChannelOrder, FaceError, PixelArray};

/// A captured color camera frame, packed BGR24.
#[derive(Clone)]
pub struct VideoFrame {
    /// BGR pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl VideoFrame {
    /// Wrap the frame as a BGR pixel array.
    pub fn to_pixel_array(&self) -> Result<PixelArray, FaceError> {
        PixelArray::from_raw(self.width, self.height, ChannelOrder::Bgr, self.data.clone())
    }

    pub fn into_pixel_array(self) -> Result<PixelArray, FaceError> {
        PixelArray::from_raw(self.width, self.height, ChannelOrder::Bgr, self.data)
    }
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// One BT.601 (studio swing) YUV sample to B, G, R.
#[inline]
fn yuv_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    [clamp_u8(b), clamp_u8(g), clamp_u8(r)]
}

/// Convert packed YUYV (4:2:2) to BGR24.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair.
pub fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut bgr = Vec::with_capacity(pixels * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        bgr.extend_from_slice(&yuv_to_bgr(y0, u, v));
        bgr.extend_from_slice(&yuv_to_bgr(y1, u, v));
    }
    Ok(bgr)
}

/// Replicate 8-bit grayscale into three identical channels.
pub fn grey_to_bgr(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    if gray.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: gray.len(),
        });
    }
    Ok(gray[..pixels].iter().flat_map(|&p| [p, p, p]).collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
