//! V4L2 camera capture for the live annotation path.
//!
//! Negotiates YUYV and hands out packed BGR frames that convert directly
//! into `facelens_core::PixelArray`.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{FrameError, VideoFrame};
