//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, VideoFrame};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::{Metadata, Type as BufType};
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const MAX_PROBED_DEVICES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, converted to BGR.
    Yuyv,
    /// 8-bit grayscale, replicated into three channels.
    Grey,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    fn to_bgr(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_bgr(buf, width, height),
            PixelFormat::Grey => frame::grey_to_bgr(buf, width, height),
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

fn open_device(device_path: &str) -> Result<Device, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }
    Device::with_path(device_path).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("busy") || msg.contains("EBUSY") {
            CameraError::DeviceBusy
        } else {
            CameraError::DeviceNotFound(format!("{device_path}: {e}"))
        }
    })
}

/// Ask for 640x480 YUYV and return whatever the driver settled on.
fn negotiate(device: &Device) -> Result<Format, CameraError> {
    let failed = |what: &str, e: std::io::Error| {
        CameraError::FormatNegotiationFailed(format!("failed to {what} format: {e}"))
    };
    let mut wanted = device.format().map_err(|e| failed("get", e))?;
    wanted.fourcc = FourCC::new(b"YUYV");
    wanted.width = CAPTURE_WIDTH;
    wanted.height = CAPTURE_HEIGHT;
    device.set_format(&wanted).map_err(|e| failed("set", e))
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let device = open_device(device_path)?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let format = negotiate(&device)?;
        let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV or GREY)",
                format.fourcc
            ))
        })?;
        tracing::info!(
            width = format.width,
            height = format.height,
            fourcc = ?format.fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Capture a single BGR frame.
    pub fn capture_frame(&self) -> Result<VideoFrame, CameraError> {
        let mut captured = None;
        self.frames(Some(1), |frame| {
            captured = Some(frame);
            Ok::<_, CameraError>(())
        })?;
        captured.ok_or_else(|| CameraError::CaptureFailed("stream delivered no frame".into()))
    }

    /// Capture frames over one stream, handing each to `on_frame` as it
    /// arrives. `None` keeps going until `on_frame` fails.
    ///
    /// Returns the number of frames delivered.
    pub fn frames<E>(
        &self,
        count: Option<usize>,
        mut on_frame: impl FnMut(VideoFrame) -> Result<(), E>,
    ) -> Result<usize, E>
    where
        E: From<CameraError>,
    {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        let mut delivered = 0usize;

        while count.map_or(true, |n| delivered < n) {
            let (buf, meta) = stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            })?;
            let frame = self.to_frame(buf, meta)?;
            tracing::trace!(seq = frame.sequence, "captured frame");
            on_frame(frame)?;
            delivered += 1;
        }

        Ok(delivered)
    }

    fn to_frame(&self, buf: &[u8], meta: &Metadata) -> Result<VideoFrame, CameraError> {
        let data = self
            .pixel_format
            .to_bgr(buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(format!("frame conversion failed: {e}")))?;
        Ok(VideoFrame {
            data,
            width: self.width,
            height: self.height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_PROBED_DEVICES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/video-does-not-exist").err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_grey_format_replicates_channels() {
        let bgr = PixelFormat::Grey.to_bgr(&[10, 20], 2, 1).unwrap();
        assert_eq!(bgr, vec![10, 10, 10, 20, 20, 20]);
    }
}
