//! Capture session configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::traits::FourCC;

/// Device node opened when none is configured.
pub const DEFAULT_DEVICE: &str = "/dev/video0";
/// Depth of the capture ring when none is configured.
pub const DEFAULT_BUFFER_COUNT: u32 = 4;
/// Fewest buffers that can stream: one lent to the caller, one with the kernel.
pub const MIN_BUFFER_COUNT: u32 = 2;
/// Kernel limit on buffers per queue (`VIDEO_MAX_FRAME`).
pub const MAX_BUFFER_COUNT: u32 = 32;

/// Settings for one capture session. Fixed once the session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Device node to open.
    pub device_path: PathBuf,
    /// Requested horizontal resolution.
    pub width: u32,
    /// Requested vertical resolution.
    pub height: u32,
    /// Requested pixel format.
    pub pixel_format: FourCC,
    /// Number of buffers in the capture ring.
    pub buffer_count: u32,
    /// Upper bound on how long a single capture may wait. `None` blocks.
    pub timeout: Option<Duration>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE),
            width: 1920,
            height: 1080,
            pixel_format: FourCC::H264,
            buffer_count: DEFAULT_BUFFER_COUNT,
            timeout: None,
        }
    }
}

impl CaptureConfig {
    /// Use a different device node.
    #[must_use]
    pub fn with_device<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.device_path = path.into();
        self
    }

    /// Request a resolution.
    #[must_use]
    pub const fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Request a pixel format.
    #[must_use]
    pub const fn with_pixel_format(mut self, fourcc: FourCC) -> Self {
        self.pixel_format = fourcc;
        self
    }

    /// Set the depth of the capture ring.
    #[must_use]
    pub const fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Bound each capture by `timeout` instead of blocking indefinitely.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.device_path, PathBuf::from("/dev/video0"));
        assert_eq!((config.width, config.height), (1920, 1080));
        assert_eq!(config.buffer_count, 4);
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn test_builder_setters() {
        let config = CaptureConfig::default()
            .with_device("/dev/video2")
            .with_resolution(640, 480)
            .with_pixel_format(FourCC::YUYV)
            .with_buffer_count(6)
            .with_timeout(Duration::from_millis(500));

        assert_eq!(config.device_path, PathBuf::from("/dev/video2"));
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.pixel_format, FourCC::YUYV);
        assert_eq!(config.buffer_count, 6);
        assert_eq!(config.timeout, Some(Duration::from_millis(500)));
    }
}
