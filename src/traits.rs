//! Core traits and types for the V4L2 capture engine.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::stream::StreamState;

/// Pixel format representation (e.g., YUYV, MJPG, H264).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// H.264 elementary stream.
    pub const H264: Self = Self::new(b"H264");

    /// Bytes per pixel for packed uncompressed formats, `None` for compressed ones.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" | b"UYVY" => Some(2),
            b"RGB3" | b"BGR3" => Some(3),
            _ => None,
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl FromStr for FourCC {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let code: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("fourcc must be exactly 4 bytes, got {s:?}"))?;
        Ok(Self(code))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format as negotiated with the driver.
///
/// `size` is the byte size of one complete frame and is the allocation size
/// for every buffer in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride). Zero for compressed formats.
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    ///
    /// Compressed formats get no stride and an upper bound of two bytes per
    /// pixel for their frame size; drivers report their own bound on
    /// negotiation anyway.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let (stride, size) = match fourcc.bytes_per_pixel() {
            Some(bpp) => (width * bpp, width * bpp * height),
            None => (0, width * height * 2),
        };
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} ({} bytes/frame)",
            self.width, self.height, self.fourcc, self.size
        )
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// A buffer handed back by the driver's dequeue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Index of the slot the driver filled.
    pub index: u32,
    /// Bytes the driver actually wrote into the slot.
    pub bytes_used: u32,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// The driver flagged the data as possibly corrupted.
    pub corrupted: bool,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Slot the frame was delivered in.
    pub index: u32,
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
    /// The driver flagged the data as possibly corrupted.
    pub corrupted: bool,
}

impl From<&DequeuedBuffer> for FrameMetadata {
    fn from(buf: &DequeuedBuffer) -> Self {
        Self {
            index: buf.index,
            sequence: buf.sequence,
            timestamp: buf.timestamp,
            bytes_used: buf.bytes_used,
            corrupted: buf.corrupted,
        }
    }
}

/// A captured video frame copied out of the buffer ring.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Whether a failed control call may simply be issued again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Transient condition (interrupted call, nothing ready yet, timeout).
    Retryable,
    /// The device or the buffer protocol is broken; the session must stop.
    Fatal,
}

impl Recovery {
    /// Classify an error reported by a control call.
    #[must_use]
    pub fn of(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EINTR | libc::EAGAIN) => Self::Retryable,
            Some(_) => Self::Fatal,
            None => match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    Self::Retryable
                }
                _ => Self::Fatal,
            },
        }
    }
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device node could not be opened.
    #[error("failed to open {}: {source}", .path.display())]
    DeviceOpenFailed {
        /// Device node path.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },
    /// The device cannot capture video through streaming I/O.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),
    /// The driver refused the requested format.
    #[error("format rejected: {reason}")]
    FormatRejected {
        /// What went wrong.
        reason: String,
        /// Underlying OS error, if a control call failed.
        #[source]
        source: Option<io::Error>,
    },
    /// The buffer pool could not be set up.
    #[error("buffer allocation rejected: {reason}")]
    AllocationRejected {
        /// Number of buffers asked for.
        requested: u32,
        /// Number of buffers the driver granted, if it answered.
        granted: Option<u32>,
        /// What went wrong.
        reason: String,
        /// Underlying OS error, if a control call failed.
        #[source]
        source: Option<io::Error>,
    },
    /// The driver refused to start streaming.
    #[error("stream start failed: {0}")]
    StreamStartFailed(#[source] io::Error),
    /// Dequeuing a filled buffer failed.
    #[error("{recovery} retrieve failure: {source}")]
    RetrieveFailed {
        /// Whether the session survives.
        recovery: Recovery,
        /// Underlying error.
        source: io::Error,
    },
    /// Queuing a buffer back to the driver failed.
    #[error("{recovery} submit failure for buffer {index}: {source}")]
    SubmitFailed {
        /// Slot index.
        index: u32,
        /// Whether the session survives.
        recovery: Recovery,
        /// Underlying error.
        source: io::Error,
    },
    /// A buffer operation was attempted outside the streaming state.
    #[error("not streaming (state: {0})")]
    NotStreaming(StreamState),
    /// A lifecycle step was requested from a state that does not allow it.
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        /// Current state.
        state: StreamState,
        /// What was attempted.
        action: &'static str,
    },
    /// The session was closed by a fatal error or by the caller.
    #[error("session closed")]
    SessionClosed,
}

impl CameraError {
    /// Whether the session remains usable after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetrieveFailed {
                recovery: Recovery::Retryable,
                ..
            } | Self::SubmitFailed {
                recovery: Recovery::Retryable,
                ..
            }
        )
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// The kernel control surface the capture engine drives.
///
/// Each method maps onto one V4L2 control call and reports the raw OS error,
/// which the layers above classify with [`Recovery::of`].
pub trait CaptureDriver {
    /// Query device capabilities (`VIDIOC_QUERYCAP`).
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// Get current format (`VIDIOC_G_FMT`).
    fn format(&self) -> io::Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, format: &Format) -> io::Result<Format>;

    /// Request `count` user-pointer buffers. Returns the count the driver
    /// granted. A count of zero frees the driver side of the pool.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// Hand `region` to the driver as buffer `index`.
    ///
    /// The driver may write into the region until it is dequeued again;
    /// callers must neither read nor free it in between.
    fn queue_buffer(&mut self, index: u32, region: &mut [u8]) -> io::Result<()>;

    /// Block until a filled buffer can be dequeued.
    ///
    /// Returns `false` if `timeout` elapsed first. `None` waits forever.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Take one filled buffer back from the driver.
    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    /// Start streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop streaming. The driver gives every queued buffer back.
    fn stream_off(&mut self) -> io::Result<()>;

    /// Release the device descriptor. Calling it twice is a no-op.
    fn close(&mut self) -> io::Result<()>;
}
