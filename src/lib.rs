//! V4L2-Camera: user-pointer streaming capture for V4L2 devices
//!
//! This library manages the buffer lifecycle of a V4L2 capture stream:
//! format negotiation, a ring of application-allocated buffers handed to the
//! driver, the dequeue/queue cycle while streaming, and an orderly teardown
//! that never frees memory the driver may still write into.
//!
//! All driver access goes through the [`CaptureDriver`] trait, so the whole
//! lifecycle can be exercised against a mock without hardware.
//!
//! ```no_run
//! use v4l2_camera::{CaptureConfig, FourCC, Session};
//!
//! let config = CaptureConfig::default()
//!     .with_resolution(1280, 720)
//!     .with_pixel_format(FourCC::YUYV);
//! let mut session = Session::open(config)?;
//! let frame = session.capture()?;
//! println!("frame {}: {} bytes", frame.metadata().sequence, frame.len());
//! # Ok::<(), v4l2_camera::CameraError>(())
//! ```

pub mod config;
pub mod device;
pub mod negotiation;
pub mod pool;
pub mod session;
pub mod stream;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use config::CaptureConfig;
pub use device::V4L2Device;
pub use pool::{BufferPool, Ownership, ReleaseSummary};
pub use session::{FrameView, Session};
pub use stream::{ControllerStats, StreamState, StreamingController, TeardownReport};
pub use traits::{
    CameraError, CaptureDriver, DequeuedBuffer, DeviceCapabilities, Format, FourCC, Frame,
    FrameMetadata, Recovery,
};
