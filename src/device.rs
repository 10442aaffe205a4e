//! V4L2 device implementation using the v4l crate.
//!
//! Capability and format queries go through the crate's safe wrappers. The
//! user-pointer buffer protocol is not covered by them with the ownership
//! tracking this crate needs, so those calls are issued as raw ioctls on the
//! device descriptor.

use std::io;
use std::mem;
use std::os::raw::{c_int, c_ulong};
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::Duration;

use log::debug;
use v4l::buffer::{Flags as BufferFlags, Type};
use v4l::memory::Memory;
use v4l::timestamp::Timestamp;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{CameraError, CaptureDriver, DequeuedBuffer, DeviceCapabilities, Format, FourCC, Result};

/// V4L2 capture device wrapping a `v4l` device handle.
pub struct V4L2Device {
    device: Option<Device>,
    path: PathBuf,
}

impl V4L2Device {
    /// Open the device node at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let device = Device::with_path(&path).map_err(|source| CameraError::DeviceOpenFailed {
            path: path.clone(),
            source,
        })?;
        debug!("opened {}", path.display());

        Ok(Self {
            device: Some(device),
            path,
        })
    }

    fn device(&self) -> io::Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn fd(&self) -> io::Result<c_int> {
        Ok(self.device()?.handle().fd())
    }

    #[allow(unsafe_code)]
    fn empty_buffer() -> v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct; all-zero is its documented initial state.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::UserPtr as u32;
        buf
    }

    #[allow(unsafe_code)]
    fn buffer_ioctl(&self, request: v4l2::vidioc::_IOC_TYPE, buf: &mut v4l2_buffer) -> io::Result<()> {
        let fd = self.fd()?;
        // SAFETY: `buf` is a valid v4l2_buffer exclusively borrowed for the call.
        unsafe { v4l2::ioctl(fd, request, ptr::addr_of_mut!(*buf).cast()) }
    }

    #[allow(unsafe_code)]
    fn stream_ioctl(&self, request: v4l2::vidioc::_IOC_TYPE) -> io::Result<()> {
        let fd = self.fd()?;
        let mut typ = Type::VideoCapture as u32;
        // SAFETY: the stream ioctls read a single buffer type integer.
        unsafe { v4l2::ioctl(fd, request, ptr::addr_of_mut!(typ).cast()) }
    }
}

/// `poll(2)` timeout for `timeout`: `-1` blocks, and any non-zero wait is at
/// least one millisecond so it never degrades into a non-blocking check.
fn poll_timeout_ms(timeout: Option<Duration>) -> c_int {
    timeout.map_or(-1, |t| {
        let ms = t.as_nanos().div_ceil(1_000_000);
        c_int::try_from(ms).unwrap_or(c_int::MAX)
    })
}

impl From<v4l::Format> for Format {
    fn from(fmt: v4l::Format) -> Self {
        Self {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        }
    }
}

impl CaptureDriver for V4L2Device {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device()?.query_caps()?;

        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        })
    }

    fn format(&self) -> io::Result<Format> {
        Ok(self.device()?.format()?.into())
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        let device = self.device()?;
        let mut fmt = device.format()?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        Ok(device.set_format(&fmt)?.into())
    }

    #[allow(unsafe_code)]
    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let fd = self.fd()?;
        // SAFETY: v4l2_requestbuffers is a plain C struct; all-zero is valid.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::UserPtr as u32;
        req.count = count;

        // SAFETY: `req` is a valid v4l2_requestbuffers exclusively borrowed for the call.
        unsafe { v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_REQBUFS, ptr::addr_of_mut!(req).cast()) }?;
        debug!("VIDIOC_REQBUFS: requested {count}, granted {}", req.count);

        Ok(req.count)
    }

    fn queue_buffer(&mut self, index: u32, region: &mut [u8]) -> io::Result<()> {
        let length = u32::try_from(region.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer larger than 4 GiB"))?;

        let mut buf = Self::empty_buffer();
        buf.index = index;
        buf.m.userptr = region.as_mut_ptr() as c_ulong;
        buf.length = length;

        self.buffer_ioctl(v4l2::vidioc::VIDIOC_QBUF, &mut buf)
    }

    #[allow(unsafe_code)]
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd()?,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = poll_timeout_ms(timeout);

        // SAFETY: `pollfd` is a single valid entry for the duration of the call.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        match ready {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
                && pollfd.revents & libc::POLLIN == 0 =>
            {
                Err(io::Error::from_raw_os_error(libc::EIO))
            }
            _ => Ok(true),
        }
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = Self::empty_buffer();
        self.buffer_ioctl(v4l2::vidioc::VIDIOC_DQBUF, &mut buf)?;

        // V4L2 timestamps are always non-negative in practice
        let ts = Timestamp::from(buf.timestamp);
        #[allow(clippy::cast_sign_loss)]
        let secs = ts.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (ts.usec.max(0) as u32).saturating_mul(1000);

        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp: Duration::new(secs, nanos),
            corrupted: BufferFlags::from(buf.flags).contains(BufferFlags::ERROR),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMON)?;
        debug!("{}: streaming on", self.path.display());
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.stream_ioctl(v4l2::vidioc::VIDIOC_STREAMOFF)?;
        debug!("{}: streaming off", self.path.display());
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.device.take().is_some() {
            debug!("closed {}", self.path.display());
        }
        Ok(())
    }
}
