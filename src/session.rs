//! Capture sessions: the public frame-by-frame API.

use log::{info, warn};

use crate::config::CaptureConfig;
use crate::device::V4L2Device;
use crate::negotiation::{negotiate_format, query_capabilities};
use crate::pool::BufferPool;
use crate::stream::{ControllerStats, StreamState, StreamingController, TeardownReport};
use crate::traits::{
    CameraError, CaptureDriver, DeviceCapabilities, Format, Frame, FrameMetadata, Result,
};

/// An open, streaming capture device.
///
/// Opening negotiates the format, registers the buffer ring and starts
/// streaming. Each [`capture`](Self::capture) lends out one filled buffer;
/// that buffer goes back to the driver at the next capture, on
/// [`FrameView::release`], or at teardown.
pub struct Session<D: CaptureDriver = V4L2Device> {
    controller: StreamingController<D>,
    config: CaptureConfig,
    capabilities: DeviceCapabilities,
    format: Format,
    held: Option<u32>,
    closed: bool,
}

impl Session<V4L2Device> {
    /// Open the configured device node and start streaming.
    pub fn open(config: CaptureConfig) -> Result<Self> {
        let driver = V4L2Device::open(&config.device_path)?;
        Self::with_driver(driver, config)
    }
}

impl<D: CaptureDriver> Session<D> {
    /// Bring up a session on an already open driver.
    ///
    /// Nothing is returned on failure: whatever was set up is torn down.
    pub fn with_driver(driver: D, config: CaptureConfig) -> Result<Self> {
        let mut controller = StreamingController::new(driver);

        match Self::bring_up(&mut controller, &config) {
            Ok((capabilities, format)) => {
                info!(
                    "{}: streaming {format} with {} buffers",
                    capabilities.card, config.buffer_count
                );
                Ok(Self {
                    controller,
                    config,
                    capabilities,
                    format,
                    held: None,
                    closed: false,
                })
            }
            Err(err) => {
                let report = controller.teardown();
                if !report.is_clean() {
                    warn!("teardown after failed open was incomplete: {report:?}");
                }
                Err(err)
            }
        }
    }

    fn bring_up(
        controller: &mut StreamingController<D>,
        config: &CaptureConfig,
    ) -> Result<(DeviceCapabilities, Format)> {
        let capabilities = query_capabilities(controller.driver())?;
        let format = negotiate_format(
            controller.driver_mut(),
            config.width,
            config.height,
            config.pixel_format,
        )?;
        let pool = BufferPool::allocate(controller.driver_mut(), config.buffer_count, format.size)?;
        controller.register(pool)?;
        controller.start()?;
        Ok((capabilities, format))
    }

    /// Wait for the next filled buffer and lend it out.
    ///
    /// The buffer lent out by the previous call is queued again first. Only
    /// one view can exist at a time; it borrows the session.
    pub fn capture(&mut self) -> Result<FrameView<'_, D>> {
        if self.closed {
            return Err(CameraError::SessionClosed);
        }
        self.release_held()?;

        let buf = match self.controller.retrieve(self.config.timeout) {
            Ok(buf) => buf,
            Err(err) => return Err(self.fail(err)),
        };
        self.held = Some(buf.index);

        Ok(FrameView {
            metadata: FrameMetadata::from(&buf),
            session: self,
        })
    }

    /// Queue the buffer lent out by the last capture, if any.
    ///
    /// A retryable failure keeps the buffer held so the next call tries again.
    pub fn release_held(&mut self) -> Result<()> {
        if self.closed {
            return Err(CameraError::SessionClosed);
        }
        let Some(index) = self.held else {
            return Ok(());
        };

        match self.controller.resubmit(index) {
            Ok(()) => {
                self.held = None;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: CameraError) -> CameraError {
        if !err.is_retryable() {
            warn!("closing session: {err}");
            self.closed = true;
        }
        err
    }

    /// The format the driver actually chose.
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Capabilities reported by the device.
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// The configuration the session was opened with.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Current streaming state.
    pub const fn state(&self) -> StreamState {
        self.controller.state()
    }

    /// Retrieve and resubmit counters.
    pub const fn stats(&self) -> ControllerStats {
        self.controller.stats()
    }

    /// Whether the session can no longer capture.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop streaming and release every resource. Always completes.
    pub fn close(mut self) -> TeardownReport {
        self.closed = true;
        self.held = None;
        self.controller.teardown()
    }
}

/// One filled buffer, lent out until the next call on the session.
pub struct FrameView<'a, D: CaptureDriver> {
    session: &'a mut Session<D>,
    metadata: FrameMetadata,
}

impl<D: CaptureDriver> FrameView<'_, D> {
    /// The bytes the driver wrote.
    pub fn data(&self) -> &[u8] {
        self.session
            .controller
            .frame(self.metadata.index, self.metadata.bytes_used)
            .unwrap_or_default()
    }

    /// Number of bytes the driver wrote.
    pub fn len(&self) -> usize {
        self.metadata.bytes_used as usize
    }

    /// Whether the driver delivered an empty buffer.
    pub const fn is_empty(&self) -> bool {
        self.metadata.bytes_used == 0
    }

    /// Frame metadata.
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Copy the frame out of the ring.
    pub fn to_frame(&self) -> Frame {
        Frame {
            data: self.data().to_vec(),
            metadata: self.metadata.clone(),
        }
    }

    /// Give the buffer back to the driver now instead of at the next capture.
    pub fn release(self) -> Result<()> {
        self.session.release_held()
    }
}
