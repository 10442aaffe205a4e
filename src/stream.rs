//! Streaming state machine and the dequeue/queue protocol.

use std::fmt;
use std::io;
use std::time::Duration;

use log::{debug, error, warn};

use crate::pool::{BufferPool, ReleaseSummary};
use crate::traits::{CameraError, CaptureDriver, DequeuedBuffer, Recovery, Result};

/// Lifecycle of a capture stream. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No buffers registered yet.
    Idle,
    /// Buffers registered and queued, stream not started.
    Ready,
    /// The driver is filling buffers.
    Streaming,
    /// Streaming halted; nothing may be queued or dequeued any more.
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Per-controller counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Successful dequeues.
    pub retrieved: u64,
    /// Successful queues of previously dequeued buffers.
    pub resubmitted: u64,
}

/// What happened while tearing a stream down. Teardown never fails; every
/// step is attempted and its error recorded here.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// `VIDIOC_STREAMOFF` failure.
    pub stream_off: Option<io::Error>,
    /// Failure releasing the driver's buffer registration.
    pub unregister: Option<io::Error>,
    /// Failure closing the descriptor.
    pub close: Option<io::Error>,
    /// Memory release outcome.
    pub buffers: ReleaseSummary,
}

impl TeardownReport {
    /// Whether every step succeeded and no memory was leaked.
    pub const fn is_clean(&self) -> bool {
        self.stream_off.is_none()
            && self.unregister.is_none()
            && self.close.is_none()
            && self.buffers.leaked == 0
    }
}

/// Owns the driver and the buffer pool and enforces when buffers may move
/// between them.
pub struct StreamingController<D: CaptureDriver> {
    driver: D,
    pool: Option<BufferPool>,
    state: StreamState,
    stats: ControllerStats,
    closed: bool,
}

impl<D: CaptureDriver> StreamingController<D> {
    /// Wrap an open driver. The controller starts out `Idle`.
    pub const fn new(driver: D) -> Self {
        Self {
            driver,
            pool: None,
            state: StreamState::Idle,
            stats: ControllerStats {
                retrieved: 0,
                resubmitted: 0,
            },
            closed: false,
        }
    }

    /// Current state.
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Counters since construction.
    pub const fn stats(&self) -> ControllerStats {
        self.stats
    }

    /// The driver.
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// The driver, for configuration calls made before registration.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// The registered pool, if any.
    pub const fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Take ownership of `pool` and queue all of its buffers: `Idle -> Ready`.
    ///
    /// If queuing fails the pool is kept so teardown can reclaim it, and the
    /// state stays `Idle`.
    pub fn register(&mut self, pool: BufferPool) -> Result<()> {
        if self.state != StreamState::Idle || self.pool.is_some() {
            return Err(CameraError::InvalidTransition {
                state: self.state,
                action: "register buffers",
            });
        }

        let pool = self.pool.insert(pool);
        pool.submit_all(&mut self.driver)?;
        debug!("registered {} buffers", pool.len());
        self.state = StreamState::Ready;
        Ok(())
    }

    /// Start streaming: `Ready -> Streaming`. On failure the state stays
    /// `Ready` and the call may be retried.
    pub fn start(&mut self) -> Result<()> {
        if self.state != StreamState::Ready {
            return Err(CameraError::InvalidTransition {
                state: self.state,
                action: "start streaming",
            });
        }

        self.driver
            .stream_on()
            .map_err(CameraError::StreamStartFailed)?;
        self.state = StreamState::Streaming;
        Ok(())
    }

    /// Dequeue one filled buffer, waiting at most `timeout` for it.
    ///
    /// The returned slot belongs to the application until it is passed to
    /// [`resubmit`](Self::resubmit). Fatal failures stop the stream.
    pub fn retrieve(&mut self, timeout: Option<Duration>) -> Result<DequeuedBuffer> {
        let pool = self.streaming_pool()?;
        if pool.kernel_owned() == 0 {
            // Every buffer is lent out; the driver has nothing to fill.
            return Err(CameraError::RetrieveFailed {
                recovery: Recovery::Retryable,
                source: io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "no buffer is queued with the driver",
                ),
            });
        }

        match self.driver.wait_readable(timeout) {
            Ok(true) => {}
            Ok(false) => {
                return Err(CameraError::RetrieveFailed {
                    recovery: Recovery::Retryable,
                    source: io::Error::new(io::ErrorKind::TimedOut, "no frame within timeout"),
                })
            }
            Err(source) => return Err(self.retrieve_failed(source)),
        }

        let buf = match self.driver.dequeue_buffer() {
            Ok(buf) => buf,
            Err(source) => return Err(self.retrieve_failed(source)),
        };

        let marked = self
            .streaming_pool_mut()
            .and_then(|pool| pool.mark_retrieved(&buf));
        if let Err(err) = marked {
            error!("{err}");
            self.halt();
            return Err(err);
        }
        self.stats.retrieved += 1;
        Ok(buf)
    }

    /// Queue a previously retrieved slot again. Fatal failures stop the stream.
    pub fn resubmit(&mut self, index: u32) -> Result<()> {
        let state = self.state;
        let Some(pool) = self
            .pool
            .as_mut()
            .filter(|_| state == StreamState::Streaming)
        else {
            return Err(CameraError::NotStreaming(state));
        };

        match pool.submit(&mut self.driver, index) {
            Ok(()) => {
                self.stats.resubmitted += 1;
                Ok(())
            }
            Err(err) => {
                if !err.is_retryable() {
                    error!("{err}");
                    self.halt();
                }
                Err(err)
            }
        }
    }

    /// The first `len` bytes of a slot the application currently owns.
    pub fn frame(&self, index: u32, len: u32) -> Option<&[u8]> {
        self.pool.as_ref()?.bytes(index, len)
    }

    /// Stop streaming and move to `Stopped`, whatever the outcome.
    ///
    /// `VIDIOC_STREAMOFF` is issued whenever the driver may hold buffers. On
    /// success the driver has returned all of them; on failure they stay
    /// marked as queued. The error is logged and returned, never acted on.
    pub fn stop(&mut self) -> io::Result<()> {
        let queued = self.pool.as_ref().map_or(0, BufferPool::kernel_owned);
        let needs_stream_off = self.state == StreamState::Streaming || queued > 0;
        self.state = StreamState::Stopped;

        if !needs_stream_off {
            return Ok(());
        }
        match self.driver.stream_off() {
            Ok(()) => {
                if let Some(pool) = self.pool.as_mut() {
                    pool.reclaim_all();
                }
                Ok(())
            }
            Err(err) => {
                warn!("VIDIOC_STREAMOFF failed: {err}");
                Err(err)
            }
        }
    }

    /// Stop, unregister the buffers, close the descriptor and free memory.
    ///
    /// Memory is freed last. A slot is only reclaimed once the driver gave it
    /// back, through a successful stream stop or a closed descriptor.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.closed {
            return report;
        }
        self.closed = true;

        report.stream_off = self.stop().err();

        if report.stream_off.is_none() && self.pool.is_some() {
            if let Err(err) = self.driver.request_buffers(0) {
                warn!("failed to release driver buffers: {err}");
                report.unregister = Some(err);
            }
        }

        match self.driver.close() {
            Ok(()) => {
                if let Some(pool) = self.pool.as_mut() {
                    pool.reclaim_all();
                }
            }
            Err(err) => {
                warn!("failed to close device: {err}");
                report.close = Some(err);
            }
        }

        if let Some(pool) = self.pool.take() {
            report.buffers = pool.release();
        }
        debug!("teardown finished: {report:?}");
        report
    }

    fn retrieve_failed(&mut self, source: io::Error) -> CameraError {
        let recovery = Recovery::of(&source);
        if recovery == Recovery::Fatal {
            error!("retrieve failed: {source}");
            self.halt();
        } else {
            debug!("retrieve interrupted: {source}");
        }
        CameraError::RetrieveFailed { recovery, source }
    }

    fn halt(&mut self) {
        // Best effort; the error is already logged by `stop`.
        let _ = self.stop();
    }

    fn streaming_pool(&self) -> Result<&BufferPool> {
        match (&self.pool, self.state) {
            (Some(pool), StreamState::Streaming) => Ok(pool),
            _ => Err(CameraError::NotStreaming(self.state)),
        }
    }

    fn streaming_pool_mut(&mut self) -> Result<&mut BufferPool> {
        match (&mut self.pool, self.state) {
            (Some(pool), StreamState::Streaming) => Ok(pool),
            (_, state) => Err(CameraError::NotStreaming(state)),
        }
    }
}

impl<D: CaptureDriver> Drop for StreamingController<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
