//! Mock driver implementation for testing without hardware.
//!
//! The mock keeps a FIFO of queued buffers like the kernel does and fills
//! each region at queue time with the byte value of the sequence number it
//! will be delivered with, so tests can check which frame they are reading.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::traits::{CaptureDriver, DequeuedBuffer, DeviceCapabilities, Format, FourCC};

/// Calls observed by the mock, shared with the test that created it.
#[derive(Debug, Default)]
pub struct Journal {
    /// Counts passed to `request_buffers`, in order.
    pub requested: Vec<u32>,
    /// Indices passed to successful `queue_buffer` calls, in order.
    pub queued: Vec<u32>,
    /// Timeouts passed to `wait_readable`, in order.
    pub wait_timeouts: Vec<Option<Duration>>,
    /// Successful dequeues.
    pub dequeued: u64,
    /// `stream_on` calls.
    pub stream_on: u32,
    /// `stream_off` calls.
    pub stream_off: u32,
    /// Whether `close` succeeded.
    pub closed: bool,
    /// Errno values the next `queue_buffer` calls fail with.
    pub queue_errors: VecDeque<i32>,
}

/// Mock driver for testing without hardware.
pub struct MockDriver {
    capabilities: DeviceCapabilities,
    format: Format,
    substitute: Option<Format>,
    granted: Option<u32>,
    bytes_used: Option<u32>,
    bogus_index: Option<u32>,
    stall_next_wait: bool,
    corrupt_next: bool,
    set_format_error: Option<i32>,
    request_error: Option<i32>,
    stream_on_errors: VecDeque<i32>,
    stream_off_error: Option<i32>,
    close_error: Option<i32>,
    dequeue_errors: VecDeque<i32>,
    buffer_count: u32,
    fifo: VecDeque<(u32, u32)>,
    next_sequence: u32,
    streaming: bool,
    journal: Rc<RefCell<Journal>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a new mock driver with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            format: Format::new(64, 48, FourCC::YUYV),
            substitute: None,
            granted: None,
            bytes_used: None,
            bogus_index: None,
            stall_next_wait: false,
            corrupt_next: false,
            set_format_error: None,
            request_error: None,
            stream_on_errors: VecDeque::new(),
            stream_off_error: None,
            close_error: None,
            dequeue_errors: VecDeque::new(),
            buffer_count: 0,
            fifo: VecDeque::new(),
            next_sequence: 0,
            streaming: false,
            journal: Rc::default(),
        }
    }

    /// Shared view of the calls this driver has seen.
    #[must_use]
    pub fn journal(&self) -> Rc<RefCell<Journal>> {
        Rc::clone(&self.journal)
    }

    /// Capabilities this driver reports.
    #[must_use]
    pub fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities.clone()
    }

    /// Set the capabilities for this mock driver.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Answer every `set_format` with `format` instead of the request.
    #[must_use]
    pub fn with_substitute_format(mut self, format: Format) -> Self {
        self.substitute = Some(format);
        self
    }

    /// Grant `count` buffers whatever is requested.
    #[must_use]
    pub const fn with_granted_count(mut self, count: u32) -> Self {
        self.granted = Some(count);
        self
    }

    /// Deliver frames filling only `bytes` bytes of each buffer.
    #[must_use]
    pub const fn with_bytes_used(mut self, bytes: u32) -> Self {
        self.bytes_used = Some(bytes);
        self
    }

    /// Report `index` on the next dequeue instead of the real slot.
    #[must_use]
    pub const fn with_bogus_index(mut self, index: u32) -> Self {
        self.bogus_index = Some(index);
        self
    }

    /// Let the next wait time out.
    #[must_use]
    pub const fn stall_next_wait(mut self) -> Self {
        self.stall_next_wait = true;
        self
    }

    /// Flag the next dequeued buffer with `V4L2_BUF_FLAG_ERROR`.
    #[must_use]
    pub const fn with_corrupted_frame(mut self) -> Self {
        self.corrupt_next = true;
        self
    }

    /// Fail `set_format` with `errno`.
    #[must_use]
    pub const fn fail_set_format(mut self, errno: i32) -> Self {
        self.set_format_error = Some(errno);
        self
    }

    /// Fail `request_buffers` with `errno`.
    #[must_use]
    pub const fn fail_request_buffers(mut self, errno: i32) -> Self {
        self.request_error = Some(errno);
        self
    }

    /// Fail the next `stream_on` with `errno`.
    #[must_use]
    pub fn fail_stream_on(mut self, errno: i32) -> Self {
        self.stream_on_errors.push_back(errno);
        self
    }

    /// Fail every `stream_off` with `errno`.
    #[must_use]
    pub const fn fail_stream_off(mut self, errno: i32) -> Self {
        self.stream_off_error = Some(errno);
        self
    }

    /// Fail `close` with `errno`.
    #[must_use]
    pub const fn fail_close(mut self, errno: i32) -> Self {
        self.close_error = Some(errno);
        self
    }

    /// Fail the next dequeue with `errno`.
    #[must_use]
    pub fn fail_dequeue(mut self, errno: i32) -> Self {
        self.dequeue_errors.push_back(errno);
        self
    }

    fn frame_bytes(&self) -> u32 {
        self.bytes_used.unwrap_or(self.format.size)
    }
}

impl CaptureDriver for MockDriver {
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        Ok(self.capabilities.clone())
    }

    fn format(&self) -> io::Result<Format> {
        Ok(self.format.clone())
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        if let Some(errno) = self.set_format_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.format = self
            .substitute
            .clone()
            .unwrap_or_else(|| Format::new(format.width, format.height, format.fourcc));
        Ok(self.format.clone())
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        self.journal.borrow_mut().requested.push(count);
        if let Some(errno) = self.request_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if count > 0 && (self.streaming || !self.fifo.is_empty()) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.buffer_count = if count == 0 {
            0
        } else {
            self.granted.unwrap_or(count)
        };
        Ok(self.buffer_count)
    }

    fn queue_buffer(&mut self, index: u32, region: &mut [u8]) -> io::Result<()> {
        if let Some(errno) = self.journal.borrow_mut().queue_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let too_small = region.len() < self.format.size as usize;
        let already_queued = self.fifo.iter().any(|(queued, _)| *queued == index);
        if index >= self.buffer_count || too_small || already_queued {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        #[allow(clippy::cast_possible_truncation)]
        let fill = sequence as u8;
        let used = (self.frame_bytes() as usize).min(region.len());
        if let Some(bytes) = region.get_mut(..used) {
            bytes.fill(fill);
        }

        self.fifo.push_back((index, sequence));
        self.journal.borrow_mut().queued.push(index);
        Ok(())
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.journal.borrow_mut().wait_timeouts.push(timeout);
        if self.stall_next_wait {
            self.stall_next_wait = false;
            return Ok(false);
        }
        Ok(self.streaming && !self.fifo.is_empty())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        if let Some(errno) = self.dequeue_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if !self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let (index, sequence) = self
            .fifo
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))?;
        self.journal.borrow_mut().dequeued += 1;

        Ok(DequeuedBuffer {
            index: self.bogus_index.take().unwrap_or(index),
            bytes_used: self.frame_bytes(),
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
            corrupted: std::mem::take(&mut self.corrupt_next),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.journal.borrow_mut().stream_on += 1;
        if let Some(errno) = self.stream_on_errors.pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.journal.borrow_mut().stream_off += 1;
        if let Some(errno) = self.stream_off_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.streaming = false;
        self.fifo.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(errno) = self.close_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        self.streaming = false;
        self.fifo.clear();
        self.journal.borrow_mut().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_driver_creation() {
        let driver = MockDriver::new();
        let caps = driver.query_capabilities().expect("query_capabilities should succeed");
        assert_eq!(caps.driver, "mock");
        assert!(caps.can_capture);
        assert!(caps.can_stream);
    }

    #[test]
    fn test_mock_fifo_and_fill() {
        let mut driver = MockDriver::new().with_bytes_used(8);
        assert_eq!(driver.request_buffers(2).expect("request_buffers"), 2);

        let size = driver.format.size as usize;
        let mut a = vec![0xffu8; size];
        let mut b = vec![0xffu8; size];
        driver.queue_buffer(1, &mut a).expect("queue 1");
        driver.queue_buffer(0, &mut b).expect("queue 0");
        assert!(driver.queue_buffer(0, &mut b).is_err());

        driver.stream_on().expect("stream_on");
        let first = driver.dequeue_buffer().expect("dequeue");
        assert_eq!((first.index, first.sequence, first.bytes_used), (1, 0, 8));
        assert_eq!(a.get(..8), Some(&[0u8; 8][..]));
        assert_eq!(a.get(8), Some(&0xff));
        assert_eq!(b.first(), Some(&1));
    }
}
