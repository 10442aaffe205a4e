//! Fixed-size pool of user-pointer capture buffers.
//!
//! Every slot carries an ownership tag. Memory is only ever lent out for
//! slots the application owns, and a slot the kernel may still write into is
//! never freed: if the pool is dropped while such a slot exists, its region
//! is leaked instead.

use std::io;
use std::mem;

use log::{debug, error, warn};

use crate::config::{MAX_BUFFER_COUNT, MIN_BUFFER_COUNT};
use crate::traits::{CameraError, CaptureDriver, DequeuedBuffer, Recovery, Result};

/// Who may touch a slot's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The application owns the slot; it is safe to read.
    WithApplication,
    /// The slot is queued; the driver may write into it at any time.
    WithKernel,
}

struct Slot {
    region: Box<[u8]>,
    owner: Ownership,
}

/// Outcome of releasing a pool's memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    /// Regions returned to the allocator.
    pub freed: usize,
    /// Regions deliberately leaked because the driver still held them.
    pub leaked: usize,
}

/// The set of buffers registered with the driver for one session.
pub struct BufferPool {
    slots: Vec<Slot>,
    frame_size: u32,
    submitted: bool,
}

impl BufferPool {
    /// Register `count` user-pointer buffers with the driver and allocate a
    /// region of exactly `frame_size` bytes for each.
    ///
    /// A driver that grants a different count than requested is treated as a
    /// configuration error; the registration is undone before returning.
    pub fn allocate<D: CaptureDriver>(driver: &mut D, count: u32, frame_size: u32) -> Result<Self> {
        let reject = |granted: Option<u32>, reason: String, source: Option<io::Error>| {
            CameraError::AllocationRejected {
                requested: count,
                granted,
                reason,
                source,
            }
        };

        if count < MIN_BUFFER_COUNT {
            // With one buffer lent to the caller, a retrieve would wait on
            // the very slot the caller holds.
            return Err(reject(
                None,
                format!("at least {MIN_BUFFER_COUNT} buffers are required, got {count}"),
                None,
            ));
        }
        if count > MAX_BUFFER_COUNT {
            return Err(reject(
                None,
                format!("at most {MAX_BUFFER_COUNT} buffers are supported, got {count}"),
                None,
            ));
        }
        if frame_size == 0 {
            return Err(reject(None, "frame size is zero".to_owned(), None));
        }

        let granted = driver
            .request_buffers(count)
            .map_err(|err| reject(None, "driver refused user-pointer buffers".to_owned(), Some(err)))?;

        if granted != count {
            if let Err(err) = driver.request_buffers(0) {
                warn!("failed to release {granted} partially granted buffers: {err}");
            }
            return Err(reject(
                Some(granted),
                format!("driver granted {granted} buffers instead of {count}"),
                None,
            ));
        }

        let slots = (0..count)
            .map(|_| Slot {
                region: vec![0u8; frame_size as usize].into_boxed_slice(),
                owner: Ownership::WithApplication,
            })
            .collect();
        debug!("allocated {count} buffers of {frame_size} bytes");

        Ok(Self {
            slots,
            frame_size,
            submitted: false,
        })
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no slots (only after release).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Size of every region in bytes.
    pub const fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Current owner of slot `index`.
    pub fn ownership(&self, index: u32) -> Option<Ownership> {
        self.slots.get(index as usize).map(|slot| slot.owner)
    }

    /// Number of slots currently queued with the driver.
    pub fn kernel_owned(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner == Ownership::WithKernel)
            .count()
    }

    /// Queue every slot in index order. Allowed once per pool.
    pub fn submit_all<D: CaptureDriver>(&mut self, driver: &mut D) -> Result<()> {
        if self.submitted {
            return Err(CameraError::SubmitFailed {
                index: 0,
                recovery: Recovery::Fatal,
                source: io::Error::new(io::ErrorKind::InvalidInput, "pool was already submitted"),
            });
        }
        self.submitted = true;

        for index in 0..self.slot_count() {
            self.submit(driver, index)?;
        }
        Ok(())
    }

    /// Queue slot `index`, moving it from the application to the driver.
    pub fn submit<D: CaptureDriver>(&mut self, driver: &mut D, index: u32) -> Result<()> {
        let invalid = |reason: &str| CameraError::SubmitFailed {
            index,
            recovery: Recovery::Fatal,
            source: io::Error::new(io::ErrorKind::InvalidInput, reason.to_owned()),
        };

        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| invalid("no such buffer"))?;
        if slot.owner != Ownership::WithApplication {
            return Err(invalid("buffer is already queued"));
        }

        driver
            .queue_buffer(index, &mut slot.region)
            .map_err(|source| CameraError::SubmitFailed {
                index,
                recovery: Recovery::of(&source),
                source,
            })?;
        slot.owner = Ownership::WithKernel;
        Ok(())
    }

    /// Record that the driver handed `buf` back.
    ///
    /// A buffer the pool did not queue, or one claiming more bytes than the
    /// region holds, means the accounting can no longer be trusted.
    pub fn mark_retrieved(&mut self, buf: &DequeuedBuffer) -> Result<()> {
        let violation = |reason: String| CameraError::RetrieveFailed {
            recovery: Recovery::Fatal,
            source: io::Error::new(io::ErrorKind::InvalidData, reason),
        };

        if buf.bytes_used > self.frame_size {
            return Err(violation(format!(
                "buffer {} reports {} bytes used, frame size is {}",
                buf.index, buf.bytes_used, self.frame_size
            )));
        }
        let slot = self
            .slots
            .get_mut(buf.index as usize)
            .ok_or_else(|| violation(format!("driver returned unknown buffer {}", buf.index)))?;
        if slot.owner != Ownership::WithKernel {
            return Err(violation(format!(
                "driver returned buffer {} which was not queued",
                buf.index
            )));
        }

        slot.owner = Ownership::WithApplication;
        Ok(())
    }

    /// Take every slot back after the driver gave up all of them, either
    /// because streaming stopped or because the descriptor was closed.
    pub fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            slot.owner = Ownership::WithApplication;
        }
    }

    /// The first `len` bytes of slot `index`, if the application owns it.
    pub fn bytes(&self, index: u32, len: u32) -> Option<&[u8]> {
        let slot = self.slots.get(index as usize)?;
        if slot.owner != Ownership::WithApplication {
            return None;
        }
        slot.region.get(..len as usize)
    }

    /// Free every region. Regions still queued with the driver are leaked.
    pub fn release(mut self) -> ReleaseSummary {
        self.free_slots()
    }

    fn free_slots(&mut self) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();
        for (index, slot) in mem::take(&mut self.slots).into_iter().enumerate() {
            if slot.owner == Ownership::WithKernel {
                error!("buffer {index} is still queued with the driver; leaking it");
                Box::leak(slot.region);
                summary.leaked += 1;
            } else {
                summary.freed += 1;
            }
        }
        summary
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot_count(&self) -> u32 {
        // Bounded by MAX_BUFFER_COUNT at allocation.
        self.slots.len() as u32
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.free_slots();
    }
}
