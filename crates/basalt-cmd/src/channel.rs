//! # GPU Channel
//!
//! The kernel submission queue shared by every context of a screen, together
//! with the fence timeline it advances. Emission and submission happen under
//! one lock so sequence order is queue order.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use basalt_core::{Access, BoHandle, Error, Fence, FenceTimeline, MemoryDomain, Result, Timeout};

use crate::record::Record;

// =============================================================================
// SUBMISSION
// =============================================================================

/// Buffer object referenced by a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferEntry {
    /// Kernel handle
    pub handle: BoHandle,
    /// Placement
    pub domain: MemoryDomain,
    /// Union of all accesses in the submission
    pub access: Access,
}

/// One batch handed to the kernel
#[derive(Debug)]
pub struct Submission<'a> {
    /// Records in execution order, ending with the fence emission
    pub records: &'a [Record],
    /// Deduplicated buffer list
    pub buffers: &'a [BufferEntry],
    /// Sequence the batch signals on completion
    pub sequence: u64,
}

/// Kernel-side submission queue
pub trait KernelChannel: Send {
    /// Queue a batch; completion is reported by signalling `timeline`
    fn submit(&mut self, timeline: &Arc<FenceTimeline>, submission: &Submission<'_>) -> Result<()>;

    /// Block until `sequence` completes or `timeout` passes
    fn wait(&mut self, timeline: &Arc<FenceTimeline>, sequence: u64, timeout: Timeout) -> Result<bool>;
}

// =============================================================================
// GPU CHANNEL
// =============================================================================

/// Channel statistics
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// Batches submitted
    pub submissions: u64,
    /// Records submitted
    pub records: u64,
    /// Buffer entries submitted
    pub buffers: u64,
    /// Waits that expired
    pub timeouts: u64,
}

struct ChannelInner {
    kernel: Box<dyn KernelChannel>,
    stats: ChannelStats,
}

/// Shared kernel channel and fence timeline
pub struct GpuChannel {
    inner: Mutex<ChannelInner>,
    timeline: Arc<FenceTimeline>,
}

impl GpuChannel {
    /// Wrap a kernel channel with a fresh timeline
    pub fn new(kernel: Box<dyn KernelChannel>) -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                kernel,
                stats: ChannelStats::default(),
            }),
            timeline: Arc::new(FenceTimeline::new()),
        }
    }

    /// Timeline every fence of this channel lives on
    pub fn timeline(&self) -> &Arc<FenceTimeline> {
        &self.timeline
    }

    /// Hand the batch to the kernel and emit `fence` once it is accepted
    ///
    /// A [`Record::FenceEmit`] is appended to `records`. If the kernel rejects
    /// the batch the record is removed again and `fence` stays unemitted, so
    /// the caller still owns a batch it can resubmit.
    pub fn submit(&self, records: &mut Vec<Record>, buffers: &[BufferEntry], fence: &Fence) -> Result<u64> {
        if !Arc::ptr_eq(fence.timeline(), &self.timeline) {
            return Err(Error::InvalidParameter);
        }
        if fence.is_emitted() {
            return Err(Error::InvalidState);
        }
        let mut inner = self.inner.lock();
        let sequence = self.timeline.last_emitted() + 1;
        records.push(Record::FenceEmit { sequence });

        let submission = Submission {
            records: records.as_slice(),
            buffers,
            sequence,
        };
        if let Err(e) = inner.kernel.submit(&self.timeline, &submission) {
            records.pop();
            log::error!("submission {} rejected: {}", sequence, e);
            return Err(if e.is_fatal() { e } else { Error::SubmissionFailed });
        }
        let emitted = fence.emit()?;
        debug_assert_eq!(emitted, sequence);

        inner.stats.submissions += 1;
        inner.stats.records += records.len() as u64;
        inner.stats.buffers += buffers.len() as u64;
        log::trace!(
            "submitted seq {} ({} records, {} buffers)",
            sequence,
            records.len(),
            buffers.len()
        );
        Ok(sequence)
    }

    /// Block on an emitted fence
    pub fn wait(&self, fence: &Fence, timeout: Timeout) -> Result<bool> {
        let sequence = fence.sequence().ok_or(Error::InvalidState)?;
        if self.timeline.is_reached(sequence) {
            return Ok(true);
        }
        let mut inner = self.inner.lock();
        let signalled = inner.kernel.wait(&self.timeline, sequence, timeout)?;
        if !signalled {
            inner.stats.timeouts += 1;
        }
        Ok(signalled)
    }

    /// Get a snapshot of the statistics
    pub fn stats(&self) -> ChannelStats {
        self.inner.lock().stats.clone()
    }
}

impl fmt::Debug for GpuChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuChannel")
            .field("timeline", &self.timeline)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
