//! # Push Buffer
//!
//! Per-context command stream plus the buffer list and fence of the batch
//! being recorded. Every resource the batch touches gets the pending fence
//! attached at reference time; the fence only receives its sequence number
//! when the batch is handed to the [`GpuChannel`].

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use basalt_core::{
    Access, BoHandle, Error, Fence, FenceWaiter, MemoryDomain, Pipeline, Result, Timeout,
};
use basalt_mem::ResourceRef;

use crate::bufctx::BindingRef;
use crate::channel::{BufferEntry, GpuChannel};
use crate::record::Record;
use crate::stream::CommandStream;

/// Push buffer statistics
#[derive(Debug, Clone, Default)]
pub struct PushStats {
    /// Batches submitted
    pub flushes: u64,
    /// Flushes forced by a full stream
    pub auto_flushes: u64,
    /// Records pushed
    pub records: u64,
    /// Resource references registered
    pub references: u64,
}

/// Recording side of one context's submissions
#[derive(Debug)]
pub struct PushBuffer {
    channel: Arc<GpuChannel>,
    stream: CommandStream,
    refs: HashMap<BoHandle, BufferEntry>,
    /// Fence of the batch being recorded; unemitted
    fence: Fence,
    last: Option<Fence>,
    /// Per pipeline: a flush happened since the flag was last taken
    flushed: [bool; 2],
    stats: PushStats,
}

impl PushBuffer {
    /// Create a push buffer holding up to `capacity` records per batch
    pub fn new(channel: Arc<GpuChannel>, capacity: usize) -> Self {
        let fence = Fence::new(channel.timeline());
        Self {
            channel,
            stream: CommandStream::new(capacity),
            refs: HashMap::new(),
            fence,
            last: None,
            flushed: [false; 2],
            stats: PushStats::default(),
        }
    }

    /// Channel the batches go to
    pub fn channel(&self) -> &Arc<GpuChannel> {
        &self.channel
    }

    /// Append a record, flushing first if the stream is full
    pub fn push(&mut self, record: Record) -> Result<()> {
        if self.stream.remaining() == 0 {
            log::debug!("command stream full after {} records; flushing", self.stream.len());
            self.stats.auto_flushes += 1;
            self.flush()?;
        }
        self.stream.push(record)?;
        self.stats.records += 1;
        Ok(())
    }

    /// Append a record that reads or writes `resource`
    ///
    /// The reference is taken after the record is placed, so both land in
    /// the same batch even when the push flushed.
    pub fn push_ref(&mut self, record: Record, resource: &ResourceRef, access: Access) -> Result<()> {
        self.push(record)?;
        self.reference(resource, access);
        Ok(())
    }

    /// Append a record together with the buffer objects it uses
    pub fn push_using(&mut self, record: Record, uses: &[BufferEntry]) -> Result<()> {
        self.push(record)?;
        for entry in uses {
            self.reference_bo(entry.handle, entry.domain, entry.access);
        }
        Ok(())
    }

    /// Flush now unless `records` more fit in the current batch
    pub fn reserve(&mut self, records: usize) -> Result<()> {
        if self.stream.remaining() < records && !self.stream.is_empty() {
            self.stats.auto_flushes += 1;
            self.flush()?;
        }
        Ok(())
    }

    /// Register `resource` with the pending batch
    ///
    /// The resource's status and fence are updated immediately; its buffer
    /// object joins the batch's buffer list.
    pub fn reference(&mut self, resource: &ResourceRef, access: Access) {
        resource.mark_access(access);
        resource.attach_fence(&self.fence, access);
        self.reference_bo(resource.bo_handle(), resource.domain(), access);
        self.stats.references += 1;
    }

    /// Register every binding reference with the pending batch
    pub fn track<'a>(&mut self, refs: impl IntoIterator<Item = &'a BindingRef>) {
        for r in refs {
            self.reference(&r.resource, r.access);
        }
    }

    /// Add binding references to the buffer list without touching fences
    pub fn add_buffers<'a>(&mut self, refs: impl IntoIterator<Item = &'a BindingRef>) {
        for r in refs {
            self.reference_bo(r.resource.bo_handle(), r.resource.domain(), r.access);
        }
    }

    /// Add a raw buffer object whose lifetime is fenced by its owner
    pub fn reference_bo(&mut self, handle: BoHandle, domain: MemoryDomain, access: Access) {
        self.refs
            .entry(handle)
            .and_modify(|e| e.access |= access)
            .or_insert(BufferEntry {
                handle,
                domain,
                access,
            });
    }

    /// Fence the pending batch will signal
    pub fn current_fence(&self) -> &Fence {
        &self.fence
    }

    /// Fence of the last submitted batch
    pub fn last_fence(&self) -> Option<&Fence> {
        self.last.as_ref()
    }

    /// Submit the pending batch, if any
    pub fn flush(&mut self) -> Result<()> {
        self.submit(false)
    }

    fn submit(&mut self, force: bool) -> Result<()> {
        if !force && self.stream.is_empty() && self.refs.is_empty() {
            return Ok(());
        }
        let mut records = self.stream.take();
        let mut buffers: Vec<BufferEntry> = self.refs.values().copied().collect();
        buffers.sort_unstable_by_key(|e| e.handle);

        if let Err(e) = self.channel.submit(&mut records, &buffers, &self.fence) {
            // The batch stays pending under its unemitted fence.
            self.stream.restore(records);
            return Err(e);
        }
        self.refs.clear();
        let fence = core::mem::replace(&mut self.fence, Fence::new(self.channel.timeline()));
        self.flushed = [true; 2];
        self.stats.flushes += 1;
        self.last = Some(fence);
        Ok(())
    }

    /// Take the flushed flag of one pipeline
    pub fn take_flushed(&mut self, pipeline: Pipeline) -> bool {
        core::mem::take(&mut self.flushed[pipeline.index()])
    }

    /// Flush and block until everything submitted so far has completed
    pub fn finish(&mut self, timeout: Timeout) -> Result<()> {
        self.flush()?;
        match self.last.clone() {
            Some(fence) => fence.wait(self, timeout),
            None => Ok(()),
        }
    }

    /// Pending records
    pub fn records(&self) -> &[Record] {
        self.stream.records()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> &PushStats {
        &self.stats
    }
}

impl FenceWaiter for PushBuffer {
    fn wait_fence(&mut self, fence: &Fence, timeout: Timeout) -> Result<bool> {
        if !fence.is_emitted() {
            if !fence.ptr_eq(&self.fence) {
                // Recorded by another context that has not flushed yet.
                return Err(Error::Busy);
            }
            self.submit(true)?;
        }
        self.channel.wait(fence, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufctx::tests::resources;
    use crate::channel::tests::Recorder;
    use alloc::boxed::Box;
    use basalt_mem::ResourceStatus;
    use core::sync::atomic::Ordering;

    fn setup(hold: bool) -> (Arc<GpuChannel>, Recorder) {
        let recorder = Recorder {
            hold,
            ..Default::default()
        };
        let tap = Recorder {
            batches: Arc::clone(&recorder.batches),
            hold,
            reject: Arc::clone(&recorder.reject),
        };
        (Arc::new(GpuChannel::new(Box::new(recorder))), tap)
    }

    #[test]
    fn test_buffer_list_deduplicated() {
        let (_mm, res) = resources(2);
        let (channel, tap) = setup(false);
        let mut pb = PushBuffer::new(channel, 16);
        // Both resources are chunks of one slab object.
        assert_eq!(res[0].bo_handle(), res[1].bo_handle());
        pb.reference(&res[0], Access::READ);
        pb.reference(&res[0], Access::READ);
        pb.reference(&res[1], Access::WRITE);
        pb.push(Record::Serialize).unwrap();
        pb.flush().unwrap();

        let batches = tap.batches.lock();
        let buffers = &batches[0].2;
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].access, Access::READ_WRITE);
        assert_eq!(res[0].status(), ResourceStatus::empty());
        assert!(pb.take_flushed(Pipeline::Render));
        assert!(!pb.take_flushed(Pipeline::Render));
        assert!(pb.take_flushed(Pipeline::Compute));
    }

    #[test]
    fn test_auto_flush_when_full() {
        let (channel, tap) = setup(false);
        let mut pb = PushBuffer::new(channel, 2);
        for _ in 0..3 {
            pb.push(Record::Serialize).unwrap();
        }
        assert_eq!(tap.batches.lock().len(), 1);
        assert_eq!(pb.records().len(), 1);
        assert_eq!(pb.stats().auto_flushes, 1);
    }

    #[test]
    fn test_reserve_flushes_early() {
        let (channel, tap) = setup(false);
        let mut pb = PushBuffer::new(channel, 4);
        pb.reserve(4).unwrap();
        assert!(tap.batches.lock().is_empty());
        pb.push(Record::Serialize).unwrap();
        pb.reserve(2).unwrap();
        assert!(tap.batches.lock().is_empty());
        pb.reserve(4).unwrap();
        assert_eq!(tap.batches.lock().len(), 1);
        assert!(pb.is_empty());
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let (channel, tap) = setup(false);
        let mut pb = PushBuffer::new(channel, 4);
        pb.flush().unwrap();
        assert!(tap.batches.lock().is_empty());
        assert!(pb.last_fence().is_none());
    }

    #[test]
    fn test_wait_flushes_own_fence() {
        let (_mm, res) = resources(1);
        let (channel, _tap) = setup(false);
        let mut pb = PushBuffer::new(channel, 4);
        pb.reference(&res[0], Access::WRITE);
        assert_eq!(res[0].status(), ResourceStatus::GPU_WRITING);

        res[0].wait(Access::WRITE, &mut pb, Timeout::from_millis(10)).unwrap();
        assert!(!res[0].is_busy(Access::READ_WRITE));
        assert!(pb.last_fence().is_some_and(Fence::is_signalled));
    }

    #[test]
    fn test_foreign_unflushed_fence_is_busy() {
        let (_mm, res) = resources(1);
        let (channel, _tap) = setup(false);
        let mut a = PushBuffer::new(Arc::clone(&channel), 4);
        let mut b = PushBuffer::new(channel, 4);
        a.reference(&res[0], Access::WRITE);
        assert_eq!(
            res[0].wait(Access::WRITE, &mut b, Timeout::ZERO),
            Err(Error::Busy)
        );
    }

    #[test]
    fn test_rejected_flush_keeps_batch() {
        let (_mm, res) = resources(1);
        let (channel, tap) = setup(false);
        let mut pb = PushBuffer::new(channel, 4);
        pb.push_ref(Record::Serialize, &res[0], Access::WRITE).unwrap();
        let fence = pb.current_fence().clone();

        tap.reject.store(true, Ordering::Relaxed);
        assert_eq!(pb.flush(), Err(Error::SubmissionFailed));
        assert_eq!(pb.records(), [Record::Serialize]);
        assert!(pb.current_fence().ptr_eq(&fence));
        assert!(!fence.is_emitted());
        assert!(pb.last_fence().is_none());
        assert!(!pb.take_flushed(Pipeline::Render));

        tap.reject.store(false, Ordering::Relaxed);
        pb.flush().unwrap();
        let batches = tap.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1, [Record::Serialize, Record::FenceEmit { sequence: 1 }]);
        assert_eq!(batches[0].2[0].handle, res[0].bo_handle());
        drop(batches);
        res[0].wait(Access::WRITE, &mut pb, Timeout::ZERO).unwrap();
    }

    #[test]
    fn test_reference_follows_flushed_record() {
        let (_mm, res) = resources(1);
        let (channel, tap) = setup(false);
        let mut pb = PushBuffer::new(channel, 1);
        pb.push(Record::Serialize).unwrap();
        pb.push_ref(Record::Serialize, &res[0], Access::READ).unwrap();
        pb.flush().unwrap();

        let batches = tap.batches.lock();
        assert_eq!(batches.len(), 2);
        assert!(batches[0].2.is_empty());
        assert_eq!(batches[1].2.len(), 1);
    }

    #[test]
    fn test_hung_wait_is_device_lost() {
        let (channel, _tap) = setup(true);
        let mut pb = PushBuffer::new(channel, 4);
        pb.push(Record::Serialize).unwrap();
        assert_eq!(pb.finish(Timeout::from_millis(1)), Err(Error::DeviceLost));
    }
}
