//! # Resource Lifetime Tracker
//!
//! A resource is GPU-visible storage plus the bookkeeping that says whether
//! the GPU may still be reading or writing it.
//!
//! Status bits are set when a submission references the resource and the
//! matching fence is attached at the same time. A bit is only cleared after
//! its fence has been observed signalled, so `GPU_WRITING` can never drop
//! while a write is still in flight.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use bytemuck::Pod;
use spin::Mutex;

use basalt_core::{
    Access, BoHandle, ByteSize, Error, Fence, FenceWaiter, GpuAddr, MemoryDomain, ResourceId,
    Result, Timeout,
};

use crate::bo::Allocation;
use crate::tracker::RetireQueue;

// =============================================================================
// STATUS
// =============================================================================

bitflags! {
    /// GPU/CPU usage status of a resource
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceStatus: u8 {
        /// A submission reads the resource
        const GPU_READING = 1 << 0;
        /// A submission writes the resource
        const GPU_WRITING = 1 << 1;
        /// The CPU wrote data the GPU has not consumed yet
        const CPU_DIRTY = 1 << 2;
    }
}

impl ResourceStatus {
    fn for_access(access: Access) -> Self {
        let mut status = Self::empty();
        if access.contains(Access::READ) {
            status |= Self::GPU_READING;
        }
        if access.contains(Access::WRITE) {
            status |= Self::GPU_WRITING;
        }
        status
    }
}

// =============================================================================
// DESCRIPTION
// =============================================================================

/// What the resource is used as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Linear buffer
    Buffer,
    /// Texture or render target storage
    Image,
}

/// Creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDesc {
    /// Usage kind
    pub kind: ResourceKind,
    /// Size in bytes
    pub size: ByteSize,
    /// Placement
    pub domain: MemoryDomain,
}

impl ResourceDesc {
    /// Linear buffer in `domain`
    pub const fn buffer(size: u64, domain: MemoryDomain) -> Self {
        Self {
            kind: ResourceKind::Buffer,
            size: ByteSize::from_bytes(size),
            domain,
        }
    }

    /// Image storage in VRAM
    pub const fn image(size: u64) -> Self {
        Self {
            kind: ResourceKind::Image,
            size: ByteSize::from_bytes(size),
            domain: MemoryDomain::Vram,
        }
    }
}

// =============================================================================
// RESOURCE
// =============================================================================

#[derive(Debug)]
struct ResourceState {
    storage: Option<Allocation>,
    status: ResourceStatus,
    read_fence: Option<Fence>,
    write_fence: Option<Fence>,
    /// Bumped on every storage replacement
    generation: u32,
}

impl ResourceState {
    /// Drop fences that have signalled together with their status bits
    fn refresh(&mut self) {
        if self.read_fence.as_ref().is_some_and(Fence::is_signalled) {
            self.read_fence = None;
            self.status.remove(ResourceStatus::GPU_READING);
        }
        if self.write_fence.as_ref().is_some_and(Fence::is_signalled) {
            self.write_fence = None;
            self.status.remove(ResourceStatus::GPU_WRITING);
        }
    }

    fn busy(&self, access: Access) -> bool {
        let reading = access.contains(Access::READ)
            && self.status.contains(ResourceStatus::GPU_READING);
        let writing = access.contains(Access::WRITE)
            && self.status.contains(ResourceStatus::GPU_WRITING);
        reading || writing
    }

    fn fences(&self) -> Vec<Fence> {
        self.read_fence
            .iter()
            .chain(self.write_fence.iter())
            .cloned()
            .collect()
    }
}

/// Shared handle to a resource
pub type ResourceRef = Arc<Resource>;

/// GPU-visible allocation with usage tracking
#[derive(Debug)]
pub struct Resource {
    id: ResourceId,
    desc: ResourceDesc,
    state: Mutex<ResourceState>,
    retire: RetireQueue,
}

impl Resource {
    /// Wrap `storage`; it is handed to `retire` when the last owner drops
    pub fn new(id: ResourceId, desc: ResourceDesc, storage: Allocation, retire: RetireQueue) -> Self {
        Self {
            id,
            desc,
            state: Mutex::new(ResourceState {
                storage: Some(storage),
                status: ResourceStatus::empty(),
                read_fence: None,
                write_fence: None,
                generation: 0,
            }),
            retire,
        }
    }

    /// Resource id
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Creation parameters
    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    /// Size in bytes
    pub fn size(&self) -> ByteSize {
        self.desc.size
    }

    /// Placement
    pub fn domain(&self) -> MemoryDomain {
        self.desc.domain
    }

    /// GPU address of the current storage
    pub fn gpu_addr(&self) -> GpuAddr {
        self.state
            .lock()
            .storage
            .as_ref()
            .map_or(GpuAddr::null(), Allocation::addr)
    }

    /// Kernel object backing the current storage
    pub fn bo_handle(&self) -> BoHandle {
        self.state
            .lock()
            .storage
            .as_ref()
            .map_or(BoHandle::null(), |s| s.bo().handle)
    }

    /// Number of storage replacements so far
    pub fn generation(&self) -> u32 {
        self.state.lock().generation
    }

    /// Current status, after dropping signalled fences
    pub fn status(&self) -> ResourceStatus {
        let mut state = self.state.lock();
        state.refresh();
        state.status
    }

    /// Record that the pending stream accesses the resource
    ///
    /// Marking WRITE never clears GPU_READING.
    pub fn mark_access(&self, access: Access) {
        self.state.lock().status |= ResourceStatus::for_access(access);
    }

    /// Attach the fence of the submission that performs `access`
    ///
    /// Fences of one timeline are monotonic, so the newest replaces the
    /// previous fence of the same access kind.
    pub fn attach_fence(&self, fence: &Fence, access: Access) {
        let mut state = self.state.lock();
        if access.contains(Access::READ) {
            state.read_fence = Some(fence.clone());
        }
        if access.contains(Access::WRITE) {
            state.write_fence = Some(fence.clone());
        }
    }

    /// Check if the GPU may still perform any of `access`
    pub fn is_busy(&self, access: Access) -> bool {
        let mut state = self.state.lock();
        state.refresh();
        state.busy(access)
    }

    /// Block until the GPU has finished every `access` to the resource
    ///
    /// A status bit without a fence means the access was recorded but never
    /// fenced and there is nothing to wait on.
    pub fn wait(&self, access: Access, waiter: &mut dyn FenceWaiter, timeout: Timeout) -> Result<()> {
        let pending: Vec<Fence> = {
            let mut state = self.state.lock();
            state.refresh();
            if !state.busy(access) {
                return Ok(());
            }
            let mut fences = Vec::new();
            if access.contains(Access::READ) && state.status.contains(ResourceStatus::GPU_READING) {
                fences.push(state.read_fence.clone().ok_or(Error::InvalidState)?);
            }
            if access.contains(Access::WRITE) && state.status.contains(ResourceStatus::GPU_WRITING) {
                fences.push(state.write_fence.clone().ok_or(Error::InvalidState)?);
            }
            fences
        };

        for fence in &pending {
            fence.wait(waiter, timeout)?;
        }
        self.state.lock().refresh();
        Ok(())
    }

    /// Set or clear CPU_DIRTY
    pub fn set_cpu_dirty(&self, dirty: bool) {
        self.state.lock().status.set(ResourceStatus::CPU_DIRTY, dirty);
    }

    /// Swap in fresh storage, retiring the old one behind its fences
    ///
    /// The resource becomes idle; bindings that captured the old address must
    /// be re-emitted by the caller.
    pub fn replace_storage(&self, storage: Allocation) {
        let (old, fences) = {
            let mut state = self.state.lock();
            state.refresh();
            let fences = state.fences();
            let old = state.storage.replace(storage);
            state.status = ResourceStatus::empty();
            state.read_fence = None;
            state.write_fence = None;
            state.generation = state.generation.wrapping_add(1);
            (old, fences)
        };
        log::trace!("resource {:?}: storage replaced, {} fences outstanding", self.id, fences.len());
        if let Some(old) = old {
            self.retire.retire(old, fences);
        }
    }

    /// Run `f` on the current storage
    pub fn with_storage<R>(&self, f: impl FnOnce(&Allocation) -> Result<R>) -> Result<R> {
        let state = self.state.lock();
        let storage = state.storage.as_ref().ok_or(Error::InvalidState)?;
        f(storage)
    }

    /// Copy bytes out of host-visible storage without synchronization
    pub fn read_unsynchronized(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.with_storage(|s| s.read(offset, out))
    }

    /// Copy bytes into host-visible storage without synchronization
    pub fn write_unsynchronized(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_storage(|s| s.write(offset, data))
    }

    /// Read a plain-old-data value without synchronization
    pub fn read_pod_unsynchronized<T: Pod>(&self, offset: u64) -> Result<T> {
        self.with_storage(|s| s.read_pod(offset))
    }

    /// Write a plain-old-data value without synchronization
    pub fn write_pod_unsynchronized<T: Pod>(&self, offset: u64, value: &T) -> Result<()> {
        self.with_storage(|s| s.write_pod(offset, value))
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.refresh();
        let fences = state.fences();
        if let Some(storage) = state.storage.take() {
            log::trace!("Destroying resource {:?} ({} fences outstanding)", self.id, fences.len());
            self.retire.retire(storage, fences);
        }
    }
}

static_assertions::assert_impl_all!(Resource: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::FenceTimeline;

    use crate::bo::{Bo, HostMemory, Origin};

    fn storage(handle: u64) -> Allocation {
        Allocation::new(
            Bo {
                handle: BoHandle::new(handle),
                addr: GpuAddr::new(handle << 20),
                size: ByteSize::from_kib(4),
                domain: MemoryDomain::Gart,
                host: Some(Arc::new(HostMemory::new(4096))),
            },
            0,
            ByteSize::from_kib(4),
            Origin::Dedicated,
        )
    }

    fn resource(retire: &RetireQueue) -> Resource {
        Resource::new(
            ResourceId::new(1),
            ResourceDesc::buffer(4096, MemoryDomain::Gart),
            storage(1),
            retire.clone(),
        )
    }

    struct Signaller;

    impl FenceWaiter for Signaller {
        fn wait_fence(&mut self, fence: &Fence, _timeout: Timeout) -> Result<bool> {
            if !fence.is_emitted() {
                fence.emit()?;
            }
            fence.timeline().signal(fence.timeline().last_emitted());
            Ok(true)
        }
    }

    #[test]
    fn test_busy_until_signalled() {
        let timeline = Arc::new(FenceTimeline::new());
        let res = resource(&RetireQueue::new());
        let fence = Fence::new(&timeline);

        res.mark_access(Access::WRITE);
        res.attach_fence(&fence, Access::WRITE);
        assert!(res.is_busy(Access::WRITE));
        assert!(res.is_busy(Access::READ_WRITE));
        assert!(!res.is_busy(Access::READ));

        fence.emit().unwrap();
        assert!(res.is_busy(Access::WRITE));
        assert!(res.status().contains(ResourceStatus::GPU_WRITING));

        timeline.signal(1);
        assert!(!res.is_busy(Access::WRITE));
        assert!(res.status().is_empty());
    }

    #[test]
    fn test_write_keeps_reading() {
        let timeline = Arc::new(FenceTimeline::new());
        let res = resource(&RetireQueue::new());
        let read = Fence::new(&timeline);
        let write = Fence::new(&timeline);

        res.mark_access(Access::READ);
        res.attach_fence(&read, Access::READ);
        res.mark_access(Access::WRITE);
        res.attach_fence(&write, Access::WRITE);
        assert_eq!(
            res.status(),
            ResourceStatus::GPU_READING | ResourceStatus::GPU_WRITING
        );

        write.emit().unwrap();
        read.emit().unwrap();
        timeline.signal(1);
        assert_eq!(res.status(), ResourceStatus::GPU_READING);
    }

    #[test]
    fn test_newest_fence_supersedes() {
        let timeline = Arc::new(FenceTimeline::new());
        let res = resource(&RetireQueue::new());
        let first = Fence::new(&timeline);
        let second = Fence::new(&timeline);
        first.emit().unwrap();
        second.emit().unwrap();

        res.mark_access(Access::READ);
        res.attach_fence(&first, Access::READ);
        res.attach_fence(&second, Access::READ);
        timeline.signal(1);
        assert!(res.is_busy(Access::READ));
        timeline.signal(2);
        assert!(!res.is_busy(Access::READ));
    }

    #[test]
    fn test_wait_emits_and_clears() {
        let timeline = Arc::new(FenceTimeline::new());
        let res = resource(&RetireQueue::new());
        let fence = Fence::new(&timeline);
        res.mark_access(Access::READ_WRITE);
        res.attach_fence(&fence, Access::READ_WRITE);

        res.wait(Access::READ_WRITE, &mut Signaller, Timeout::from_millis(10))
            .unwrap();
        assert!(!res.is_busy(Access::READ_WRITE));
    }

    #[test]
    fn test_unfenced_access_cannot_wait() {
        let res = resource(&RetireQueue::new());
        res.mark_access(Access::WRITE);
        assert!(res.is_busy(Access::WRITE));
        assert_eq!(
            res.wait(Access::WRITE, &mut Signaller, Timeout::ZERO),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn test_drop_retires_with_fences() {
        let timeline = Arc::new(FenceTimeline::new());
        let retire = RetireQueue::new();
        let fence = Fence::new(&timeline);
        {
            let res = resource(&retire);
            res.mark_access(Access::READ);
            res.attach_fence(&fence, Access::READ);
        }
        let retired = retire.take();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].fences.len(), 1);
        assert!(retired[0].fences[0].ptr_eq(&fence));
    }

    #[test]
    fn test_replace_storage() {
        let timeline = Arc::new(FenceTimeline::new());
        let retire = RetireQueue::new();
        let res = resource(&retire);
        let fence = Fence::new(&timeline);
        res.mark_access(Access::READ);
        res.attach_fence(&fence, Access::READ);
        let before = res.gpu_addr();

        res.replace_storage(storage(2));
        assert_ne!(res.gpu_addr(), before);
        assert!(!res.is_busy(Access::READ_WRITE));
        assert_eq!(res.generation(), 1);
        assert_eq!(retire.len(), 1);
    }
}
