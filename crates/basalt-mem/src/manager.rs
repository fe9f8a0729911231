//! # Memory Manager
//!
//! Front door for every device allocation: owns the kernel allocator, one
//! buffer cache per domain and the fence-gated free queue.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

use basalt_core::{ByteSize, Error, Fence, HandleAllocator, MemoryDomain, Result};

use crate::bo::{Allocation, BoAllocator};
use crate::cache::{BufferCache, CacheConfig};
use crate::resource::{Resource, ResourceDesc, ResourceRef};
use crate::tracker::{DeferredFrees, RetireQueue};

/// Memory manager statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Successful allocations
    pub allocations: u64,
    /// Allocations that needed the out-of-memory recovery path
    pub oom_recoveries: u64,
    /// Allocations that failed after recovery
    pub oom_failures: u64,
    /// Allocations recycled into a cache
    pub recycled: u64,
    /// Resources created
    pub resources_created: u64,
}

/// Device memory front end
pub struct MemoryManager {
    backend: Box<dyn BoAllocator>,
    caches: [BufferCache; 2],
    deferred: DeferredFrees<Allocation>,
    retired: RetireQueue,
    ids: HandleAllocator,
    stats: MemoryStats,
}

impl MemoryManager {
    /// Create a manager on top of the kernel allocator
    pub fn new(backend: Box<dyn BoAllocator>, config: CacheConfig) -> Self {
        Self {
            backend,
            caches: [
                BufferCache::new(MemoryDomain::Vram, config),
                BufferCache::new(MemoryDomain::Gart, config),
            ],
            deferred: DeferredFrees::new(),
            retired: RetireQueue::new(),
            ids: HandleAllocator::new(),
            stats: MemoryStats::default(),
        }
    }

    /// Allocate `size` bytes in `domain`
    ///
    /// On exhaustion, signalled frees are recycled and empty slabs trimmed,
    /// then the allocation is retried once.
    pub fn allocate(&mut self, size: ByteSize, domain: MemoryDomain) -> Result<Allocation> {
        let cache = &mut self.caches[domain.index()];
        match cache.allocate(self.backend.as_mut(), size) {
            Ok(allocation) => {
                self.stats.allocations += 1;
                Ok(allocation)
            }
            Err(Error::OutOfDeviceMemory) => {
                log::warn!(
                    "out of device memory allocating {:?} in {:?}; reclaiming",
                    size,
                    domain
                );
                self.stats.oom_recoveries += 1;
                self.reclaim();
                self.trim();

                let cache = &mut self.caches[domain.index()];
                let allocation = cache.allocate(self.backend.as_mut(), size).inspect_err(|_| {
                    log::warn!("allocation of {:?} in {:?} failed after reclaim", size, domain);
                });
                match allocation {
                    Ok(allocation) => {
                        self.stats.allocations += 1;
                        Ok(allocation)
                    }
                    Err(e) => {
                        self.stats.oom_failures += 1;
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Give back an allocation once every fence in `fences` has signalled
    pub fn release(&mut self, allocation: Allocation, fences: impl IntoIterator<Item = Fence>) {
        if let Some(allocation) = self.deferred.push(allocation, fences) {
            self.recycle(allocation);
        }
    }

    fn recycle(&mut self, allocation: Allocation) {
        let cache = &mut self.caches[allocation.domain().index()];
        cache.recycle(self.backend.as_mut(), allocation);
        self.stats.recycled += 1;
    }

    /// Drain the retire queue and recycle everything whose fences signalled
    ///
    /// Returns the number of allocations recycled.
    pub fn reclaim(&mut self) -> usize {
        for retired in self.retired.take() {
            self.release(retired.allocation, retired.fences);
        }
        let ready = self.deferred.collect();
        let count = ready.len();
        for allocation in ready {
            self.recycle(allocation);
        }
        if count > 0 {
            log::trace!("reclaimed {} allocations, {} still pending", count, self.deferred.len());
        }
        count
    }

    /// Return empty slabs of every cache to the kernel
    pub fn trim(&mut self) -> usize {
        let mut trimmed = 0;
        for cache in &mut self.caches {
            trimmed += cache.trim(self.backend.as_mut());
        }
        trimmed
    }

    /// Create a resource with fresh storage
    pub fn create_resource(&mut self, desc: ResourceDesc) -> Result<ResourceRef> {
        let storage = self.allocate(desc.size, desc.domain)?;
        let id = self.ids.allocate();
        self.stats.resources_created += 1;
        Ok(Arc::new(Resource::new(id, desc, storage, self.retired.clone())))
    }

    /// Queue shared with resources for their retired storage
    pub fn retire_queue(&self) -> &RetireQueue {
        &self.retired
    }

    /// Allocations waiting for fences (not counting the retire queue)
    pub fn pending_frees(&self) -> usize {
        self.deferred.len()
    }

    /// Cache of one domain
    pub fn cache(&self, domain: MemoryDomain) -> &BufferCache {
        &self.caches[domain.index()]
    }

    /// Get statistics
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("caches", &self.caches)
            .field("pending_frees", &self.deferred.len())
            .field("retired", &self.retired.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::{Access, FenceTimeline};

    use crate::cache::tests::TestBackend;

    fn manager(budget: u64) -> MemoryManager {
        MemoryManager::new(Box::new(TestBackend::with_budget(budget)), CacheConfig::new())
    }

    #[test]
    fn test_pending_memory_not_reused() {
        let timeline = Arc::new(FenceTimeline::new());
        let mut mm = manager(64 << 20);

        let first = mm.allocate(ByteSize::from_bytes(512), MemoryDomain::Gart).unwrap();
        let addr = first.addr();
        let fence = Fence::new(&timeline);
        fence.emit().unwrap();
        mm.release(first, [fence]);
        assert_eq!(mm.pending_frees(), 1);

        let second = mm.allocate(ByteSize::from_bytes(512), MemoryDomain::Gart).unwrap();
        assert_ne!(second.addr(), addr);

        timeline.signal(1);
        assert_eq!(mm.reclaim(), 1);
        let third = mm.allocate(ByteSize::from_bytes(512), MemoryDomain::Gart).unwrap();
        assert_eq!(third.addr(), addr);
    }

    #[test]
    fn test_oom_recovers_through_reclaim() {
        let timeline = Arc::new(FenceTimeline::new());
        // Room for exactly one dedicated 4 MiB object.
        let mut mm = manager(4 << 20);
        let size = ByteSize::from_mib(4);

        let first = mm.allocate(size, MemoryDomain::Vram).unwrap();
        let fence = Fence::new(&timeline);
        fence.emit().unwrap();
        mm.release(first, [fence]);

        assert_eq!(
            mm.allocate(size, MemoryDomain::Vram).map(|_| ()),
            Err(Error::OutOfDeviceMemory)
        );
        assert_eq!(mm.stats().oom_failures, 1);

        timeline.signal(1);
        assert!(mm.allocate(size, MemoryDomain::Vram).is_ok());
        assert_eq!(mm.stats().oom_recoveries, 2);
    }

    #[test]
    fn test_oom_recovers_through_trim() {
        let mut mm = manager(2 << 20);
        let small = mm.allocate(ByteSize::from_bytes(256), MemoryDomain::Gart).unwrap();
        mm.release(small, []);
        // The empty 2 MiB slab blocks the dedicated object until trimmed.
        assert!(mm.allocate(ByteSize::from_mib(2), MemoryDomain::Gart).is_ok());
        assert_eq!(mm.cache(MemoryDomain::Gart).slab_count(), 0);
    }

    #[test]
    fn test_dropped_resource_recycled_after_fence() {
        let timeline = Arc::new(FenceTimeline::new());
        let mut mm = manager(64 << 20);
        let res = mm
            .create_resource(ResourceDesc::buffer(1024, MemoryDomain::Gart))
            .unwrap();
        let addr = res.gpu_addr();
        let fence = Fence::new(&timeline);
        res.mark_access(Access::READ);
        res.attach_fence(&fence, Access::READ);
        drop(res);

        assert_eq!(mm.reclaim(), 0);
        assert_eq!(mm.pending_frees(), 1);
        let other = mm.allocate(ByteSize::from_kib(1), MemoryDomain::Gart).unwrap();
        assert_ne!(other.addr(), addr);

        fence.emit().unwrap();
        timeline.signal(1);
        assert_eq!(mm.reclaim(), 1);
        assert_eq!(mm.pending_frees(), 0);
    }
}
