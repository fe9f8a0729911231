//! # Buffer Cache
//!
//! Power-of-two suballocator on top of kernel buffer objects.
//!
//! Small requests are served from slabs split into equal chunks, one bucket
//! per chunk order; requests above the largest bucket get a dedicated object.
//! The cache only recycles what it is given back, so fence gating happens one
//! level up in [`MemoryManager`](crate::MemoryManager).

use alloc::vec::Vec;

use basalt_core::{BoHandle, ByteSize, Error, MemoryDomain, Result};

use crate::bo::{Allocation, Bo, BoAllocator, Origin};

// =============================================================================
// CACHE CONFIGURATION
// =============================================================================

/// Buffer cache configuration
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Smallest chunk order (1 << min_order bytes)
    pub min_order: u32,
    /// Largest chunk order
    pub max_order: u32,
    /// Preferred slab size
    pub slab_size: ByteSize,
    /// Alignment of dedicated objects
    pub page_size: u64,
}

impl CacheConfig {
    /// 256 B to 1 MiB chunks out of 2 MiB slabs
    pub const fn new() -> Self {
        Self {
            min_order: 8,
            max_order: 20,
            slab_size: ByteSize::from_mib(2),
            page_size: 4096,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// SLABS
// =============================================================================

#[derive(Debug)]
struct Slab {
    bo: Bo,
    /// Free chunk indices (stack for O(1) alloc/free)
    free: Vec<u32>,
    count: u32,
}

impl Slab {
    fn is_empty(&self) -> bool {
        self.free.len() as u32 == self.count
    }
}

#[derive(Debug)]
struct Bucket {
    order: u32,
    slabs: Vec<Slab>,
}

impl Bucket {
    fn chunk_size(&self) -> u64 {
        1 << self.order
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Chunk allocations
    pub chunk_allocs: u64,
    /// Dedicated allocations
    pub dedicated_allocs: u64,
    /// Slabs created
    pub slabs_created: u64,
    /// Slabs returned to the kernel
    pub slabs_trimmed: u64,
    /// Bytes handed out and not yet recycled
    pub bytes_in_use: u64,
}

// =============================================================================
// BUFFER CACHE
// =============================================================================

/// Suballocator for one memory domain
#[derive(Debug)]
pub struct BufferCache {
    domain: MemoryDomain,
    config: CacheConfig,
    buckets: Vec<Bucket>,
    stats: CacheStats,
}

impl BufferCache {
    /// Create an empty cache
    pub fn new(domain: MemoryDomain, config: CacheConfig) -> Self {
        let buckets = (config.min_order..=config.max_order)
            .map(|order| Bucket {
                order,
                slabs: Vec::new(),
            })
            .collect();
        Self {
            domain,
            config,
            buckets,
            stats: CacheStats::default(),
        }
    }

    /// Domain served by this cache
    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    fn bucket_for(&self, size: u64) -> Option<usize> {
        let order = size.max(1).next_power_of_two().trailing_zeros();
        if order > self.config.max_order {
            return None;
        }
        Some(order.saturating_sub(self.config.min_order) as usize)
    }

    /// Allocate `size` bytes
    pub fn allocate(&mut self, backend: &mut dyn BoAllocator, size: ByteSize) -> Result<Allocation> {
        if size.as_bytes() == 0 {
            return Err(Error::InvalidParameter);
        }

        let Some(index) = self.bucket_for(size.as_bytes()) else {
            let bo = backend.alloc_bo(size.align_up(self.config.page_size), self.domain)?;
            self.stats.dedicated_allocs += 1;
            self.stats.bytes_in_use += bo.size.as_bytes();
            return Ok(Allocation::new(bo, 0, size, Origin::Dedicated));
        };

        let bucket = &mut self.buckets[index];
        let chunk_size = bucket.chunk_size();

        let slab_index = match bucket.slabs.iter().position(|s| !s.free.is_empty()) {
            Some(i) => i,
            None => {
                let slab_bytes = self.config.slab_size.as_bytes().max(chunk_size);
                let bo = backend.alloc_bo(ByteSize::from_bytes(slab_bytes), self.domain)?;
                let count = (slab_bytes / chunk_size) as u32;
                log::debug!(
                    "buffer cache {:?}: new slab {:?} of {} x {} B",
                    self.domain,
                    bo.handle,
                    count,
                    chunk_size
                );
                bucket.slabs.push(Slab {
                    bo,
                    free: (0..count).rev().collect(),
                    count,
                });
                self.stats.slabs_created += 1;
                bucket.slabs.len() - 1
            }
        };

        let slab = &mut bucket.slabs[slab_index];
        let chunk = slab.free.pop().ok_or(Error::OutOfDeviceMemory)?;
        self.stats.chunk_allocs += 1;
        self.stats.bytes_in_use += chunk_size;

        Ok(Allocation::new(
            slab.bo.clone(),
            u64::from(chunk) * chunk_size,
            size,
            Origin::Chunk {
                bucket: index,
                chunk,
            },
        ))
    }

    /// Take back an allocation the GPU no longer uses
    pub fn recycle(&mut self, backend: &mut dyn BoAllocator, allocation: Allocation) {
        match allocation.origin {
            Origin::Dedicated => {
                self.stats.bytes_in_use -= allocation.bo().size.as_bytes();
                backend.free_bo(allocation.bo().clone());
            }
            Origin::Chunk { bucket, chunk } => {
                let handle = allocation.bo().handle;
                let Some(b) = self.buckets.get_mut(bucket) else {
                    log::warn!("buffer cache: recycle into unknown bucket {}", bucket);
                    return;
                };
                let chunk_size = b.chunk_size();
                match find_slab(&mut b.slabs, handle) {
                    Some(slab) => {
                        slab.free.push(chunk);
                        self.stats.bytes_in_use -= chunk_size;
                    }
                    None => log::warn!("buffer cache: recycle into unknown slab {:?}", handle),
                }
            }
        }
    }

    /// Return fully free slabs to the kernel
    pub fn trim(&mut self, backend: &mut dyn BoAllocator) -> usize {
        let mut trimmed = 0;
        for bucket in &mut self.buckets {
            let mut i = 0;
            while i < bucket.slabs.len() {
                if bucket.slabs[i].is_empty() {
                    let slab = bucket.slabs.swap_remove(i);
                    backend.free_bo(slab.bo);
                    trimmed += 1;
                } else {
                    i += 1;
                }
            }
        }
        self.stats.slabs_trimmed += trimmed as u64;
        trimmed
    }

    /// Number of live slabs
    pub fn slab_count(&self) -> usize {
        self.buckets.iter().map(|b| b.slabs.len()).sum()
    }

    /// Get statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

fn find_slab(slabs: &mut [Slab], handle: BoHandle) -> Option<&mut Slab> {
    slabs.iter_mut().find(|s| s.bo.handle == handle)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::sync::Arc;
    use basalt_core::GpuAddr;

    use crate::bo::HostMemory;

    /// Bump allocator with a byte budget
    #[derive(Debug, Default)]
    pub(crate) struct TestBackend {
        pub next: u64,
        pub budget: u64,
        pub used: u64,
        pub live: usize,
    }

    impl TestBackend {
        pub(crate) fn with_budget(budget: u64) -> Self {
            Self {
                next: 1,
                budget,
                ..Default::default()
            }
        }
    }

    impl BoAllocator for TestBackend {
        fn alloc_bo(&mut self, size: ByteSize, domain: MemoryDomain) -> Result<Bo> {
            if self.used + size.as_bytes() > self.budget {
                return Err(Error::OutOfDeviceMemory);
            }
            let handle = BoHandle::new(self.next);
            self.next += 1;
            self.used += size.as_bytes();
            self.live += 1;
            Ok(Bo {
                handle,
                addr: GpuAddr::new(handle.id() << 32),
                size,
                domain,
                host: domain
                    .is_host_visible()
                    .then(|| Arc::new(HostMemory::new(size.as_bytes() as usize))),
            })
        }

        fn free_bo(&mut self, bo: Bo) {
            self.used -= bo.size.as_bytes();
            self.live -= 1;
        }
    }

    #[test]
    fn test_chunk_reuse_after_recycle() {
        let mut backend = TestBackend::with_budget(64 << 20);
        let mut cache = BufferCache::new(MemoryDomain::Gart, CacheConfig::new());

        let a = cache.allocate(&mut backend, ByteSize::from_bytes(200)).unwrap();
        let b = cache.allocate(&mut backend, ByteSize::from_bytes(256)).unwrap();
        assert_eq!(a.bo().handle, b.bo().handle);
        assert_eq!(b.addr() - a.addr(), 256);
        assert_eq!(cache.slab_count(), 1);

        let addr = a.addr();
        cache.recycle(&mut backend, a);
        let c = cache.allocate(&mut backend, ByteSize::from_bytes(100)).unwrap();
        assert_eq!(c.addr(), addr);
    }

    #[test]
    fn test_dedicated_above_max_order() {
        let mut backend = TestBackend::with_budget(64 << 20);
        let mut cache = BufferCache::new(MemoryDomain::Vram, CacheConfig::new());
        let big = cache
            .allocate(&mut backend, ByteSize::from_bytes((1 << 20) + 1))
            .unwrap();
        assert_eq!(big.offset(), 0);
        assert_eq!(big.bo().size.as_bytes() % 4096, 0);
        assert_eq!(cache.stats().dedicated_allocs, 1);
        cache.recycle(&mut backend, big);
        assert_eq!(backend.live, 0);
    }

    #[test]
    fn test_trim_only_empty_slabs() {
        let mut backend = TestBackend::with_budget(64 << 20);
        let mut cache = BufferCache::new(MemoryDomain::Gart, CacheConfig::new());
        let keep = cache.allocate(&mut backend, ByteSize::from_bytes(256)).unwrap();
        let drop = cache.allocate(&mut backend, ByteSize::from_kib(4)).unwrap();
        cache.recycle(&mut backend, drop);
        assert_eq!(cache.trim(&mut backend), 1);
        assert_eq!(cache.slab_count(), 1);
        cache.recycle(&mut backend, keep);
        assert_eq!(cache.trim(&mut backend), 1);
        assert_eq!(backend.live, 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut backend = TestBackend::with_budget(1 << 20);
        let mut cache = BufferCache::new(MemoryDomain::Gart, CacheConfig::new());
        assert_eq!(
            cache.allocate(&mut backend, ByteSize::ZERO).map(|_| ()),
            Err(Error::InvalidParameter)
        );
    }
}
