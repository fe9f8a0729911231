//! # Shader Code Heap
//!
//! One device buffer holds the machine code of every resident shader. The
//! hardware addresses code as an offset from a single base register, so the
//! whole area moves when it grows.
//!
//! ```text
//! ┌─────────┬──────────┬────────┬──────────┬──────────────────────────┐
//! │ library │ shader A │  free  │ shader B │           free           │
//! └─────────┴──────────┴────────┴──────────┴──────────────────────────┘
//!  0                                                          capacity
//! ```
//!
//! When first fit fails, every shader is evicted (the builtin library is
//! pinned), the area grows by doubling up to a ceiling if the working set
//! still does not fit, and the shaders the caller still has bound are placed
//! again. Any eviction or growth bumps the generation so contexts know their
//! program bindings are stale.

use alloc::vec;
use alloc::vec::Vec;

use basalt_core::{BoHandle, ByteSize, Error, Fence, GpuAddr, MemoryDomain, Result, ShaderId};

use crate::bo::Allocation;
use crate::manager::MemoryManager;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Code heap configuration
#[derive(Debug, Clone, Copy)]
pub struct CodeHeapConfig {
    /// Size of the first code buffer
    pub initial_size: ByteSize,
    /// Growth ceiling
    pub max_size: ByteSize,
    /// Alignment of every code block
    pub alignment: u64,
    /// Bytes reserved for the builtin library at offset 0
    pub library_size: ByteSize,
}

impl CodeHeapConfig {
    /// 128 KiB growing up to 8 MiB
    pub const fn new() -> Self {
        Self {
            initial_size: ByteSize::from_kib(128),
            max_size: ByteSize::from_mib(8),
            alignment: 0x80,
            library_size: ByteSize::from_kib(1),
        }
    }
}

impl Default for CodeHeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// BLOCKS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeOwner {
    Library,
    Shader(ShaderId),
}

#[derive(Debug, Clone, Copy)]
struct CodeBlock {
    offset: u64,
    size: u64,
    owner: CodeOwner,
}

const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// First-fit placement into an offset-sorted block list
fn place(blocks: &mut Vec<CodeBlock>, capacity: u64, alignment: u64, owner: CodeOwner, size: u64) -> Option<u64> {
    let mut cursor = 0;
    let mut slot = None;
    for (i, block) in blocks.iter().enumerate() {
        let start = align_up(cursor, alignment);
        if start + size <= block.offset {
            slot = Some((i, start));
            break;
        }
        cursor = block.offset + block.size;
    }
    let (index, offset) = match slot {
        Some(found) => found,
        None => {
            let start = align_up(cursor, alignment);
            if start + size > capacity {
                return None;
            }
            (blocks.len(), start)
        }
    };
    blocks.insert(index, CodeBlock { offset, size, owner });
    Some(offset)
}

// =============================================================================
// CODE HEAP
// =============================================================================

/// Outcome of [`CodeHeap::install`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Offset of the installed shader
    pub offset: u64,
    /// Shaders removed from the heap
    pub evicted: Vec<ShaderId>,
    /// Still-needed shaders placed again, with their new offsets
    pub reinstalled: Vec<(ShaderId, u64)>,
    /// The code buffer moved; base address and library must be re-emitted
    pub grown: bool,
}

/// Code heap statistics
#[derive(Debug, Clone, Default)]
pub struct CodeHeapStats {
    /// Successful installs
    pub installs: u64,
    /// Evict-all events
    pub evictions: u64,
    /// Growth steps
    pub growths: u64,
    /// Installs that failed permanently
    pub failures: u64,
}

/// Shader machine-code area
#[derive(Debug)]
pub struct CodeHeap {
    config: CodeHeapConfig,
    storage: Allocation,
    blocks: Vec<CodeBlock>,
    generation: u64,
    stats: CodeHeapStats,
}

impl CodeHeap {
    /// Allocate the initial code buffer and reserve the library block
    pub fn new(memory: &mut MemoryManager, config: CodeHeapConfig) -> Result<Self> {
        if config.library_size >= config.initial_size || config.initial_size > config.max_size {
            return Err(Error::InvalidParameter);
        }
        let storage = memory.allocate(config.initial_size, MemoryDomain::Vram)?;
        let library = CodeBlock {
            offset: 0,
            size: align_up(config.library_size.as_bytes(), config.alignment),
            owner: CodeOwner::Library,
        };
        Ok(Self {
            config,
            storage,
            blocks: vec![library],
            generation: 0,
            stats: CodeHeapStats::default(),
        })
    }

    /// GPU address code offsets are relative to
    pub fn base(&self) -> GpuAddr {
        self.storage.addr()
    }

    /// Kernel object holding the code
    pub fn bo_handle(&self) -> BoHandle {
        self.storage.bo().handle
    }

    /// Current capacity
    pub fn capacity(&self) -> ByteSize {
        self.storage.size()
    }

    /// Bumped on every eviction and growth
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Offset of the builtin library
    pub fn library_offset(&self) -> u64 {
        0
    }

    /// Offset of a resident shader
    pub fn offset_of(&self, id: ShaderId) -> Option<u64> {
        self.blocks
            .iter()
            .find(|b| b.owner == CodeOwner::Shader(id))
            .map(|b| b.offset)
    }

    /// Number of resident shaders, not counting the library
    pub fn resident(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b.owner, CodeOwner::Shader(_)))
            .count()
    }

    /// Free the block of a destroyed shader
    pub fn remove(&mut self, id: ShaderId) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|b| b.owner != CodeOwner::Shader(id));
        before != self.blocks.len()
    }

    /// Make `id` resident with `size` bytes of code
    ///
    /// `still_needed` lists the shaders the caller has bound and must keep
    /// resident across an eviction. `fence` guards the old buffer if the heap
    /// has to move.
    pub fn install(
        &mut self,
        memory: &mut MemoryManager,
        id: ShaderId,
        size: u64,
        still_needed: &[(ShaderId, u64)],
        fence: &Fence,
    ) -> Result<InstallReport> {
        if let Some(offset) = self.offset_of(id) {
            return Ok(InstallReport {
                offset,
                ..Default::default()
            });
        }
        if size == 0 {
            return Err(Error::InvalidParameter);
        }
        let alignment = self.config.alignment;
        let size = align_up(size, alignment);

        let capacity = self.storage.size().as_bytes();
        if let Some(offset) = place(&mut self.blocks, capacity, alignment, CodeOwner::Shader(id), size) {
            self.stats.installs += 1;
            return Ok(InstallReport {
                offset,
                ..Default::default()
            });
        }

        // Evict everything but the library.
        let evicted: Vec<ShaderId> = self
            .blocks
            .iter()
            .filter_map(|b| match b.owner {
                CodeOwner::Shader(sid) => Some(sid),
                CodeOwner::Library => None,
            })
            .collect();
        self.blocks.retain(|b| b.owner == CodeOwner::Library);
        self.generation += 1;
        self.stats.evictions += 1;
        log::warn!(
            "code heap full ({:?}): evicted {} shaders",
            self.storage.size(),
            evicted.len()
        );

        let requests: Vec<(ShaderId, u64)> = still_needed
            .iter()
            .filter(|(sid, _)| *sid != id)
            .map(|&(sid, sz)| (sid, align_up(sz.max(1), alignment)))
            .chain(core::iter::once((id, size)))
            .collect();

        let mut grown = false;
        let placed = loop {
            let capacity = self.storage.size().as_bytes();
            let mut trial = self.blocks.clone();
            let mut placed = Vec::with_capacity(requests.len());
            for &(sid, sz) in &requests {
                match place(&mut trial, capacity, alignment, CodeOwner::Shader(sid), sz) {
                    Some(offset) => placed.push((sid, offset)),
                    None => break,
                }
            }
            if placed.len() == requests.len() {
                self.blocks = trial;
                break placed;
            }
            if capacity >= self.config.max_size.as_bytes() {
                self.stats.failures += 1;
                log::error!(
                    "code heap exhausted at its {:?} ceiling installing {} bytes",
                    self.config.max_size,
                    size
                );
                return Err(Error::OutOfDeviceMemory);
            }
            self.grow(memory, fence)?;
            grown = true;
        };

        let mut reinstalled = placed;
        let offset = reinstalled.pop().map_or(0, |(_, offset)| offset);
        self.stats.installs += 1;
        Ok(InstallReport {
            offset,
            evicted,
            reinstalled,
            grown,
        })
    }

    fn grow(&mut self, memory: &mut MemoryManager, fence: &Fence) -> Result<()> {
        let current = self.storage.size().as_bytes();
        let target = (current * 2).min(self.config.max_size.as_bytes());
        let storage = memory.allocate(ByteSize::from_bytes(target), MemoryDomain::Vram)?;
        let old = core::mem::replace(&mut self.storage, storage);
        log::debug!(
            "code heap grown {:?} -> {:?}, now at {}",
            old.size(),
            self.storage.size(),
            self.storage.addr()
        );
        memory.release(old, [fence.clone()]);
        self.generation += 1;
        self.stats.growths += 1;
        Ok(())
    }

    /// Get statistics
    pub fn stats(&self) -> &CodeHeapStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use basalt_core::FenceTimeline;

    use crate::cache::tests::TestBackend;
    use crate::cache::CacheConfig;

    fn setup(initial_kib: u64, max_kib: u64) -> (MemoryManager, CodeHeap, Fence) {
        let mut mm = MemoryManager::new(Box::new(TestBackend::with_budget(64 << 20)), CacheConfig::new());
        let config = CodeHeapConfig {
            initial_size: ByteSize::from_kib(initial_kib),
            max_size: ByteSize::from_kib(max_kib),
            alignment: 0x80,
            library_size: ByteSize::from_bytes(0x100),
        };
        let heap = CodeHeap::new(&mut mm, config).unwrap();
        let fence = Fence::new(&Arc::new(FenceTimeline::new()));
        (mm, heap, fence)
    }

    fn sid(n: u64) -> ShaderId {
        ShaderId::new(n)
    }

    #[test]
    fn test_first_fit_after_library() {
        let (mut mm, mut heap, fence) = setup(4, 8);
        let a = heap.install(&mut mm, sid(1), 100, &[], &fence).unwrap();
        assert_eq!(a.offset, 0x100);
        let b = heap.install(&mut mm, sid(2), 0x80, &[], &fence).unwrap();
        assert_eq!(b.offset, 0x180);
        assert!(heap.remove(sid(1)));
        let c = heap.install(&mut mm, sid(3), 0x80, &[], &fence).unwrap();
        assert_eq!(c.offset, 0x100);
        assert_eq!(heap.resident(), 2);
        assert_eq!(heap.generation(), 0);
    }

    #[test]
    fn test_resident_install_is_noop() {
        let (mut mm, mut heap, fence) = setup(4, 8);
        let first = heap.install(&mut mm, sid(1), 0x200, &[], &fence).unwrap();
        let again = heap.install(&mut mm, sid(1), 0x200, &[], &fence).unwrap();
        assert_eq!(first.offset, again.offset);
        assert_eq!(heap.stats().installs, 1);
    }

    #[test]
    fn test_evict_then_reinstall_without_growth() {
        // 4 KiB: library 0x100 + 7 x 0x200 = 0xf00 used.
        let (mut mm, mut heap, fence) = setup(4, 8);
        for n in 1..=7 {
            heap.install(&mut mm, sid(n), 0x200, &[], &fence).unwrap();
        }
        let report = heap
            .install(&mut mm, sid(8), 0x200, &[(sid(2), 0x200), (sid(5), 0x200)], &fence)
            .unwrap();
        assert!(!report.grown);
        assert_eq!(report.evicted.len(), 7);
        assert_eq!(report.reinstalled.len(), 2);
        assert_eq!(heap.resident(), 3);
        assert!(heap.offset_of(sid(1)).is_none());
        assert_eq!(heap.offset_of(sid(2)), Some(0x100));
        assert_eq!(heap.offset_of(sid(8)), Some(report.offset));
        assert_eq!(heap.generation(), 1);
    }

    #[test]
    fn test_grows_within_ceiling() {
        let (mut mm, mut heap, fence) = setup(4, 16);
        let base = heap.base();
        heap.install(&mut mm, sid(1), 0xe00, &[], &fence).unwrap();
        let report = heap
            .install(&mut mm, sid(2), 0x1000, &[(sid(1), 0xe00)], &fence)
            .unwrap();
        assert!(report.grown);
        assert_eq!(heap.capacity(), ByteSize::from_kib(8));
        assert_ne!(heap.base(), base);
        assert_eq!(report.reinstalled, [(sid(1), 0x100)]);
        assert_eq!(heap.generation(), 2);
        // The old buffer stays allocated until the fence signals.
        assert_eq!(mm.pending_frees(), 1);
    }

    #[test]
    fn test_fails_only_past_ceiling() {
        let (mut mm, mut heap, fence) = setup(4, 8);
        heap.install(&mut mm, sid(1), 0x800, &[], &fence).unwrap();
        let err = heap.install(&mut mm, sid(2), 0x2000, &[(sid(1), 0x800)], &fence);
        assert_eq!(err, Err(Error::OutOfDeviceMemory));
        assert_eq!(heap.capacity(), ByteSize::from_kib(8));
        assert_eq!(heap.stats().failures, 1);
        assert_eq!(heap.stats().growths, 1);
    }
}
