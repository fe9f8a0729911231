//! # Screen
//!
//! Device-wide state shared by every context: memory, the shader code heap,
//! the descriptor heaps and the record of which context the hardware is
//! currently set up for. All of it sits behind one coarse lock; the channel
//! and fence timeline have their own.
//!
//! ```text
//! ┌──────────────────────── Screen ────────────────────────┐
//! │  Mutex<ScreenShared>                                   │
//! │   ├── MemoryManager      ├── DescriptorHeap (texture)  │
//! │   ├── CodeHeap           ├── DescriptorHeap (sampler)  │
//! │   ├── ContextArbiter     └── ShaderCompiler            │
//! │  Arc<GpuChannel> ◀─── one PushBuffer per Context       │
//! └────────────────────────────────────────────────────────┘
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

use basalt_cmd::{DescriptorTable, GpuChannel, KernelChannel};
use basalt_core::{
    ContextId, GpuAddr, HandleAllocator, Result, SamplerId, ShaderCompiler, ShaderIr, Timeout,
    ViewId,
};
use basalt_mem::{
    BoAllocator, CacheConfig, CodeHeap, CodeHeapConfig, CodeHeapStats, MemoryManager, MemoryStats,
    ResourceDesc, ResourceRef,
};

use crate::descriptor::{DescriptorHeap, HeapStats};
use crate::program::{Program, ProgramRef};
use crate::state::{SamplerState, SamplerView};

/// Builtin routines placed at offset 0 of every code buffer
pub const BUILTIN_LIBRARY: [u32; 8] = [
    0x0000_0001, 0xe290_0000, 0x0000_0007, 0xe300_0000, 0x0000_0003, 0x5000_0c00, 0x0000_0007,
    0xe300_0000,
];

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Screen configuration
#[derive(Debug, Clone, Copy)]
pub struct ScreenConfig {
    /// Buffer cache layout, shared by both domains
    pub cache: CacheConfig,
    /// Shader code heap sizing
    pub code_heap: CodeHeapConfig,
    /// Longest a fence wait may take before the device counts as lost
    pub fence_timeout: Timeout,
    /// Records per push buffer batch
    pub push_capacity: usize,
    /// Texture descriptor table entries
    pub texture_heap_size: u32,
    /// Sampler descriptor table entries
    pub sampler_heap_size: u32,
}

impl ScreenConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            cache: CacheConfig::new(),
            code_heap: CodeHeapConfig::new(),
            fence_timeout: Timeout::from_millis(2000),
            push_capacity: 4096,
            texture_heap_size: 2048,
            sampler_heap_size: 256,
        }
    }
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CONTEXT ARBITER
// =============================================================================

/// Tracks which context the hardware state belongs to
#[derive(Debug, Clone, Default)]
pub struct ContextArbiter {
    current: Option<ContextId>,
    switches: u64,
}

impl ContextArbiter {
    /// Create an arbiter with no current context
    pub const fn new() -> Self {
        Self {
            current: None,
            switches: 0,
        }
    }

    /// Make `id` current; returns whether the hardware changed hands
    pub fn switch_to(&mut self, id: ContextId) -> bool {
        if self.current == Some(id) {
            return false;
        }
        log::debug!("hardware context {:?} -> {:?}", self.current, id);
        self.current = Some(id);
        self.switches += 1;
        true
    }

    /// Forget `id` if it is current
    pub fn release(&mut self, id: ContextId) {
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Context the hardware is set up for
    pub fn current(&self) -> Option<ContextId> {
        self.current
    }

    /// Number of switches so far
    pub fn switches(&self) -> u64 {
        self.switches
    }
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// Everything behind the screen lock
pub struct ScreenShared {
    /// Buffer memory
    pub memory: MemoryManager,
    /// Shader machine code
    pub code: CodeHeap,
    /// Texture descriptors, keyed by view
    pub textures: DescriptorHeap<ViewId>,
    /// Sampler descriptors, keyed by sampler
    pub samplers: DescriptorHeap<SamplerId>,
    /// Current hardware context
    pub arbiter: ContextArbiter,
    /// Shader translator
    pub compiler: Box<dyn ShaderCompiler>,
    /// Code buffer the builtin library was last uploaded to
    pub library_base: Option<GpuAddr>,
}

impl fmt::Debug for ScreenShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenShared")
            .field("memory", &self.memory)
            .field("code", &self.code)
            .field("textures", &self.textures)
            .field("samplers", &self.samplers)
            .field("arbiter", &self.arbiter)
            .field("library_base", &self.library_base)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// SCREEN
// =============================================================================

/// Device health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Operating normally
    Ok,
    /// A fence never signalled; every further draw fails
    Lost,
}

/// Device-wide state shared by contexts
#[derive(Debug)]
pub struct Screen {
    shared: Mutex<ScreenShared>,
    channel: Arc<GpuChannel>,
    lost: AtomicBool,
    config: ScreenConfig,
    ids: HandleAllocator,
}

impl Screen {
    /// Bring up a screen on top of the kernel collaborators
    pub fn new(
        allocator: Box<dyn BoAllocator>,
        kernel: Box<dyn KernelChannel>,
        compiler: Box<dyn ShaderCompiler>,
        config: ScreenConfig,
    ) -> Result<Arc<Self>> {
        let mut memory = MemoryManager::new(allocator, config.cache);
        let code = CodeHeap::new(&mut memory, config.code_heap)?;
        log::debug!(
            "screen up: code heap {:?} at {}, {} texture / {} sampler descriptors",
            code.capacity(),
            code.base(),
            config.texture_heap_size,
            config.sampler_heap_size
        );
        Ok(Arc::new(Self {
            shared: Mutex::new(ScreenShared {
                memory,
                code,
                textures: DescriptorHeap::new(DescriptorTable::Texture, config.texture_heap_size),
                samplers: DescriptorHeap::new(DescriptorTable::Sampler, config.sampler_heap_size),
                arbiter: ContextArbiter::new(),
                compiler,
                library_base: None,
            }),
            channel: Arc::new(GpuChannel::new(kernel)),
            lost: AtomicBool::new(false),
            config,
            ids: HandleAllocator::new(),
        }))
    }

    /// Configuration the screen was created with
    pub fn config(&self) -> &ScreenConfig {
        &self.config
    }

    /// Submission channel
    pub fn channel(&self) -> &Arc<GpuChannel> {
        &self.channel
    }

    /// Take the screen lock
    pub fn lock(&self) -> MutexGuard<'_, ScreenShared> {
        self.shared.lock()
    }

    /// Device health
    pub fn status(&self) -> DeviceStatus {
        if self.lost.load(Ordering::Acquire) {
            DeviceStatus::Lost
        } else {
            DeviceStatus::Ok
        }
    }

    /// Record that the device stopped making progress
    pub fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("device lost; all further work is refused");
        }
    }

    /// Allocate an id for a new context
    pub fn allocate_context_id(&self) -> ContextId {
        self.ids.allocate()
    }

    /// Create a resource with fresh storage
    pub fn create_resource(&self, desc: ResourceDesc) -> Result<ResourceRef> {
        self.shared.lock().memory.create_resource(desc)
    }

    /// Wrap shader IR; translation happens on first use
    pub fn create_program(&self, ir: ShaderIr) -> ProgramRef {
        Arc::new(Program::new(self.ids.allocate(), ir))
    }

    /// Drop a program's code from the heap
    pub fn destroy_program(&self, program: &ProgramRef) -> bool {
        self.shared.lock().code.remove(program.id())
    }

    /// Create a texture view over `resource`
    pub fn create_view(&self, resource: &ResourceRef, format: u16) -> SamplerView {
        SamplerView {
            id: self.ids.allocate(),
            resource: Arc::clone(resource),
            format,
        }
    }

    /// Create a sampler state object
    pub fn create_sampler(&self, descriptor: u64) -> SamplerState {
        SamplerState {
            id: self.ids.allocate(),
            descriptor,
        }
    }

    /// Forget a destroyed view's descriptor
    pub fn destroy_view(&self, view: &SamplerView) -> bool {
        self.shared.lock().textures.remove(view.id)
    }

    /// Recycle memory whose fences signalled
    pub fn reclaim(&self) -> usize {
        self.shared.lock().memory.reclaim()
    }

    /// Memory statistics
    pub fn memory_stats(&self) -> MemoryStats {
        self.shared.lock().memory.stats().clone()
    }

    /// Code heap statistics
    pub fn code_stats(&self) -> CodeHeapStats {
        self.shared.lock().code.stats().clone()
    }

    /// Descriptor heap statistics
    pub fn descriptor_stats(&self, table: DescriptorTable) -> HeapStats {
        let shared = self.shared.lock();
        match table {
            DescriptorTable::Texture => shared.textures.stats().clone(),
            DescriptorTable::Sampler => shared.samplers.stats().clone(),
        }
    }
}

static_assertions::assert_impl_all!(Screen: Send, Sync);

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use basalt_sim::{SimCompiler, SimDevice};

    pub(crate) fn screen_with(device: &SimDevice, config: ScreenConfig) -> Arc<Screen> {
        Screen::new(
            Box::new(device.clone()),
            Box::new(device.clone()),
            Box::new(SimCompiler::new()),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_arbiter_switches_once() {
        let mut arbiter = ContextArbiter::new();
        let a = ContextId::new(1);
        let b = ContextId::new(2);
        assert!(arbiter.switch_to(a));
        assert!(!arbiter.switch_to(a));
        assert!(arbiter.switch_to(b));
        arbiter.release(a);
        assert_eq!(arbiter.current(), Some(b));
        arbiter.release(b);
        assert_eq!(arbiter.current(), None);
        assert_eq!(arbiter.switches(), 2);
    }

    #[test]
    fn test_lost_is_sticky() {
        let device = SimDevice::new();
        let screen = screen_with(&device, ScreenConfig::new());
        assert_eq!(screen.status(), DeviceStatus::Ok);
        screen.mark_lost();
        screen.mark_lost();
        assert_eq!(screen.status(), DeviceStatus::Lost);
    }

    #[test]
    fn test_ids_unique_across_kinds() {
        let device = SimDevice::new();
        let screen = screen_with(&device, ScreenConfig::new());
        let res = screen
            .create_resource(ResourceDesc::buffer(256, basalt_core::MemoryDomain::Gart))
            .unwrap();
        let a = screen.create_view(&res, 1);
        let b = screen.create_view(&res, 1);
        assert_ne!(a.id, b.id);
        assert_ne!(a, b);
    }
}
