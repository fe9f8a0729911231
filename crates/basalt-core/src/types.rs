//! # BASALT Core Types
//!
//! Fundamental type definitions used across the execution core.
//!
//! These types provide:
//! - Strong typing for GPU addresses and sizes
//! - Type-safe handles for driver objects
//! - The access, domain, pipeline and stage vocabularies

use core::cmp::Ordering as CmpOrdering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::{Add, Sub};
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// This is an address in the GPU's virtual address space.
/// It is NOT a CPU pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:010x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Align up
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a driver object
///
/// Handles are type-safe wrappers that prevent mixing different object types.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.id.cmp(&other.id)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "Handle<{}>({})", short, self.id)
    }
}

/// Monotonic handle source; never hands out the null id
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    /// Create an allocator starting at 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh handle
    pub fn allocate<T>(&self) -> Handle<T> {
        Handle::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// Marker types for handles
/// Marker for kernel buffer object handles
#[derive(Debug)]
pub struct BoMarker;
/// Marker for resource handles
#[derive(Debug)]
pub struct ResourceMarker;
/// Marker for shader handles
#[derive(Debug)]
pub struct ShaderMarker;
/// Marker for sampler view handles
#[derive(Debug)]
pub struct ViewMarker;
/// Marker for sampler state handles
#[derive(Debug)]
pub struct SamplerMarker;
/// Marker for context handles
#[derive(Debug)]
pub struct ContextMarker;

/// Handle to a kernel buffer object
pub type BoHandle = Handle<BoMarker>;
/// Handle to a resource
pub type ResourceId = Handle<ResourceMarker>;
/// Handle to a shader program
pub type ShaderId = Handle<ShaderMarker>;
/// Handle to a sampler view
pub type ViewId = Handle<ViewMarker>;
/// Handle to a sampler state object
pub type SamplerId = Handle<SamplerMarker>;
/// Handle to a driver context
pub type ContextId = Handle<ContextMarker>;

// =============================================================================
// MEMORY DOMAIN
// =============================================================================

/// Where a buffer object lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    /// Device-local memory, not CPU mappable
    Vram,
    /// System memory visible to the GPU through the aperture
    Gart,
}

impl MemoryDomain {
    /// Both domains
    pub const ALL: [MemoryDomain; 2] = [MemoryDomain::Vram, MemoryDomain::Gart];

    /// Dense index
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Vram => 0,
            Self::Gart => 1,
        }
    }

    /// Whether the CPU can map this domain directly
    #[inline]
    pub const fn is_host_visible(self) -> bool {
        matches!(self, Self::Gart)
    }
}

// =============================================================================
// ACCESS FLAGS
// =============================================================================

bitflags! {
    /// GPU access kind of a binding
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u8 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Read-write access
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

// =============================================================================
// PIPELINES AND STAGES
// =============================================================================

/// Logical pipeline sharing the hardware with the other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pipeline {
    /// 3D rendering
    Render,
    /// Compute launches
    Compute,
}

impl Pipeline {
    /// All pipelines
    pub const ALL: [Pipeline; 2] = [Pipeline::Render, Pipeline::Compute];

    /// Dense index
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Render => 0,
            Self::Compute => 1,
        }
    }
}

/// Programmable shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    /// Vertex shader
    Vertex,
    /// Tessellation control shader
    TessControl,
    /// Tessellation evaluation shader
    TessEval,
    /// Geometry shader
    Geometry,
    /// Fragment shader
    Fragment,
    /// Compute shader
    Compute,
}

impl ShaderStage {
    /// Number of stages
    pub const COUNT: usize = 6;

    /// Render pipeline stages in pipeline order
    pub const RENDER: [ShaderStage; 5] = [
        ShaderStage::Vertex,
        ShaderStage::TessControl,
        ShaderStage::TessEval,
        ShaderStage::Geometry,
        ShaderStage::Fragment,
    ];

    /// Dense index
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Self::Vertex => 0,
            Self::TessControl => 1,
            Self::TessEval => 2,
            Self::Geometry => 3,
            Self::Fragment => 4,
            Self::Compute => 5,
        }
    }

    /// Pipeline the stage belongs to
    #[inline]
    pub const fn pipeline(self) -> Pipeline {
        match self {
            Self::Compute => Pipeline::Compute,
            _ => Pipeline::Render,
        }
    }
}

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(ResourceId: Send, Sync, Copy, Ord);
static_assertions::const_assert_eq!(ShaderStage::RENDER.len() + 1, ShaderStage::COUNT);

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_gpu_addr_math() {
        let base = GpuAddr::new(0x1000);
        assert_eq!((base + 0x20).raw(), 0x1020);
        assert_eq!(base.offset(0x40) - base, 0x40);
        assert!(base.is_aligned(0x100));
        assert!(GpuAddr::null().is_null());
    }

    #[test]
    fn test_byte_size_debug() {
        assert_eq!(format!("{:?}", ByteSize::from_kib(64)), "64 KiB");
        assert_eq!(format!("{:?}", ByteSize::from_mib(8)), "8 MiB");
        assert_eq!(format!("{:?}", ByteSize::from_bytes(300)), "300 B");
        assert_eq!(ByteSize::from_bytes(300).align_up(256).as_bytes(), 512);
    }

    #[test]
    fn test_handle_allocator_unique() {
        let alloc = HandleAllocator::new();
        let a: ResourceId = alloc.allocate();
        let b: ResourceId = alloc.allocate();
        assert!(!a.is_null());
        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(format!("{:?}", a), "Handle<ResourceMarker>(1)");
    }

    #[test]
    fn test_stage_pipeline() {
        assert_eq!(ShaderStage::Compute.pipeline(), Pipeline::Compute);
        for stage in ShaderStage::RENDER {
            assert_eq!(stage.pipeline(), Pipeline::Render);
        }
        assert_eq!(Access::READ_WRITE, Access::READ | Access::WRITE);
    }
}
