//! # Buffer Objects
//!
//! Kernel buffer objects, their optional CPU mapping, and slices of them.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use bytemuck::Pod;
use spin::Mutex;

use basalt_core::{BoHandle, ByteSize, Error, GpuAddr, MemoryDomain, Result};

// =============================================================================
// HOST MEMORY
// =============================================================================

/// CPU view of a buffer object's pages
pub struct HostMemory {
    bytes: Mutex<Vec<u8>>,
}

impl HostMemory {
    /// Zero-filled backing of `len` bytes
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len]),
        }
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn range(len: usize, offset: u64, count: usize) -> Result<core::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| Error::OutOfBounds)?;
        let end = start.checked_add(count).ok_or(Error::OutOfBounds)?;
        if end > len {
            return Err(Error::OutOfBounds);
        }
        Ok(start..end)
    }

    /// Copy bytes out
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let range = Self::range(bytes.len(), offset, out.len())?;
        out.copy_from_slice(&bytes[range]);
        Ok(())
    }

    /// Copy bytes in
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let range = Self::range(bytes.len(), offset, data.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Read a plain-old-data value
    pub fn read_pod<T: Pod>(&self, offset: u64) -> Result<T> {
        let mut value = T::zeroed();
        self.read(offset, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Write a plain-old-data value
    pub fn write_pod<T: Pod>(&self, offset: u64, value: &T) -> Result<()> {
        self.write(offset, bytemuck::bytes_of(value))
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostMemory({} bytes)", self.len())
    }
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// Kernel buffer object
#[derive(Debug, Clone)]
pub struct Bo {
    /// Kernel handle
    pub handle: BoHandle,
    /// GPU virtual address of byte 0
    pub addr: GpuAddr,
    /// Size
    pub size: ByteSize,
    /// Placement
    pub domain: MemoryDomain,
    /// CPU mapping, present for host-visible domains
    pub host: Option<Arc<HostMemory>>,
}

/// Kernel buffer-object allocator
pub trait BoAllocator: Send {
    /// Allocate a buffer object; [`Error::OutOfDeviceMemory`] when exhausted
    fn alloc_bo(&mut self, size: ByteSize, domain: MemoryDomain) -> Result<Bo>;

    /// Return a buffer object to the kernel
    fn free_bo(&mut self, bo: Bo);
}

// =============================================================================
// ALLOCATION
// =============================================================================

/// Where an allocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Whole buffer object
    Dedicated,
    /// Chunk of a cache slab
    Chunk {
        /// Bucket index
        bucket: usize,
        /// Chunk index in the slab
        chunk: u32,
    },
}

/// Slice of a buffer object owned by one user
#[derive(Debug)]
pub struct Allocation {
    bo: Bo,
    offset: u64,
    size: ByteSize,
    pub(crate) origin: Origin,
}

impl Allocation {
    pub(crate) fn new(bo: Bo, offset: u64, size: ByteSize, origin: Origin) -> Self {
        Self {
            bo,
            offset,
            size,
            origin,
        }
    }

    /// GPU address of the first byte
    pub fn addr(&self) -> GpuAddr {
        self.bo.addr + self.offset
    }

    /// Size
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Offset inside the backing object
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Backing object
    pub fn bo(&self) -> &Bo {
        &self.bo
    }

    /// Placement
    pub fn domain(&self) -> MemoryDomain {
        self.bo.domain
    }

    /// Check if the CPU can access the slice directly
    pub fn is_host_visible(&self) -> bool {
        self.bo.host.is_some()
    }

    fn host(&self, offset: u64, len: usize) -> Result<&HostMemory> {
        let end = offset.checked_add(len as u64).ok_or(Error::OutOfBounds)?;
        if end > self.size.as_bytes() {
            return Err(Error::OutOfBounds);
        }
        self.bo.host.as_deref().ok_or(Error::MappingFailed)
    }

    /// Copy bytes out of the slice
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.host(offset, out.len())?.read(self.offset + offset, out)
    }

    /// Copy bytes into the slice
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.host(offset, data.len())?.write(self.offset + offset, data)
    }

    /// Read a plain-old-data value
    pub fn read_pod<T: Pod>(&self, offset: u64) -> Result<T> {
        self.host(offset, core::mem::size_of::<T>())?
            .read_pod(self.offset + offset)
    }

    /// Write a plain-old-data value
    pub fn write_pod<T: Pod>(&self, offset: u64, value: &T) -> Result<()> {
        self.host(offset, core::mem::size_of::<T>())?
            .write_pod(self.offset + offset, value)
    }
}
