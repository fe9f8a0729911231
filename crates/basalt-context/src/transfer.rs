//! # Transfers
//!
//! CPU access to resource storage. Host-visible storage is mapped in place
//! once the GPU is done with the requested access; device-local storage is
//! copied through a GART staging allocation.
//!
//! ```text
//!   GART:  map ──▶ busy? ──┬─ discard     ──▶ fresh storage
//!                          ├─ don't block ──▶ Busy
//!                          └─ otherwise   ──▶ wait on fences
//!
//!   VRAM:  map ──▶ staging ◀── CopyBuffer (read maps)
//!        unmap ──▶ staging ──▶ CopyBuffer (write maps)
//! ```

use alloc::sync::Arc;

use bitflags::bitflags;

use basalt_cmd::Record;
use basalt_core::{Access, ByteSize, Error, MemoryDomain, Pipeline, Result};
use basalt_mem::{Allocation, ResourceRef};

use crate::alias::SharedSlot;
use crate::context::Context;
use crate::dirty::{ComputeDirty, RenderDirty};
use crate::screen::ScreenShared;
use crate::validate::BindTag;

bitflags! {
    /// How a mapping may be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u8 {
        /// CPU reads
        const READ = 1 << 0;
        /// CPU writes
        const WRITE = 1 << 1;
        /// Previous contents may be thrown away
        const DISCARD_WHOLE_RESOURCE = 1 << 2;
        /// Fail with `Busy` instead of waiting
        const DONT_BLOCK = 1 << 3;
        /// Skip synchronization entirely
        const UNSYNCHRONIZED = 1 << 4;
    }
}

// =============================================================================
// MAPPING
// =============================================================================

/// CPU view of a resource range; hand it back to [`Context::unmap`]
#[derive(Debug)]
pub struct Mapping {
    resource: ResourceRef,
    flags: MapFlags,
    /// Offset of the range in the resource
    offset: u64,
    size: u64,
    /// GART copy of a device-local range
    staging: Option<Allocation>,
}

impl Mapping {
    /// Mapped resource
    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    /// Flags the range was mapped with
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// Mapped bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Mapped through a staging copy
    pub fn is_staged(&self) -> bool {
        self.staging.is_some()
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfBounds),
        }
    }

    /// Copy bytes out of the range
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        if !self.flags.contains(MapFlags::READ) {
            return Err(Error::InvalidState);
        }
        self.check(offset, out.len())?;
        match &self.staging {
            Some(staging) => staging.read(offset, out),
            None => self.resource.read_unsynchronized(self.offset + offset, out),
        }
    }

    /// Copy bytes into the range
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.flags.contains(MapFlags::WRITE) {
            return Err(Error::InvalidState);
        }
        self.check(offset, data.len())?;
        match &self.staging {
            Some(staging) => staging.write(offset, data),
            None => self.resource.write_unsynchronized(self.offset + offset, data),
        }
    }
}

// =============================================================================
// CONTEXT OPERATIONS
// =============================================================================

impl Context {
    /// Map `size` bytes of `resource` at `offset` for CPU access
    pub fn map(
        &mut self,
        resource: &ResourceRef,
        offset: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result<Mapping> {
        self.check_device()?;
        let in_range = offset
            .checked_add(size)
            .is_some_and(|end| end <= resource.size().as_bytes());
        if size == 0
            || !in_range
            || !flags.intersects(MapFlags::READ | MapFlags::WRITE)
            || (flags.contains(MapFlags::DISCARD_WHOLE_RESOURCE) && !flags.contains(MapFlags::WRITE))
        {
            return Err(Error::InvalidParameter);
        }

        let staging = if resource.domain().is_host_visible() {
            self.prepare_direct(resource, flags)?;
            None
        } else {
            Some(self.prepare_staged(resource, offset, size, flags)?)
        };
        if flags.contains(MapFlags::WRITE) {
            resource.set_cpu_dirty(true);
        }
        log::trace!(
            "map {:?} [{}, +{}) {:?}{}",
            resource.id(),
            offset,
            size,
            flags,
            if staging.is_some() { " staged" } else { "" }
        );
        Ok(Mapping {
            resource: Arc::clone(resource),
            flags,
            offset,
            size,
            staging,
        })
    }

    /// End a mapping, copying staged writes back
    pub fn unmap(&mut self, mapping: Mapping) -> Result<()> {
        let Mapping {
            resource,
            flags,
            offset,
            size,
            staging,
        } = mapping;
        if let Some(staging) = staging {
            let copied = if flags.contains(MapFlags::WRITE) {
                self.copy_back(&resource, offset, size, &staging)
            } else {
                Ok(())
            };
            let fence = self.push.current_fence().clone();
            self.screen.lock().memory.release(staging, Some(fence));
            copied?;
        }
        if flags.contains(MapFlags::WRITE) {
            resource.set_cpu_dirty(false);
        }
        Ok(())
    }

    /// Give `resource` fresh storage so its contents can be overwritten
    /// without waiting
    ///
    /// Bindings of this context that captured the old address are emitted
    /// again on the next draw or dispatch.
    pub fn invalidate_resource(&mut self, resource: &ResourceRef) -> Result<()> {
        self.check_device()?;
        let screen = Arc::clone(&self.screen);
        let mut shared = screen.lock();
        let storage = shared.memory.allocate(resource.size(), resource.domain())?;
        resource.replace_storage(storage);

        for pipeline in [Pipeline::Render, Pipeline::Compute] {
            for tag in self.bufctx(pipeline).tags_of(resource.id()) {
                self.rebind(&mut shared, pipeline, tag);
            }
        }
        log::debug!("resource {:?} invalidated, now at {}", resource.id(), resource.gpu_addr());
        Ok(())
    }

    fn prepare_direct(&mut self, resource: &ResourceRef, flags: MapFlags) -> Result<()> {
        if flags.contains(MapFlags::UNSYNCHRONIZED) {
            return Ok(());
        }
        // Readers only conflict with GPU writes; writers with any GPU access.
        let access = if flags.contains(MapFlags::WRITE) {
            Access::READ_WRITE
        } else {
            Access::WRITE
        };
        if !resource.is_busy(access) {
            return Ok(());
        }
        if flags.contains(MapFlags::DISCARD_WHOLE_RESOURCE) {
            return self.invalidate_resource(resource);
        }
        if flags.contains(MapFlags::DONT_BLOCK) {
            return Err(Error::Busy);
        }
        self.wait_resource(resource, access)
    }

    fn prepare_staged(
        &mut self,
        resource: &ResourceRef,
        offset: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result<Allocation> {
        if flags.contains(MapFlags::READ)
            && flags.contains(MapFlags::DONT_BLOCK)
            && resource.is_busy(Access::WRITE)
        {
            return Err(Error::Busy);
        }
        let staging = self
            .screen
            .lock()
            .memory
            .allocate(ByteSize::from_bytes(size), MemoryDomain::Gart)?;
        if !flags.contains(MapFlags::READ) {
            return Ok(staging);
        }
        match self.fill_staging(resource, offset, size, &staging) {
            Ok(()) => Ok(staging),
            Err(e) => {
                let fence = self.push.current_fence().clone();
                self.screen.lock().memory.release(staging, Some(fence));
                Err(e)
            }
        }
    }

    fn fill_staging(
        &mut self,
        resource: &ResourceRef,
        offset: u64,
        size: u64,
        staging: &Allocation,
    ) -> Result<()> {
        self.push.push(Record::CopyBuffer {
            src: resource.gpu_addr() + offset,
            dst: staging.addr(),
            size,
        })?;
        self.push.reference(resource, Access::READ);
        self.push
            .reference_bo(staging.bo().handle, MemoryDomain::Gart, Access::WRITE);
        let fence = self.push.current_fence().clone();
        self.flush()?;
        self.wait_fence(&fence)
    }

    fn copy_back(
        &mut self,
        resource: &ResourceRef,
        offset: u64,
        size: u64,
        staging: &Allocation,
    ) -> Result<()> {
        self.push.push(Record::CopyBuffer {
            src: staging.addr(),
            dst: resource.gpu_addr() + offset,
            size,
        })?;
        self.push
            .reference_bo(staging.bo().handle, MemoryDomain::Gart, Access::READ);
        self.push.reference(resource, Access::WRITE);
        Ok(())
    }

    fn wait_resource(&mut self, resource: &ResourceRef, access: Access) -> Result<()> {
        let timeout = self.screen.config().fence_timeout;
        let result = resource.wait(access, &mut self.push, timeout);
        self.lost_on_fatal(result)
    }

    /// Dirty whatever bound a resource as `tag`
    fn rebind(&mut self, shared: &mut ScreenShared, pipeline: Pipeline, tag: BindTag) {
        match tag {
            BindTag::Framebuffer => self.render.dirty.mark(RenderDirty::FRAMEBUFFER),
            BindTag::Vertex(slot) => {
                self.shadow.vertex.mark(usize::from(slot));
                self.render.dirty.mark(RenderDirty::VERTEX);
            }
            BindTag::Index => self.render.dirty.mark(RenderDirty::INDEX),
            BindTag::ConstBuf(stage, slot) => {
                self.shadow.stage_mut(stage).constbufs.mark(usize::from(slot));
                self.mark_shared(stage, SharedSlot::ConstBuffers);
            }
            BindTag::Texture(stage, slot) => {
                let slot = usize::from(slot);
                // The descriptor encodes the old address.
                if let Some(view) = self.shadow.stage(stage).textures.get(slot) {
                    shared.textures.remove(view.id);
                }
                self.shadow.stage_mut(stage).textures.mark(slot);
                self.mark_shared(stage, SharedSlot::Textures);
            }
            BindTag::Surface(stage, slot) => {
                self.shadow.stage_mut(stage).surfaces.mark(usize::from(slot));
                self.mark_shared(stage, SharedSlot::Surfaces);
            }
            BindTag::Condition => match pipeline {
                Pipeline::Render => self.render.dirty.mark(RenderDirty::CONDITION),
                Pipeline::Compute => self.compute.dirty.mark(ComputeDirty::CONDITION),
            },
        }
    }
}
