//! # Binding Context
//!
//! Per-pipeline record of which resources the pending command stream
//! references, grouped into bins by binding tag (one vertex buffer slot, one
//! texture slot, the framebuffer, ...). Re-binding a slot resets just that
//! bin, so the set always matches what the hardware has bound.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use basalt_core::{Access, Fence, ResourceId};
use basalt_mem::ResourceRef;

// =============================================================================
// BINDING REFERENCE
// =============================================================================

/// One resource referenced under a tag
#[derive(Debug, Clone)]
pub struct BindingRef {
    /// Referenced resource
    pub resource: ResourceRef,
    /// How the GPU accesses it
    pub access: Access,
}

// =============================================================================
// BINDING CONTEXT
// =============================================================================

/// Tagged set of resource references
#[derive(Debug)]
pub struct BindingContext<T> {
    bins: BTreeMap<T, Vec<BindingRef>>,
}

impl<T: Ord + Copy + fmt::Debug> BindingContext<T> {
    /// Create an empty context
    pub fn new() -> Self {
        Self {
            bins: BTreeMap::new(),
        }
    }

    /// Make `resource` the only reference under `tag`
    ///
    /// Referencing the same resource with the same access again is a no-op;
    /// anything else drops what the tag held before.
    pub fn reference(&mut self, tag: T, resource: &ResourceRef, access: Access) {
        let bin = self.bins.entry(tag).or_default();
        if let [only] = bin.as_slice() {
            if Arc::ptr_eq(&only.resource, resource) && only.access == access {
                return;
            }
        }
        bin.clear();
        bin.push(BindingRef {
            resource: Arc::clone(resource),
            access,
        });
    }

    /// Add `resource` to a multi-resource tag, merging access on repeats
    pub fn add(&mut self, tag: T, resource: &ResourceRef, access: Access) {
        let bin = self.bins.entry(tag).or_default();
        match bin.iter_mut().find(|r| Arc::ptr_eq(&r.resource, resource)) {
            Some(existing) => existing.access |= access,
            None => bin.push(BindingRef {
                resource: Arc::clone(resource),
                access,
            }),
        }
    }

    /// Drop every reference under `tag`; other tags are untouched
    pub fn reset(&mut self, tag: T) -> usize {
        self.bins.remove(&tag).map_or(0, |bin| bin.len())
    }

    /// Drop every reference
    pub fn reset_all(&mut self) {
        self.bins.clear();
    }

    /// Every reference with its tag
    pub fn enumerate(&self) -> impl Iterator<Item = (T, &BindingRef)> + '_ {
        self.bins
            .iter()
            .flat_map(|(tag, bin)| bin.iter().map(move |r| (*tag, r)))
    }

    /// References under one tag
    pub fn bound(&self, tag: T) -> &[BindingRef] {
        match self.bins.get(&tag) {
            Some(bin) => bin,
            None => &[],
        }
    }

    /// Tags that reference a resource
    pub fn tags_of(&self, id: ResourceId) -> Vec<T> {
        self.bins
            .iter()
            .filter(|(_, bin)| bin.iter().any(|r| r.resource.id() == id))
            .map(|(tag, _)| *tag)
            .collect()
    }

    /// Total number of references
    pub fn len(&self) -> usize {
        self.bins.values().map(Vec::len).sum()
    }

    /// Check if nothing is referenced
    pub fn is_empty(&self) -> bool {
        self.bins.values().all(Vec::is_empty)
    }

    /// Register every reference with `fence`
    ///
    /// Marks each resource's access and attaches the fence, so none of them
    /// can be recycled before the submission carrying `fence` completes.
    pub fn lock(&self, fence: &Fence) {
        for (_, r) in self.enumerate() {
            r.resource.mark_access(r.access);
            r.resource.attach_fence(fence, r.access);
        }
    }
}

impl<T: Ord + Copy + fmt::Debug> Default for BindingContext<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::boxed::Box;
    use basalt_core::{BoHandle, ByteSize, FenceTimeline, GpuAddr, MemoryDomain, Result};
    use basalt_mem::{Bo, BoAllocator, CacheConfig, MemoryManager, ResourceDesc, ResourceStatus};

    #[derive(Debug, Default)]
    pub(crate) struct Bump(u64);

    impl BoAllocator for Bump {
        fn alloc_bo(&mut self, size: ByteSize, domain: MemoryDomain) -> Result<Bo> {
            self.0 += 1;
            Ok(Bo {
                handle: BoHandle::new(self.0),
                addr: GpuAddr::new(self.0 << 24),
                size,
                domain,
                host: None,
            })
        }

        fn free_bo(&mut self, _bo: Bo) {}
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Tag {
        Framebuffer,
        Vertex(u8),
        Texture(u8),
    }

    pub(crate) fn resources(n: usize) -> (MemoryManager, Vec<ResourceRef>) {
        let mut mm = MemoryManager::new(Box::new(Bump::default()), CacheConfig::new());
        let res = (0..n)
            .map(|_| mm.create_resource(ResourceDesc::buffer(4096, MemoryDomain::Vram)).unwrap())
            .collect();
        (mm, res)
    }

    #[test]
    fn test_reference_replaces() {
        let (_mm, res) = resources(2);
        let mut ctx = BindingContext::new();
        ctx.reference(Tag::Vertex(0), &res[0], Access::READ);
        ctx.reference(Tag::Vertex(0), &res[0], Access::READ);
        assert_eq!(ctx.len(), 1);
        ctx.reference(Tag::Vertex(0), &res[1], Access::READ);
        let bound = ctx.bound(Tag::Vertex(0));
        assert_eq!(bound.len(), 1);
        assert!(Arc::ptr_eq(&bound[0].resource, &res[1]));
    }

    #[test]
    fn test_reset_leaves_other_tags() {
        let (_mm, res) = resources(3);
        let mut ctx = BindingContext::new();
        ctx.reference(Tag::Vertex(0), &res[0], Access::READ);
        ctx.reference(Tag::Texture(2), &res[1], Access::READ);
        ctx.add(Tag::Framebuffer, &res[2], Access::WRITE);

        let before: Vec<_> = ctx
            .enumerate()
            .filter(|(t, _)| *t != Tag::Texture(2))
            .map(|(t, r)| (t, r.resource.id()))
            .collect();
        assert_eq!(ctx.reset(Tag::Texture(2)), 1);
        let after: Vec<_> = ctx.enumerate().map(|(t, r)| (t, r.resource.id())).collect();

        assert!(ctx.bound(Tag::Texture(2)).is_empty());
        assert_eq!(before, after);
    }

    #[test]
    fn test_add_merges_access() {
        let (_mm, res) = resources(2);
        let mut ctx = BindingContext::new();
        ctx.add(Tag::Framebuffer, &res[0], Access::READ);
        ctx.add(Tag::Framebuffer, &res[0], Access::WRITE);
        ctx.add(Tag::Framebuffer, &res[1], Access::WRITE);
        let bound = ctx.bound(Tag::Framebuffer);
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].access, Access::READ_WRITE);
        assert_eq!(ctx.tags_of(res[1].id()), [Tag::Framebuffer]);
    }

    #[test]
    fn test_lock_fences_everything() {
        let (_mm, res) = resources(2);
        let timeline = Arc::new(FenceTimeline::new());
        let fence = Fence::new(&timeline);
        let mut ctx = BindingContext::new();
        ctx.reference(Tag::Vertex(1), &res[0], Access::READ);
        ctx.reference(Tag::Texture(0), &res[1], Access::WRITE);
        ctx.lock(&fence);

        assert_eq!(res[0].status(), ResourceStatus::GPU_READING);
        assert_eq!(res[1].status(), ResourceStatus::GPU_WRITING);
        fence.emit().unwrap();
        timeline.signal(1);
        assert!(!res[0].is_busy(Access::READ_WRITE));
        assert!(!res[1].is_busy(Access::READ_WRITE));
    }
}
