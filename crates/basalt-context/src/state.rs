//! # Shadow State
//!
//! CPU-side copy of everything bound to the hardware. Validators read it to
//! produce records; setters compare against it so unchanged state never
//! dirties anything.

use alloc::sync::Arc;

use arrayvec::ArrayVec;

use basalt_core::{GpuAddr, SamplerId, ShaderStage, ViewId};
use basalt_cmd::MAX_COLOR_TARGETS;
use basalt_mem::ResourceRef;

use crate::alias::SharedSlot;
use crate::program::ProgramRef;

/// Constant buffer slots per stage
pub const MAX_CONST_BUFFERS: usize = 16;
/// Texture slots per stage
pub const MAX_TEXTURES: usize = 32;
/// Sampler slots per stage
pub const MAX_SAMPLERS: usize = 16;
/// Storage surface slots per stage
pub const MAX_SURFACES: usize = 8;
/// Vertex buffer slots
pub const MAX_VERTEX_BUFFERS: usize = 16;

// =============================================================================
// SLOT TABLE
// =============================================================================

/// Fixed array of binding slots with valid and dirty masks
#[derive(Debug, Clone)]
pub struct SlotTable<T, const N: usize> {
    slots: [Option<T>; N],
    valid: u32,
    dirty: u32,
}

impl<T: PartialEq, const N: usize> SlotTable<T, N> {
    /// Create an empty table
    pub fn new() -> Self {
        const { assert!(N <= 32) };
        Self {
            slots: core::array::from_fn(|_| None),
            valid: 0,
            dirty: 0,
        }
    }

    /// Bind or unbind a slot; returns whether anything changed
    pub fn set(&mut self, slot: usize, value: Option<T>) -> bool {
        if slot >= N || self.slots[slot] == value {
            return false;
        }
        let bit = 1 << slot;
        if value.is_some() {
            self.valid |= bit;
        } else {
            self.valid &= !bit;
        }
        self.dirty |= bit;
        self.slots[slot] = value;
        true
    }

    /// Binding in a slot
    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Mask of bound slots
    pub fn valid(&self) -> u32 {
        self.valid
    }

    /// Mask of slots changed since the last emission
    pub fn dirty(&self) -> u32 {
        self.dirty
    }

    /// Take the dirty mask, leaving it clear
    pub fn take_dirty(&mut self) -> u32 {
        core::mem::take(&mut self.dirty)
    }

    /// Mark one slot for re-emission
    pub fn mark(&mut self, slot: usize) {
        if slot < N {
            self.dirty |= 1 << slot;
        }
    }

    /// Mark every bound slot for re-emission
    pub fn mark_valid(&mut self) {
        self.dirty |= self.valid;
    }

    /// Bound slots with their bindings
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}

impl<T: PartialEq, const N: usize> Default for SlotTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Indices of the set bits of a slot mask, lowest first
pub fn mask_slots(mut mask: u32) -> impl Iterator<Item = usize> {
    core::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let slot = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        Some(slot)
    })
}

// =============================================================================
// BINDINGS
// =============================================================================

/// Range of a buffer resource
#[derive(Debug, Clone)]
pub struct BufferBinding {
    /// Buffer
    pub resource: ResourceRef,
    /// Byte offset
    pub offset: u32,
    /// Byte size
    pub size: u32,
}

impl BufferBinding {
    /// Bind the whole resource
    pub fn whole(resource: &ResourceRef) -> Self {
        Self {
            resource: Arc::clone(resource),
            offset: 0,
            size: resource.size().as_bytes() as u32,
        }
    }

    /// GPU address and size of the range
    pub fn range(&self) -> (GpuAddr, u32) {
        (self.resource.gpu_addr() + u64::from(self.offset), self.size)
    }
}

impl PartialEq for BufferBinding {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resource, &other.resource)
            && self.offset == other.offset
            && self.size == other.size
    }
}

/// Vertex buffer binding
#[derive(Debug, Clone, PartialEq)]
pub struct VertexBinding {
    /// Buffer range
    pub buffer: BufferBinding,
    /// Stride in bytes
    pub stride: u32,
}

/// Index buffer binding
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBinding {
    /// Buffer range
    pub buffer: BufferBinding,
    /// Bytes per index
    pub index_size: u8,
}

/// Texture view over a resource
#[derive(Debug, Clone)]
pub struct SamplerView {
    /// View id, keys the texture descriptor heap
    pub id: ViewId,
    /// Viewed resource
    pub resource: ResourceRef,
    /// Encoded format
    pub format: u16,
}

impl SamplerView {
    /// Texture descriptor for the view's current storage
    pub fn descriptor(&self) -> u64 {
        (self.resource.gpu_addr().raw() >> 8) | (u64::from(self.format) << 48)
    }
}

impl PartialEq for SamplerView {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.resource, &other.resource)
    }
}

/// Sampler state object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerState {
    /// Sampler id, keys the sampler descriptor heap
    pub id: SamplerId,
    /// Encoded sampler descriptor
    pub descriptor: u64,
}

/// Render targets
#[derive(Debug, Clone, Default)]
pub struct FramebufferState {
    /// Color attachments
    pub colors: ArrayVec<ResourceRef, MAX_COLOR_TARGETS>,
    /// Depth/stencil attachment
    pub depth: Option<ResourceRef>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl PartialEq for FramebufferState {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.colors.len() == other.colors.len()
            && self
                .colors
                .iter()
                .zip(other.colors.iter())
                .all(|(a, b)| Arc::ptr_eq(a, b))
            && match (&self.depth, &other.depth) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// Viewport transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// X, Y, width, height
    pub rect: [f32; 4],
    /// Near and far depth
    pub depth: [f32; 2],
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            rect: [0.0, 0.0, 1.0, 1.0],
            depth: [0.0, 1.0],
        }
    }
}

// =============================================================================
// SHADOW
// =============================================================================

/// Per-stage resource bindings
#[derive(Debug, Clone, Default)]
pub struct StageBindings {
    /// Constant buffers
    pub constbufs: SlotTable<BufferBinding, MAX_CONST_BUFFERS>,
    /// Sampler views
    pub textures: SlotTable<SamplerView, MAX_TEXTURES>,
    /// Sampler states
    pub samplers: SlotTable<SamplerState, MAX_SAMPLERS>,
    /// Storage surfaces
    pub surfaces: SlotTable<BufferBinding, MAX_SURFACES>,
}

impl StageBindings {
    /// Mark every bound slot of every table for re-emission
    pub fn mark_valid(&mut self) {
        self.constbufs.mark_valid();
        self.textures.mark_valid();
        self.samplers.mark_valid();
        self.surfaces.mark_valid();
    }

    /// Mark every bound slot of the table behind a shared hardware slot
    pub fn mark_shared(&mut self, slot: SharedSlot) {
        match slot {
            SharedSlot::ConstBuffers => self.constbufs.mark_valid(),
            SharedSlot::Textures => self.textures.mark_valid(),
            SharedSlot::Samplers => self.samplers.mark_valid(),
            SharedSlot::Surfaces => self.surfaces.mark_valid(),
        }
    }
}

/// Everything bound on the context
#[derive(Debug, Default)]
pub struct Shadow {
    /// Render targets
    pub framebuffer: Option<FramebufferState>,
    /// Viewport
    pub viewport: Viewport,
    /// Blend state word
    pub blend: u32,
    /// Depth/stencil state word
    pub depth_stencil: u32,
    /// Rasterizer state word
    pub rasterizer: u32,
    /// Program per stage
    pub programs: [Option<ProgramRef>; ShaderStage::COUNT],
    /// Resource bindings per stage
    pub stages: [StageBindings; ShaderStage::COUNT],
    /// Vertex buffers
    pub vertex: SlotTable<VertexBinding, MAX_VERTEX_BUFFERS>,
    /// Index buffer
    pub index: Option<IndexBinding>,
}

impl Shadow {
    /// Bindings of one stage
    pub fn stage(&self, stage: ShaderStage) -> &StageBindings {
        &self.stages[stage.index()]
    }

    /// Mutable bindings of one stage
    pub fn stage_mut(&mut self, stage: ShaderStage) -> &mut StageBindings {
        &mut self.stages[stage.index()]
    }

    /// Mark every bound slot of every stage and the vertex buffers dirty
    pub fn mark_all_slots(&mut self) {
        for stage in &mut self.stages {
            stage.mark_valid();
        }
        self.vertex.mark_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_set_tracks_masks() {
        let mut table = SlotTable::<u32, 4>::new();
        assert!(table.set(2, Some(7)));
        assert!(!table.set(2, Some(7)));
        assert_eq!(table.valid(), 0b100);
        assert_eq!(table.take_dirty(), 0b100);
        assert!(table.set(2, None));
        assert_eq!(table.valid(), 0);
        assert_eq!(table.dirty(), 0b100);
        assert!(!table.set(9, Some(1)));
    }

    #[test]
    fn test_mark_valid() {
        let mut table = SlotTable::<u32, 8>::new();
        table.set(0, Some(1));
        table.set(5, Some(2));
        table.take_dirty();
        table.mark_valid();
        assert_eq!(mask_slots(table.dirty()).collect::<Vec<_>>(), [0, 5]);
        assert_eq!(table.iter().map(|(i, v)| (i, *v)).collect::<Vec<_>>(), [(0, 1), (5, 2)]);
    }
}
