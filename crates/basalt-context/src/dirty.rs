//! # Dirty-State Registers
//!
//! One typed bitset per pipeline recording which state groups changed since
//! they were last validated. The two pipelines use distinct flag types, so a
//! render group can never be set on the compute register.

use bitflags::{bitflags, Flags};

// =============================================================================
// STATE GROUPS
// =============================================================================

bitflags! {
    /// Render pipeline state groups
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenderDirty: u32 {
        /// Color and depth targets
        const FRAMEBUFFER = 1 << 0;
        /// Viewport transform
        const VIEWPORT = 1 << 1;
        /// Blend state
        const BLEND = 1 << 2;
        /// Depth/stencil state
        const DEPTH_STENCIL = 1 << 3;
        /// Rasterizer state
        const RASTERIZER = 1 << 4;
        /// Code heap base address
        const CODE_BASE = 1 << 5;
        /// Programs of the render stages
        const PROGRAMS = 1 << 6;
        /// Constant buffers
        const CONSTBUF = 1 << 7;
        /// Texture bindings
        const TEXTURES = 1 << 8;
        /// Sampler bindings
        const SAMPLERS = 1 << 9;
        /// Storage surfaces
        const SURFACES = 1 << 10;
        /// Vertex buffers
        const VERTEX = 1 << 11;
        /// Index buffer
        const INDEX = 1 << 12;
        /// Render condition
        const CONDITION = 1 << 13;
    }
}

bitflags! {
    /// Compute pipeline state groups
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ComputeDirty: u32 {
        /// Code heap base address
        const CODE_BASE = 1 << 0;
        /// Compute program
        const PROGRAM = 1 << 1;
        /// Constant buffers
        const CONSTBUF = 1 << 2;
        /// Texture bindings
        const TEXTURES = 1 << 3;
        /// Sampler bindings
        const SAMPLERS = 1 << 4;
        /// Storage surfaces
        const SURFACES = 1 << 5;
        /// Render condition
        const CONDITION = 1 << 6;
    }
}

// =============================================================================
// DIRTY REGISTER
// =============================================================================

/// Dirty bits of one pipeline plus the bookkeeping of a validation pass
///
/// While a pass runs, every group marked dirty is also remembered as
/// re-dirtied, so finishing the pass clears only what was validated and
/// nothing that changed underneath it.
#[derive(Debug, Clone)]
pub struct DirtyRegister<F> {
    dirty: F,
    redirtied: F,
    in_pass: bool,
}

impl<F: Flags + Copy> DirtyRegister<F> {
    /// Create a register with every group dirty
    pub fn new() -> Self {
        Self {
            dirty: F::all(),
            redirtied: F::empty(),
            in_pass: false,
        }
    }

    /// Mark groups dirty
    pub fn mark(&mut self, groups: F) {
        self.dirty = self.dirty.union(groups);
        if self.in_pass {
            self.redirtied = self.redirtied.union(groups);
        }
    }

    /// Mark every group dirty
    pub fn mark_all(&mut self) {
        self.mark(F::all());
    }

    /// Currently dirty groups
    pub fn bits(&self) -> F {
        self.dirty
    }

    /// Check if any of `groups` is dirty
    pub fn is_dirty(&self, groups: F) -> bool {
        self.dirty.intersects(groups)
    }

    /// Start a pass over `mask`, returning the groups to validate
    pub fn begin_pass(&mut self, mask: F) -> F {
        self.in_pass = true;
        self.redirtied = F::empty();
        self.dirty.intersection(mask)
    }

    /// Clear the validated groups, keeping those re-dirtied during the pass
    pub fn finish_pass(&mut self, todo: F) {
        self.dirty = self.dirty.difference(todo).union(self.redirtied);
        self.in_pass = false;
        self.redirtied = F::empty();
    }

    /// End a failed pass without clearing anything
    pub fn abort_pass(&mut self) {
        self.in_pass = false;
        self.redirtied = F::empty();
    }

    /// Check if a pass is running
    pub fn in_pass(&self) -> bool {
        self.in_pass
    }
}

impl<F: Flags + Copy> Default for DirtyRegister<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_all_dirty() {
        let reg = DirtyRegister::<ComputeDirty>::new();
        assert_eq!(reg.bits(), ComputeDirty::all());
    }

    #[test]
    fn test_pass_clears_only_todo() {
        let mut reg = DirtyRegister::<RenderDirty>::new();
        let todo = reg.begin_pass(RenderDirty::TEXTURES | RenderDirty::BLEND);
        assert_eq!(todo, RenderDirty::TEXTURES | RenderDirty::BLEND);
        reg.finish_pass(todo);
        assert!(!reg.is_dirty(RenderDirty::TEXTURES | RenderDirty::BLEND));
        assert!(reg.is_dirty(RenderDirty::VERTEX));
    }

    #[test]
    fn test_redirtied_during_pass_survives() {
        let mut reg = DirtyRegister::<RenderDirty>::new();
        let todo = reg.begin_pass(RenderDirty::all());
        reg.mark(RenderDirty::TEXTURES);
        reg.finish_pass(todo);
        assert_eq!(reg.bits(), RenderDirty::TEXTURES);
    }

    #[test]
    fn test_abort_keeps_everything() {
        let mut reg = DirtyRegister::<ComputeDirty>::new();
        let _ = reg.begin_pass(ComputeDirty::PROGRAM);
        reg.abort_pass();
        assert_eq!(reg.bits(), ComputeDirty::all());
        assert!(!reg.in_pass());
    }
}
