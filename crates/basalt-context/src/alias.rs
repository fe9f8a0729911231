//! # Cross-Pipeline Alias Resolver
//!
//! The render and compute engines share several hardware binding tables.
//! Whichever pipeline wrote a table last owns it; when ownership moves, the
//! other pipeline's view of that table is gone and must be re-emitted before
//! its next draw or dispatch.
//!
//! ```text
//!              bind textures                 bind textures
//!  Render ────────────────────▶ [ table ] ◀──────────────────── Compute
//!                                   │
//!             owner: Compute  ──────┴──▶ RenderDirty::TEXTURES
//! ```

use arrayvec::ArrayVec;

use basalt_core::Pipeline;

use crate::dirty::{ComputeDirty, RenderDirty};

// =============================================================================
// SHARED SLOTS
// =============================================================================

/// Hardware binding table shared by both pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharedSlot {
    /// Constant buffer bindings
    ConstBuffers,
    /// Texture descriptor table
    Textures,
    /// Sampler descriptor table
    Samplers,
    /// Storage surface bindings
    Surfaces,
}

impl SharedSlot {
    /// Every shared slot
    pub const ALL: [SharedSlot; 4] = [
        SharedSlot::ConstBuffers,
        SharedSlot::Textures,
        SharedSlot::Samplers,
        SharedSlot::Surfaces,
    ];

    /// Dense index
    pub const fn index(self) -> usize {
        match self {
            Self::ConstBuffers => 0,
            Self::Textures => 1,
            Self::Samplers => 2,
            Self::Surfaces => 3,
        }
    }

    /// Invalidation rule of this slot
    pub fn rule(self) -> &'static AliasRule {
        &ALIAS_RULES[self.index()]
    }
}

/// Dirty groups a pipeline loses when the other one takes a slot
#[derive(Debug, Clone, Copy)]
pub struct AliasRule {
    /// Shared slot
    pub slot: SharedSlot,
    /// Groups invalidated on the render pipeline
    pub render: RenderDirty,
    /// Groups invalidated on the compute pipeline
    pub compute: ComputeDirty,
}

/// Every aliasing relation between the pipelines, indexed by slot
pub static ALIAS_RULES: [AliasRule; 4] = [
    AliasRule {
        slot: SharedSlot::ConstBuffers,
        render: RenderDirty::CONSTBUF,
        compute: ComputeDirty::CONSTBUF,
    },
    AliasRule {
        slot: SharedSlot::Textures,
        render: RenderDirty::TEXTURES,
        compute: ComputeDirty::TEXTURES,
    },
    AliasRule {
        slot: SharedSlot::Samplers,
        render: RenderDirty::SAMPLERS,
        compute: ComputeDirty::SAMPLERS,
    },
    AliasRule {
        slot: SharedSlot::Surfaces,
        render: RenderDirty::SURFACES,
        compute: ComputeDirty::SURFACES,
    },
];

// =============================================================================
// RESOLVER
// =============================================================================

/// A pipeline whose bindings in `slot` were clobbered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    /// Pipeline to re-validate
    pub pipeline: Pipeline,
    /// Slot it lost
    pub slot: SharedSlot,
}

/// Alias resolver statistics
#[derive(Debug, Clone, Default)]
pub struct AliasStats {
    /// Ownership changes
    pub transfers: u64,
    /// Invalidations produced
    pub invalidations: u64,
}

/// Current owner and bind history of every shared slot
#[derive(Debug, Clone, Default)]
pub struct AliasResolver {
    owner: [Option<Pipeline>; 4],
    /// `history[slot][pipeline]`: the pipeline has bound something there
    history: [[bool; 2]; 4],
    stats: AliasStats,
}

impl AliasResolver {
    /// Create a resolver with no owners
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `binder` wrote `slot`
    ///
    /// Returns the pipelines that must re-emit their bindings in `slot`. A
    /// pipeline that never bound anything there has nothing to lose.
    pub fn on_bind(&mut self, binder: Pipeline, slot: SharedSlot) -> ArrayVec<Invalidation, 2> {
        let s = slot.index();
        let mut out = ArrayVec::new();
        self.history[s][binder.index()] = true;
        if self.owner[s] == Some(binder) {
            return out;
        }
        if self.owner[s].is_some() {
            self.stats.transfers += 1;
        }
        self.owner[s] = Some(binder);

        for other in Pipeline::ALL {
            if other != binder && self.history[s][other.index()] {
                out.push(Invalidation {
                    pipeline: other,
                    slot,
                });
            }
        }
        self.stats.invalidations += out.len() as u64;
        if !out.is_empty() {
            log::trace!("{:?} took {:?}; invalidating {:?}", binder, slot, out);
        }
        out
    }

    /// Current owner of `slot`
    pub fn owner(&self, slot: SharedSlot) -> Option<Pipeline> {
        self.owner[slot.index()]
    }

    /// Forget ownership and history
    pub fn reset(&mut self) {
        self.owner = [None; 4];
        self.history = [[false; 2]; 4];
    }

    /// Get statistics
    pub fn stats(&self) -> &AliasStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_indexed_by_slot() {
        for slot in SharedSlot::ALL {
            assert_eq!(slot.rule().slot, slot);
        }
    }

    #[test]
    fn test_first_bind_invalidates_nothing() {
        let mut resolver = AliasResolver::new();
        assert!(resolver.on_bind(Pipeline::Compute, SharedSlot::Textures).is_empty());
        assert_eq!(resolver.owner(SharedSlot::Textures), Some(Pipeline::Compute));
    }

    #[test]
    fn test_transfer_invalidates_previous_user() {
        let mut resolver = AliasResolver::new();
        resolver.on_bind(Pipeline::Render, SharedSlot::Textures);
        let out = resolver.on_bind(Pipeline::Compute, SharedSlot::Textures);
        assert_eq!(
            out.as_slice(),
            [Invalidation {
                pipeline: Pipeline::Render,
                slot: SharedSlot::Textures
            }]
        );
        // Re-binding while owning is free.
        assert!(resolver.on_bind(Pipeline::Compute, SharedSlot::Textures).is_empty());
        // Other slots are independent.
        assert!(resolver.on_bind(Pipeline::Compute, SharedSlot::Samplers).is_empty());
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut resolver = AliasResolver::new();
        resolver.on_bind(Pipeline::Render, SharedSlot::Surfaces);
        resolver.reset();
        assert!(resolver.on_bind(Pipeline::Compute, SharedSlot::Surfaces).is_empty());
        assert_eq!(resolver.stats().transfers, 0);
    }
}
