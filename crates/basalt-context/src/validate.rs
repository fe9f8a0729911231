//! # Validation Dispatcher
//!
//! Before every draw or dispatch the context walks a fixed, ordered table of
//! validators and runs exactly those whose trigger groups are both dirty and
//! requested. Producers come before consumers (code base before programs,
//! programs before the bindings they read), and the order is maintained by
//! hand in the tables below.
//!
//! ```text
//!   dirty ──┐
//!           ├── & ──▶ todo ──▶ [framebuffer][viewport]...[condition]
//!   mask ───┘                      │ run if triggers ∩ todo ≠ ∅
//!                                  ▼
//!            dirty = (dirty − todo) | re-dirtied during the pass
//! ```

use alloc::sync::Arc;
use core::fmt;

use bitflags::Flags;

use basalt_cmd::{BindingContext, PushBuffer};
use basalt_core::{Access, MemoryDomain, Pipeline, Result, ShaderStage, ValidationError};

use crate::context::Context;
use crate::dirty::{ComputeDirty, DirtyRegister, RenderDirty};
use crate::emit;
use crate::screen::ScreenShared;

// =============================================================================
// BINDING TAGS
// =============================================================================

/// What a binding-context entry is bound as
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BindTag {
    /// Color and depth attachments
    Framebuffer,
    /// Vertex buffer slot
    Vertex(u8),
    /// Index buffer
    Index,
    /// Constant buffer slot of a stage
    ConstBuf(ShaderStage, u8),
    /// Texture slot of a stage
    Texture(ShaderStage, u8),
    /// Storage surface slot of a stage
    Surface(ShaderStage, u8),
    /// Report read by the render condition
    Condition,
}

// =============================================================================
// VALIDATOR TABLES
// =============================================================================

/// Validator entry point
pub type ValidateFn = fn(&mut Context, &mut ScreenShared) -> Result<()>;

/// One table entry
#[derive(Debug, Clone, Copy)]
pub struct Validator<F: 'static> {
    /// Name for logging
    pub name: &'static str,
    /// Groups that make the validator run
    pub triggers: F,
    /// Entry point
    pub func: ValidateFn,
}

/// Render validators in emission order
pub static RENDER_VALIDATORS: [Validator<RenderDirty>; 14] = [
    Validator {
        name: "framebuffer",
        triggers: RenderDirty::FRAMEBUFFER,
        func: emit::framebuffer,
    },
    Validator {
        name: "viewport",
        triggers: RenderDirty::VIEWPORT,
        func: emit::viewport,
    },
    Validator {
        name: "blend",
        triggers: RenderDirty::BLEND,
        func: emit::blend,
    },
    Validator {
        name: "depth_stencil",
        triggers: RenderDirty::DEPTH_STENCIL,
        func: emit::depth_stencil,
    },
    Validator {
        name: "rasterizer",
        triggers: RenderDirty::RASTERIZER,
        func: emit::rasterizer,
    },
    Validator {
        name: "code_base",
        triggers: RenderDirty::CODE_BASE,
        func: emit::code_base,
    },
    Validator {
        name: "programs",
        triggers: RenderDirty::PROGRAMS,
        func: emit::render_programs,
    },
    Validator {
        name: "constbufs",
        triggers: RenderDirty::CONSTBUF,
        func: emit::render_constbufs,
    },
    Validator {
        name: "textures",
        triggers: RenderDirty::TEXTURES,
        func: emit::render_textures,
    },
    Validator {
        name: "samplers",
        triggers: RenderDirty::SAMPLERS,
        func: emit::render_samplers,
    },
    Validator {
        name: "surfaces",
        triggers: RenderDirty::SURFACES,
        func: emit::render_surfaces,
    },
    Validator {
        name: "vertex",
        triggers: RenderDirty::VERTEX,
        func: emit::vertex_buffers,
    },
    Validator {
        name: "index",
        triggers: RenderDirty::INDEX,
        func: emit::index_buffer,
    },
    Validator {
        name: "condition",
        triggers: RenderDirty::CONDITION,
        func: emit::render_condition,
    },
];

/// Compute validators in emission order
pub static COMPUTE_VALIDATORS: [Validator<ComputeDirty>; 7] = [
    Validator {
        name: "code_base",
        triggers: ComputeDirty::CODE_BASE,
        func: emit::code_base,
    },
    Validator {
        name: "program",
        triggers: ComputeDirty::PROGRAM,
        func: emit::compute_program,
    },
    Validator {
        name: "constbufs",
        triggers: ComputeDirty::CONSTBUF,
        func: emit::compute_constbufs,
    },
    Validator {
        name: "textures",
        triggers: ComputeDirty::TEXTURES,
        func: emit::compute_textures,
    },
    Validator {
        name: "samplers",
        triggers: ComputeDirty::SAMPLERS,
        func: emit::compute_samplers,
    },
    Validator {
        name: "surfaces",
        triggers: ComputeDirty::SURFACES,
        func: emit::compute_surfaces,
    },
    Validator {
        name: "condition",
        triggers: ComputeDirty::CONDITION,
        func: emit::compute_condition,
    },
];

// =============================================================================
// PIPELINE STATE
// =============================================================================

/// Dispatcher statistics of one pipeline
#[derive(Debug, Clone, Default)]
pub struct ValidationStats {
    /// Completed passes
    pub passes: u64,
    /// Validator calls
    pub invocations: u64,
    /// Passes aborted by a validator error
    pub failures: u64,
}

/// Dirty register and binding context of one pipeline
#[derive(Debug)]
pub struct PipelineState<F> {
    /// Groups changed since last validated
    pub dirty: DirtyRegister<F>,
    /// Resources the hardware binds for this pipeline
    pub bufctx: BindingContext<BindTag>,
    stats: ValidationStats,
}

impl<F: Flags + Copy> PipelineState<F> {
    /// Create state with every group dirty
    pub fn new() -> Self {
        Self {
            dirty: DirtyRegister::new(),
            bufctx: BindingContext::new(),
            stats: ValidationStats::default(),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> &ValidationStats {
        &self.stats
    }
}

impl<F: Flags + Copy> Default for PipelineState<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Dirty-group type of a pipeline
pub trait PipelineGroups: Flags + Copy + fmt::Debug + 'static {
    /// Pipeline the groups belong to
    const PIPELINE: Pipeline;

    /// Validator table of the pipeline
    fn table() -> &'static [Validator<Self>];

    /// Pipeline state and push buffer of a context
    fn parts(ctx: &mut Context) -> (&mut PipelineState<Self>, &mut PushBuffer);
}

impl PipelineGroups for RenderDirty {
    const PIPELINE: Pipeline = Pipeline::Render;

    fn table() -> &'static [Validator<Self>] {
        &RENDER_VALIDATORS
    }

    fn parts(ctx: &mut Context) -> (&mut PipelineState<Self>, &mut PushBuffer) {
        (&mut ctx.render, &mut ctx.push)
    }
}

impl PipelineGroups for ComputeDirty {
    const PIPELINE: Pipeline = Pipeline::Compute;

    fn table() -> &'static [Validator<Self>] {
        &COMPUTE_VALIDATORS
    }

    fn parts(ctx: &mut Context) -> (&mut PipelineState<Self>, &mut PushBuffer) {
        (&mut ctx.compute, &mut ctx.push)
    }
}

/// Room asked for before a pass so most passes start in a fresh batch
///
/// A pass larger than this still works: it spills into further batches,
/// each carrying the buffer objects of the records it holds.
const PASS_RESERVE: usize = 256;

/// Records that follow a pass: the draw or launch it validated for
const WORK_RESERVE: usize = 1;

// =============================================================================
// DISPATCH
// =============================================================================

fn run_table<F: PipelineGroups>(ctx: &mut Context, shared: &mut ScreenShared, todo: F) -> Result<u64> {
    let mut invoked = 0;
    for validator in F::table() {
        if !todo.intersects(validator.triggers) {
            continue;
        }
        log::trace!("{:?}: validating {}", F::PIPELINE, validator.name);
        (validator.func)(ctx, shared).inspect_err(|e| {
            log::debug!("{:?}: {} failed: {}", F::PIPELINE, validator.name, e);
        })?;
        invoked += 1;
    }
    Ok(invoked)
}

impl Context {
    /// Bring the hardware state of one pipeline up to date for `mask`
    ///
    /// On error nothing is cleared, so the next call retries every group
    /// that was pending.
    pub fn request_validate<F: PipelineGroups>(&mut self, mask: F) -> Result<()> {
        if self.validating {
            log::warn!("{:?}: validation re-entered from a validator", F::PIPELINE);
            return Err(ValidationError::Reentrant.into());
        }
        let screen = Arc::clone(&self.screen);
        let mut shared = screen.lock();

        if shared.arbiter.switch_to(self.id) {
            self.on_context_switch();
        }
        if shared.code.generation() != self.code_generation {
            self.render.dirty.mark(RenderDirty::CODE_BASE | RenderDirty::PROGRAMS);
            self.compute.dirty.mark(ComputeDirty::CODE_BASE | ComputeDirty::PROGRAM);
            self.code_generation = shared.code.generation();
        }

        self.push.reserve(PASS_RESERVE)?;
        let todo = F::parts(self).0.dirty.begin_pass(mask);
        self.validating = true;
        let result = run_table(self, &mut shared, todo);
        self.validating = false;

        let (state, push) = F::parts(self);
        // The work record must share a batch with the buffer list below.
        let result = result.and_then(|invoked| push.reserve(WORK_RESERVE).map(|()| invoked));
        let invoked = match result {
            Ok(invoked) => invoked,
            Err(e) => {
                state.dirty.abort_pass();
                state.stats.failures += 1;
                return Err(e);
            }
        };
        state.dirty.finish_pass(todo);
        state.stats.passes += 1;
        state.stats.invocations += invoked;

        let flushed = push.take_flushed(F::PIPELINE);
        if !todo.is_empty() || flushed {
            state.bufctx.lock(push.current_fence());
        }
        push.add_buffers(state.bufctx.enumerate().map(|(_, r)| r));
        push.reference_bo(shared.code.bo_handle(), MemoryDomain::Vram, Access::READ);
        Ok(())
    }

    /// Dispatcher statistics of a pipeline
    pub fn validation_stats(&self, pipeline: Pipeline) -> &ValidationStats {
        match pipeline {
            Pipeline::Render => self.render.stats(),
            Pipeline::Compute => self.compute.stats(),
        }
    }
}
