//! # Context
//!
//! One rendering context: the shadow of everything the API layer bound, the
//! dirty registers and binding contexts of both pipelines, and the push
//! buffer its work is recorded into. A context is driven by one thread; the
//! screen it was created on is shared.

use alloc::sync::Arc;

use basalt_cmd::{BindingContext, PrimitiveMode, PushBuffer, PushStats, Record};
use basalt_core::{ContextId, Error, Fence, Pipeline, Result, ShaderStage, ValidationError};

use crate::alias::{AliasResolver, AliasStats, SharedSlot};
use crate::descriptor::SlotLocks;
use crate::dirty::{ComputeDirty, RenderDirty};
use crate::program::ProgramRef;
use crate::query::ConditionState;
use crate::screen::{DeviceStatus, Screen};
use crate::state::{
    BufferBinding, FramebufferState, IndexBinding, SamplerState, SamplerView, Shadow,
    VertexBinding, Viewport, MAX_CONST_BUFFERS, MAX_SAMPLERS, MAX_SURFACES, MAX_TEXTURES,
    MAX_VERTEX_BUFFERS,
};
use crate::validate::{BindTag, PipelineState};

/// Parameters of one draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawInfo {
    /// Topology
    pub mode: PrimitiveMode,
    /// First vertex or index
    pub start: u32,
    /// Vertex or index count
    pub count: u32,
    /// Instance count
    pub instances: u32,
    /// Read vertices through the index buffer
    pub indexed: bool,
}

impl DrawInfo {
    /// Non-indexed, single-instance draw
    pub const fn arrays(mode: PrimitiveMode, start: u32, count: u32) -> Self {
        Self {
            mode,
            start,
            count,
            instances: 1,
            indexed: false,
        }
    }
}

/// Rendering context
#[derive(Debug)]
pub struct Context {
    pub(crate) id: ContextId,
    pub(crate) screen: Arc<Screen>,
    pub(crate) push: PushBuffer,
    pub(crate) shadow: Shadow,
    pub(crate) render: PipelineState<RenderDirty>,
    pub(crate) compute: PipelineState<ComputeDirty>,
    pub(crate) alias: AliasResolver,
    pub(crate) condition: ConditionState,
    /// Descriptor heap entries the texture slots point at
    pub(crate) texture_locks: SlotLocks,
    pub(crate) sampler_locks: SlotLocks,
    /// Code heap generation the bound programs were placed in
    pub(crate) code_generation: u64,
    pub(crate) validating: bool,
    /// Occlusion queries between begin and end
    pub(crate) active_occlusion: u32,
}

fn same_program(a: &Option<ProgramRef>, b: &Option<ProgramRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn check_slot(slot: usize, max: usize) -> Result<()> {
    if slot < max {
        Ok(())
    } else {
        Err(Error::InvalidParameter)
    }
}

impl Context {
    /// Create a context on `screen`
    pub fn new(screen: &Arc<Screen>) -> Self {
        let id = screen.allocate_context_id();
        log::debug!("context {:?} created", id);
        Self {
            id,
            screen: Arc::clone(screen),
            push: PushBuffer::new(Arc::clone(screen.channel()), screen.config().push_capacity),
            shadow: Shadow::default(),
            render: PipelineState::new(),
            compute: PipelineState::new(),
            alias: AliasResolver::new(),
            condition: ConditionState::default(),
            texture_locks: SlotLocks::default(),
            sampler_locks: SlotLocks::default(),
            code_generation: 0,
            validating: false,
            active_occlusion: 0,
        }
    }

    /// Context id
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Screen the context was created on
    pub fn screen(&self) -> &Arc<Screen> {
        &self.screen
    }

    pub(crate) fn bufctx(&mut self, pipeline: Pipeline) -> &mut BindingContext<BindTag> {
        match pipeline {
            Pipeline::Render => &mut self.render.bufctx,
            Pipeline::Compute => &mut self.compute.bufctx,
        }
    }

    /// The hardware was last set up by another context
    pub(crate) fn on_context_switch(&mut self) {
        self.render.dirty.mark_all();
        self.compute.dirty.mark_all();
        self.alias.reset();
        self.shadow.mark_all_slots();
    }

    /// Dirty a stage's group for one of the shared binding tables
    pub(crate) fn mark_shared(&mut self, stage: ShaderStage, slot: SharedSlot) {
        let rule = slot.rule();
        match stage.pipeline() {
            Pipeline::Render => self.render.dirty.mark(rule.render),
            Pipeline::Compute => self.compute.dirty.mark(rule.compute),
        }
    }

    // =========================================================================
    // DEVICE STATUS
    // =========================================================================

    /// Fail fast once the device is lost
    pub(crate) fn check_device(&self) -> Result<()> {
        match self.screen.status() {
            DeviceStatus::Ok => Ok(()),
            DeviceStatus::Lost => Err(Error::DeviceLost),
        }
    }

    /// Mark the screen lost if `result` carries a fatal error
    pub(crate) fn lost_on_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.screen.mark_lost();
            }
        }
        result
    }

    /// Block on `fence`, flushing this context's batch first if it carries it
    pub fn wait_fence(&mut self, fence: &Fence) -> Result<()> {
        let timeout = self.screen.config().fence_timeout;
        let result = fence.wait(&mut self.push, timeout);
        self.lost_on_fatal(result)
    }

    // =========================================================================
    // FRAMEBUFFER AND FIXED-FUNCTION STATE
    // =========================================================================

    /// Bind render targets
    pub fn set_framebuffer(&mut self, framebuffer: Option<FramebufferState>) {
        if self.shadow.framebuffer != framebuffer {
            self.shadow.framebuffer = framebuffer;
            self.render.dirty.mark(RenderDirty::FRAMEBUFFER);
        }
    }

    /// Set the viewport transform
    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.shadow.viewport != viewport {
            self.shadow.viewport = viewport;
            self.render.dirty.mark(RenderDirty::VIEWPORT);
        }
    }

    /// Bind an encoded blend state
    pub fn set_blend(&mut self, state: u32) {
        if self.shadow.blend != state {
            self.shadow.blend = state;
            self.render.dirty.mark(RenderDirty::BLEND);
        }
    }

    /// Bind an encoded depth/stencil state
    pub fn set_depth_stencil(&mut self, state: u32) {
        if self.shadow.depth_stencil != state {
            self.shadow.depth_stencil = state;
            self.render.dirty.mark(RenderDirty::DEPTH_STENCIL);
        }
    }

    /// Bind an encoded rasterizer state
    pub fn set_rasterizer(&mut self, state: u32) {
        if self.shadow.rasterizer != state {
            self.shadow.rasterizer = state;
            self.render.dirty.mark(RenderDirty::RASTERIZER);
        }
    }

    // =========================================================================
    // VERTEX INPUT
    // =========================================================================

    /// Bind or unbind a vertex buffer
    pub fn set_vertex_buffer(&mut self, slot: usize, binding: Option<VertexBinding>) -> Result<()> {
        check_slot(slot, MAX_VERTEX_BUFFERS)?;
        if self.shadow.vertex.set(slot, binding) {
            self.render.dirty.mark(RenderDirty::VERTEX);
        }
        Ok(())
    }

    /// Bind or unbind the index buffer
    pub fn set_index_buffer(&mut self, binding: Option<IndexBinding>) -> Result<()> {
        if let Some(b) = &binding {
            if !matches!(b.index_size, 1 | 2 | 4) {
                return Err(Error::InvalidParameter);
            }
        }
        if self.shadow.index != binding {
            self.shadow.index = binding;
            self.render.dirty.mark(RenderDirty::INDEX);
        }
        Ok(())
    }

    // =========================================================================
    // SHADERS AND RESOURCES
    // =========================================================================

    /// Bind a program to its stage
    pub fn bind_program(&mut self, stage: ShaderStage, program: Option<ProgramRef>) -> Result<()> {
        if program.as_ref().is_some_and(|p| p.stage() != stage) {
            return Err(Error::InvalidParameter);
        }
        let current = &mut self.shadow.programs[stage.index()];
        if same_program(current, &program) {
            return Ok(());
        }
        *current = program;
        match stage.pipeline() {
            Pipeline::Render => self.render.dirty.mark(RenderDirty::PROGRAMS),
            Pipeline::Compute => self.compute.dirty.mark(ComputeDirty::PROGRAM),
        }
        Ok(())
    }

    /// Bind or unbind a constant buffer
    pub fn set_constant_buffer(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        binding: Option<BufferBinding>,
    ) -> Result<()> {
        check_slot(slot, MAX_CONST_BUFFERS)?;
        if self.shadow.stage_mut(stage).constbufs.set(slot, binding) {
            self.mark_shared(stage, SharedSlot::ConstBuffers);
        }
        Ok(())
    }

    /// Bind or unbind a texture view
    pub fn set_sampler_view(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        view: Option<SamplerView>,
    ) -> Result<()> {
        check_slot(slot, MAX_TEXTURES)?;
        if self.shadow.stage_mut(stage).textures.set(slot, view) {
            self.mark_shared(stage, SharedSlot::Textures);
        }
        Ok(())
    }

    /// Bind or unbind a sampler state
    pub fn set_sampler(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        sampler: Option<SamplerState>,
    ) -> Result<()> {
        check_slot(slot, MAX_SAMPLERS)?;
        if self.shadow.stage_mut(stage).samplers.set(slot, sampler) {
            self.mark_shared(stage, SharedSlot::Samplers);
        }
        Ok(())
    }

    /// Bind or unbind a storage surface
    pub fn set_surface(
        &mut self,
        stage: ShaderStage,
        slot: usize,
        binding: Option<BufferBinding>,
    ) -> Result<()> {
        check_slot(slot, MAX_SURFACES)?;
        if self.shadow.stage_mut(stage).surfaces.set(slot, binding) {
            self.mark_shared(stage, SharedSlot::Surfaces);
        }
        Ok(())
    }

    // =========================================================================
    // WORK
    // =========================================================================

    /// Validate render state and record a draw
    pub fn draw(&mut self, info: &DrawInfo) -> Result<()> {
        self.check_device()?;
        if info.count == 0 || info.instances == 0 {
            return Ok(());
        }
        if info.indexed && self.shadow.index.is_none() {
            return Err(Error::InvalidState);
        }
        if self.shadow.programs[ShaderStage::Vertex.index()].is_none() {
            return Err(ValidationError::MissingProgram.into());
        }
        self.request_validate(RenderDirty::all())?;
        self.push.push(Record::Draw {
            mode: info.mode,
            start: info.start,
            count: info.count,
            instances: info.instances,
            indexed: info.indexed,
        })
    }

    /// Validate compute state and launch a grid
    pub fn dispatch(&mut self, grid: [u32; 3], block: [u32; 3]) -> Result<()> {
        self.check_device()?;
        if grid.contains(&0) || block.contains(&0) {
            return Ok(());
        }
        if self.shadow.programs[ShaderStage::Compute.index()].is_none() {
            return Err(ValidationError::MissingProgram.into());
        }
        self.request_validate(ComputeDirty::all())?;
        self.push.push(Record::Launch { grid, block })
    }

    /// Submit recorded work and recycle memory that became free
    pub fn flush(&mut self) -> Result<()> {
        let result = self.push.flush();
        self.lost_on_fatal(result)?;
        self.screen.reclaim();
        Ok(())
    }

    /// Submit recorded work and wait for all of it
    pub fn finish(&mut self) -> Result<()> {
        let timeout = self.screen.config().fence_timeout;
        let result = self.push.finish(timeout);
        self.lost_on_fatal(result)?;
        self.screen.reclaim();
        Ok(())
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    /// Pending render groups
    pub fn render_dirty(&self) -> RenderDirty {
        self.render.dirty.bits()
    }

    /// Pending compute groups
    pub fn compute_dirty(&self) -> ComputeDirty {
        self.compute.dirty.bits()
    }

    /// Records not yet submitted
    pub fn records(&self) -> &[Record] {
        self.push.records()
    }

    /// Fence the pending batch will signal
    pub fn current_fence(&self) -> &Fence {
        self.push.current_fence()
    }

    /// Push buffer statistics
    pub fn push_stats(&self) -> &PushStats {
        self.push.stats()
    }

    /// Alias resolver statistics
    pub fn alias_stats(&self) -> &AliasStats {
        self.alias.stats()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.push.flush() {
            log::warn!("context {:?}: final flush failed: {}", self.id, e);
        }
        let last = self.push.last_fence();
        let mut shared = self.screen.lock();
        shared.textures.release(&mut self.texture_locks, last);
        shared.samplers.release(&mut self.sampler_locks, last);
        shared.arbiter.release(self.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec::Vec;
    use basalt_cmd::StateObject;
    use basalt_core::{MemoryDomain, ShaderIr};
    use basalt_mem::{ResourceDesc, ResourceRef};
    use basalt_sim::{ExecMode, SimDevice, FAIL_MARKER};

    use crate::screen::tests::screen_with;
    use crate::screen::ScreenConfig;

    pub(crate) struct Rig {
        pub device: SimDevice,
        pub screen: Arc<Screen>,
        pub ctx: Context,
    }

    pub(crate) fn rig() -> Rig {
        rig_with(ScreenConfig::new())
    }

    pub(crate) fn rig_with(config: ScreenConfig) -> Rig {
        let device = SimDevice::new();
        let screen = screen_with(&device, config);
        let ctx = Context::new(&screen);
        Rig { device, screen, ctx }
    }

    impl Rig {
        pub(crate) fn buffer(&self, size: u64, domain: MemoryDomain) -> ResourceRef {
            self.screen
                .create_resource(ResourceDesc::buffer(size, domain))
                .unwrap()
        }

        pub(crate) fn program(&self, stage: ShaderStage, words: &[u32]) -> ProgramRef {
            self.screen.create_program(ShaderIr::new(stage, words))
        }

        /// Bind a vertex shader so draws validate
        pub(crate) fn with_vertex_shader(mut self) -> Self {
            let vs = self.program(ShaderStage::Vertex, &[1, 2, 3, 4]);
            self.ctx.bind_program(ShaderStage::Vertex, Some(vs)).unwrap();
            self
        }

        /// Bind a compute shader so dispatches validate
        pub(crate) fn with_compute_shader(mut self) -> Self {
            let cs = self.program(ShaderStage::Compute, &[9, 8, 7]);
            self.ctx.bind_program(ShaderStage::Compute, Some(cs)).unwrap();
            self
        }
    }

    pub(crate) fn triangles() -> DrawInfo {
        DrawInfo::arrays(PrimitiveMode::Triangles, 0, 3)
    }

    #[test]
    fn test_setters_ignore_unchanged_state() {
        let mut rig = rig().with_vertex_shader();
        rig.ctx.draw(&triangles()).unwrap();
        assert!(rig.ctx.render_dirty().is_empty());

        rig.ctx.set_blend(0);
        rig.ctx.set_viewport(Viewport::default());
        assert!(rig.ctx.render_dirty().is_empty());

        rig.ctx.set_blend(7);
        assert_eq!(rig.ctx.render_dirty(), RenderDirty::BLEND);
    }

    #[test]
    fn test_repeat_validate_invokes_nothing() {
        let mut rig = rig().with_vertex_shader();
        rig.ctx.request_validate(RenderDirty::all()).unwrap();
        let before = rig.ctx.validation_stats(Pipeline::Render).invocations;
        let records = rig.ctx.records().len();

        rig.ctx.request_validate(RenderDirty::all()).unwrap();
        assert_eq!(rig.ctx.validation_stats(Pipeline::Render).invocations, before);
        assert_eq!(rig.ctx.records().len(), records);
        assert_eq!(rig.ctx.validation_stats(Pipeline::Render).passes, 2);
    }

    #[test]
    fn test_partial_mask_leaves_other_groups() {
        let mut rig = rig();
        rig.ctx.request_validate(RenderDirty::BLEND).unwrap();
        assert!(!rig.ctx.render_dirty().contains(RenderDirty::BLEND));
        assert!(rig.ctx.render_dirty().contains(RenderDirty::VIEWPORT));
        assert_eq!(rig.ctx.validation_stats(Pipeline::Render).invocations, 1);
        assert_eq!(
            rig.ctx.records(),
            [Record::SetStateObject {
                kind: StateObject::Blend,
                state: 0
            }]
        );
    }

    #[test]
    fn test_failing_validator_clears_nothing() {
        let mut rig = rig();
        let bad = rig.program(ShaderStage::Vertex, &[FAIL_MARKER]);
        rig.ctx.bind_program(ShaderStage::Vertex, Some(bad)).unwrap();
        let before = rig.ctx.render_dirty();

        assert_eq!(
            rig.ctx.draw(&triangles()),
            Err(Error::Validation(ValidationError::ShaderTranslation))
        );
        assert_eq!(rig.ctx.render_dirty(), before);
        assert_eq!(rig.ctx.validation_stats(Pipeline::Render).failures, 1);
        assert!(!rig.ctx.records().iter().any(Record::is_work));

        // A good program recovers on the next draw.
        let good = rig.program(ShaderStage::Vertex, &[5]);
        rig.ctx.bind_program(ShaderStage::Vertex, Some(good)).unwrap();
        rig.ctx.draw(&triangles()).unwrap();
        assert!(rig.ctx.render_dirty().is_empty());
    }

    #[test]
    fn test_draw_requires_vertex_program() {
        let mut rig = rig();
        assert_eq!(
            rig.ctx.draw(&triangles()),
            Err(Error::Validation(ValidationError::MissingProgram))
        );
        assert_eq!(
            rig.ctx.dispatch([1, 1, 1], [64, 1, 1]),
            Err(Error::Validation(ValidationError::MissingProgram))
        );
    }

    #[test]
    fn test_empty_draw_is_noop() {
        let mut rig = rig().with_vertex_shader();
        rig.ctx.draw(&DrawInfo::arrays(PrimitiveMode::Points, 0, 0)).unwrap();
        rig.ctx.dispatch([0, 1, 1], [1, 1, 1]).unwrap();
        assert!(rig.ctx.records().is_empty());
    }

    #[test]
    fn test_indexed_draw_needs_index_buffer() {
        let mut rig = rig().with_vertex_shader();
        let info = DrawInfo {
            indexed: true,
            ..triangles()
        };
        assert_eq!(rig.ctx.draw(&info), Err(Error::InvalidState));

        let ib = rig.buffer(256, MemoryDomain::Vram);
        assert_eq!(
            rig.ctx.set_index_buffer(Some(IndexBinding {
                buffer: BufferBinding::whole(&ib),
                index_size: 3,
            })),
            Err(Error::InvalidParameter)
        );
        rig.ctx
            .set_index_buffer(Some(IndexBinding {
                buffer: BufferBinding::whole(&ib),
                index_size: 2,
            }))
            .unwrap();
        rig.ctx.draw(&info).unwrap();
    }

    #[test]
    fn test_program_stage_checked() {
        let mut rig = rig();
        let fs = rig.program(ShaderStage::Fragment, &[1]);
        assert_eq!(
            rig.ctx.bind_program(ShaderStage::Vertex, Some(fs)),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            rig.ctx.set_sampler(ShaderStage::Fragment, MAX_SAMPLERS, None),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_draw_references_bound_buffers() {
        let mut rig = rig().with_vertex_shader();
        let vb = rig.buffer(4096, MemoryDomain::Vram);
        rig.ctx
            .set_vertex_buffer(
                0,
                Some(VertexBinding {
                    buffer: BufferBinding::whole(&vb),
                    stride: 16,
                }),
            )
            .unwrap();
        rig.ctx.draw(&triangles()).unwrap();
        rig.ctx.flush().unwrap();

        let batch = rig.device.submissions().pop().unwrap();
        assert!(batch.buffers.iter().any(|b| b.handle == vb.bo_handle()));
        assert!(batch.records.contains(&Record::BindVertexBuffer {
            slot: 0,
            range: Some((vb.gpu_addr(), 4096)),
            stride: 16,
        }));
        // The submission completed immediately on the simulator.
        assert!(!vb.is_busy(basalt_core::Access::READ));
    }

    #[test]
    fn test_flush_relocks_bindings() {
        let mut rig = rig().with_vertex_shader();
        rig.device.set_mode(ExecMode::Hold);
        let vb = rig.buffer(4096, MemoryDomain::Vram);
        rig.ctx
            .set_vertex_buffer(
                0,
                Some(VertexBinding {
                    buffer: BufferBinding::whole(&vb),
                    stride: 4,
                }),
            )
            .unwrap();
        rig.ctx.draw(&triangles()).unwrap();
        rig.ctx.flush().unwrap();
        rig.device.retire_all();
        assert!(!vb.is_busy(basalt_core::Access::READ));

        // Nothing changed, but the new batch still has to keep it alive.
        rig.ctx.draw(&triangles()).unwrap();
        assert!(vb.is_busy(basalt_core::Access::READ));
        rig.ctx.flush().unwrap();
        let batch = rig.device.submissions().pop().unwrap();
        assert!(batch.buffers.iter().any(|b| b.handle == vb.bo_handle()));
        assert!(!batch.records.iter().any(|r| matches!(r, Record::BindVertexBuffer { .. })));
    }

    #[test]
    fn test_context_switch_dirties_everything() {
        let mut rig = rig().with_vertex_shader();
        rig.ctx.draw(&triangles()).unwrap();
        assert!(rig.ctx.render_dirty().is_empty());

        let mut other = Context::new(&rig.screen);
        let cs = rig.program(ShaderStage::Compute, &[3]);
        other.bind_program(ShaderStage::Compute, Some(cs)).unwrap();
        other.dispatch([1, 1, 1], [1, 1, 1]).unwrap();

        rig.ctx.draw(&triangles()).unwrap();
        let viewports = rig
            .ctx
            .records()
            .iter()
            .filter(|r| matches!(r, Record::SetViewport { .. }))
            .count();
        assert_eq!(viewports, 2);
    }

    #[test]
    fn test_hung_wait_loses_device() {
        let mut rig = rig_with(ScreenConfig {
            fence_timeout: basalt_core::Timeout::from_millis(1),
            ..ScreenConfig::new()
        })
        .with_vertex_shader();
        rig.device.set_mode(ExecMode::Hang);
        rig.ctx.draw(&triangles()).unwrap();

        assert_eq!(rig.ctx.finish(), Err(Error::DeviceLost));
        assert_eq!(rig.screen.status(), DeviceStatus::Lost);
        assert_eq!(rig.ctx.draw(&triangles()), Err(Error::DeviceLost));
        assert_eq!(rig.ctx.dispatch([1, 1, 1], [1, 1, 1]), Err(Error::DeviceLost));
    }

    #[test]
    fn test_shader_uploaded_once() {
        let mut rig = rig().with_vertex_shader();
        rig.ctx.draw(&triangles()).unwrap();
        rig.ctx.set_blend(1);
        rig.ctx.draw(&triangles()).unwrap();
        let uploads: Vec<_> = rig
            .ctx
            .records()
            .iter()
            .filter(|r| matches!(r, Record::UploadCode { .. }))
            .collect();
        // Builtin library plus the vertex shader.
        assert_eq!(uploads.len(), 2);
    }
}
