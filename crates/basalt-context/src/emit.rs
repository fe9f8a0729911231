//! # Validators
//!
//! One function per state group. Each reads the shadow state, appends the
//! records that program the group and keeps the pipeline's binding context in
//! step with what the hardware now references.

use alloc::vec::Vec;

use basalt_cmd::{BufferEntry, DescriptorTable, Record, StateObject};
use basalt_core::{
    Access, CompiledShader, GpuAddr, MemoryDomain, Pipeline, Result, ShaderId, ShaderStage,
};
use basalt_mem::ResourceRef;

use crate::alias::SharedSlot;
use crate::context::Context;
use crate::dirty::{ComputeDirty, RenderDirty};
use crate::program::ProgramRef;
use crate::screen::{ScreenShared, BUILTIN_LIBRARY};
use crate::state::{mask_slots, Shadow};
use crate::validate::BindTag;

fn stages(pipeline: Pipeline) -> &'static [ShaderStage] {
    match pipeline {
        Pipeline::Render => &ShaderStage::RENDER,
        Pipeline::Compute => &[ShaderStage::Compute],
    }
}

/// Buffer list entry for a record that uses `resource`
fn uses(resource: &ResourceRef, access: Access) -> BufferEntry {
    BufferEntry {
        handle: resource.bo_handle(),
        domain: resource.domain(),
        access,
    }
}

fn code_bo(shared: &ScreenShared, access: Access) -> BufferEntry {
    BufferEntry {
        handle: shared.code.bo_handle(),
        domain: MemoryDomain::Vram,
        access,
    }
}

/// Tell the resolver `binder` wrote `slot` and dirty whoever lost it
fn apply_alias(ctx: &mut Context, binder: Pipeline, slot: SharedSlot) {
    for lost in ctx.alias.on_bind(binder, slot) {
        let rule = lost.slot.rule();
        match lost.pipeline {
            Pipeline::Render => ctx.render.dirty.mark(rule.render),
            Pipeline::Compute => ctx.compute.dirty.mark(rule.compute),
        }
        for &stage in stages(lost.pipeline) {
            ctx.shadow.stage_mut(stage).mark_shared(lost.slot);
        }
    }
}

// =============================================================================
// FIXED-FUNCTION STATE
// =============================================================================

pub(crate) fn framebuffer(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    let bufctx = &mut ctx.render.bufctx;
    bufctx.reset(BindTag::Framebuffer);
    let mut used = Vec::new();
    let record = match &ctx.shadow.framebuffer {
        Some(fb) => {
            for color in &fb.colors {
                bufctx.add(BindTag::Framebuffer, color, Access::WRITE);
                used.push(uses(color, Access::WRITE));
            }
            if let Some(depth) = &fb.depth {
                bufctx.add(BindTag::Framebuffer, depth, Access::READ_WRITE);
                used.push(uses(depth, Access::READ_WRITE));
            }
            Record::SetFramebuffer {
                colors: fb.colors.iter().map(|c| c.gpu_addr()).collect(),
                depth: fb.depth.as_ref().map(|d| d.gpu_addr()),
                width: fb.width,
                height: fb.height,
            }
        }
        None => Record::SetFramebuffer {
            colors: Default::default(),
            depth: None,
            width: 0,
            height: 0,
        },
    };
    ctx.push.push_using(record, &used)
}

pub(crate) fn viewport(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    let vp = ctx.shadow.viewport;
    ctx.push.push(Record::SetViewport {
        rect: vp.rect,
        depth: vp.depth,
    })
}

pub(crate) fn blend(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    let state = ctx.shadow.blend;
    ctx.push.push(Record::SetStateObject {
        kind: StateObject::Blend,
        state,
    })
}

pub(crate) fn depth_stencil(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    let state = ctx.shadow.depth_stencil;
    ctx.push.push(Record::SetStateObject {
        kind: StateObject::DepthStencil,
        state,
    })
}

pub(crate) fn rasterizer(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    let state = ctx.shadow.rasterizer;
    ctx.push.push(Record::SetStateObject {
        kind: StateObject::Rasterizer,
        state,
    })
}

// =============================================================================
// CODE
// =============================================================================

pub(crate) fn code_base(ctx: &mut Context, shared: &mut ScreenShared) -> Result<()> {
    let base = shared.code.base();
    ctx.push
        .push_using(Record::SetCodeBase { addr: base }, &[code_bo(shared, Access::READ)])?;
    if shared.library_base != Some(base) {
        ctx.push.push_using(
            Record::UploadCode {
                addr: base + shared.code.library_offset(),
                words: BUILTIN_LIBRARY.to_vec(),
            },
            &[code_bo(shared, Access::WRITE)],
        )?;
        shared.library_base = Some(base);
    }
    ctx.code_generation = shared.code.generation();
    Ok(())
}

fn upload(ctx: &mut Context, shared: &ScreenShared, addr: GpuAddr, code: &CompiledShader) -> Result<()> {
    ctx.push.push_using(
        Record::UploadCode {
            addr,
            words: code.code.clone(),
        },
        &[code_bo(shared, Access::WRITE)],
    )
}

/// Code of every translated program the context has bound
fn bound_code(shadow: &Shadow) -> Vec<(ShaderId, u64)> {
    shadow
        .programs
        .iter()
        .flatten()
        .filter_map(|p| p.cached().map(|code| (p.id(), code.size_bytes())))
        .collect()
}

/// Make `program` resident, returning its offset and register count
fn install_program(
    ctx: &mut Context,
    shared: &mut ScreenShared,
    pipeline: Pipeline,
    program: &ProgramRef,
) -> Result<(u64, u8)> {
    let code = program.compiled(shared.compiler.as_mut())?;
    if let Some(offset) = shared.code.offset_of(program.id()) {
        return Ok((offset, code.gpr_count));
    }

    let still_needed = bound_code(&ctx.shadow);
    let generation = shared.code.generation();
    let report = shared.code.install(
        &mut shared.memory,
        program.id(),
        code.size_bytes(),
        &still_needed,
        ctx.push.current_fence(),
    )?;

    if shared.code.generation() != generation {
        // Work already queued may still run the evicted code.
        ctx.push.push(Record::Serialize)?;
        code_base(ctx, shared)?;
        match pipeline {
            Pipeline::Render => ctx
                .compute
                .dirty
                .mark(ComputeDirty::CODE_BASE | ComputeDirty::PROGRAM),
            Pipeline::Compute => ctx
                .render
                .dirty
                .mark(RenderDirty::CODE_BASE | RenderDirty::PROGRAMS),
        }
        let base = shared.code.base();
        for &(id, offset) in &report.reinstalled {
            let resident = ctx
                .shadow
                .programs
                .iter()
                .flatten()
                .find(|p| p.id() == id)
                .and_then(|p| p.cached());
            if let Some(resident) = resident {
                upload(ctx, shared, base + offset, &resident)?;
            }
        }
        log::debug!(
            "{:?}: code heap moved to {}, {} evicted, {} reinstalled",
            program.id(),
            base,
            report.evicted.len(),
            report.reinstalled.len()
        );
    }

    upload(ctx, shared, shared.code.base() + report.offset, &code)?;
    Ok((report.offset, code.gpr_count))
}

pub(crate) fn render_programs(ctx: &mut Context, shared: &mut ScreenShared) -> Result<()> {
    // Placing one program can move the others; bind them again if it does.
    'restart: loop {
        let generation = shared.code.generation();
        for stage in ShaderStage::RENDER {
            let Some(program) = ctx.shadow.programs[stage.index()].clone() else {
                continue;
            };
            let (offset, gpr_count) = install_program(ctx, shared, Pipeline::Render, &program)?;
            if shared.code.generation() != generation {
                continue 'restart;
            }
            ctx.push.push_using(
                Record::BindProgram {
                    stage,
                    offset,
                    gpr_count,
                },
                &[code_bo(shared, Access::READ)],
            )?;
        }
        return Ok(());
    }
}

pub(crate) fn compute_program(ctx: &mut Context, shared: &mut ScreenShared) -> Result<()> {
    let stage = ShaderStage::Compute;
    let Some(program) = ctx.shadow.programs[stage.index()].clone() else {
        return Ok(());
    };
    let (offset, gpr_count) = install_program(ctx, shared, Pipeline::Compute, &program)?;
    ctx.push.push_using(
        Record::BindProgram {
            stage,
            offset,
            gpr_count,
        },
        &[code_bo(shared, Access::READ)],
    )
}

// =============================================================================
// SHARED BINDING TABLES
// =============================================================================

fn constbufs(ctx: &mut Context, pipeline: Pipeline) -> Result<()> {
    let mut emitted = false;
    for &stage in stages(pipeline) {
        let dirty = ctx.shadow.stage(stage).constbufs.dirty();
        for slot in mask_slots(dirty) {
            let tag = BindTag::ConstBuf(stage, slot as u8);
            let (range, used) = match ctx.shadow.stage(stage).constbufs.get(slot).cloned() {
                Some(binding) => {
                    ctx.bufctx(pipeline).reference(tag, &binding.resource, Access::READ);
                    (Some(binding.range()), Some(uses(&binding.resource, Access::READ)))
                }
                None => {
                    ctx.bufctx(pipeline).reset(tag);
                    (None, None)
                }
            };
            ctx.push.push_using(
                Record::BindConstBuffer {
                    stage,
                    slot: slot as u8,
                    range,
                },
                used.as_slice(),
            )?;
        }
        ctx.shadow.stage_mut(stage).constbufs.take_dirty();
        emitted |= dirty != 0;
    }
    if emitted {
        apply_alias(ctx, pipeline, SharedSlot::ConstBuffers);
    }
    Ok(())
}

fn textures(ctx: &mut Context, shared: &mut ScreenShared, pipeline: Pipeline) -> Result<()> {
    let mut emitted = false;
    for &stage in stages(pipeline) {
        let dirty = ctx.shadow.stage(stage).textures.dirty();
        for slot in mask_slots(dirty) {
            let tag = BindTag::Texture(stage, slot as u8);
            let descriptor = match ctx.shadow.stage(stage).textures.get(slot).cloned() {
                Some(view) => {
                    let (index, fresh) = shared.textures.lookup(view.id)?;
                    if fresh {
                        let write = Record::WriteDescriptor {
                            table: DescriptorTable::Texture,
                            index,
                            payload: view.descriptor(),
                        };
                        let pushed = ctx
                            .push
                            .push_using(write, &[uses(&view.resource, Access::READ)]);
                        if let Err(e) = pushed {
                            shared.textures.remove(view.id);
                            return Err(e);
                        }
                    }
                    ctx.bufctx(pipeline).reference(tag, &view.resource, Access::READ);
                    Some(index)
                }
                None => {
                    ctx.bufctx(pipeline).reset(tag);
                    None
                }
            };
            ctx.push.push(Record::BindTexture {
                stage,
                slot: slot as u8,
                descriptor,
            })?;
            shared.textures.rebind(
                &mut ctx.texture_locks,
                stage,
                slot as u8,
                descriptor,
                ctx.push.current_fence(),
            );
        }
        ctx.shadow.stage_mut(stage).textures.take_dirty();
        emitted |= dirty != 0;
    }
    if emitted {
        apply_alias(ctx, pipeline, SharedSlot::Textures);
    }
    Ok(())
}

fn samplers(ctx: &mut Context, shared: &mut ScreenShared, pipeline: Pipeline) -> Result<()> {
    let mut emitted = false;
    for &stage in stages(pipeline) {
        let dirty = ctx.shadow.stage(stage).samplers.dirty();
        for slot in mask_slots(dirty) {
            let descriptor = match ctx.shadow.stage(stage).samplers.get(slot).copied() {
                Some(sampler) => {
                    let (index, fresh) = shared.samplers.lookup(sampler.id)?;
                    if fresh {
                        let pushed = ctx.push.push(Record::WriteDescriptor {
                            table: DescriptorTable::Sampler,
                            index,
                            payload: sampler.descriptor,
                        });
                        if let Err(e) = pushed {
                            shared.samplers.remove(sampler.id);
                            return Err(e);
                        }
                    }
                    Some(index)
                }
                None => None,
            };
            ctx.push.push(Record::BindSampler {
                stage,
                slot: slot as u8,
                descriptor,
            })?;
            shared.samplers.rebind(
                &mut ctx.sampler_locks,
                stage,
                slot as u8,
                descriptor,
                ctx.push.current_fence(),
            );
        }
        ctx.shadow.stage_mut(stage).samplers.take_dirty();
        emitted |= dirty != 0;
    }
    if emitted {
        apply_alias(ctx, pipeline, SharedSlot::Samplers);
    }
    Ok(())
}

fn surfaces(ctx: &mut Context, pipeline: Pipeline) -> Result<()> {
    let mut emitted = false;
    for &stage in stages(pipeline) {
        let dirty = ctx.shadow.stage(stage).surfaces.dirty();
        for slot in mask_slots(dirty) {
            let tag = BindTag::Surface(stage, slot as u8);
            let (range, used) = match ctx.shadow.stage(stage).surfaces.get(slot).cloned() {
                Some(binding) => {
                    ctx.bufctx(pipeline)
                        .reference(tag, &binding.resource, Access::READ_WRITE);
                    (Some(binding.range()), Some(uses(&binding.resource, Access::READ_WRITE)))
                }
                None => {
                    ctx.bufctx(pipeline).reset(tag);
                    (None, None)
                }
            };
            ctx.push.push_using(
                Record::BindImage {
                    stage,
                    slot: slot as u8,
                    range,
                },
                used.as_slice(),
            )?;
        }
        ctx.shadow.stage_mut(stage).surfaces.take_dirty();
        emitted |= dirty != 0;
    }
    if emitted {
        apply_alias(ctx, pipeline, SharedSlot::Surfaces);
    }
    Ok(())
}

pub(crate) fn render_constbufs(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    constbufs(ctx, Pipeline::Render)
}

pub(crate) fn compute_constbufs(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    constbufs(ctx, Pipeline::Compute)
}

pub(crate) fn render_textures(ctx: &mut Context, shared: &mut ScreenShared) -> Result<()> {
    textures(ctx, shared, Pipeline::Render)
}

pub(crate) fn compute_textures(ctx: &mut Context, shared: &mut ScreenShared) -> Result<()> {
    textures(ctx, shared, Pipeline::Compute)
}

pub(crate) fn render_samplers(ctx: &mut Context, shared: &mut ScreenShared) -> Result<()> {
    samplers(ctx, shared, Pipeline::Render)
}

pub(crate) fn compute_samplers(ctx: &mut Context, shared: &mut ScreenShared) -> Result<()> {
    samplers(ctx, shared, Pipeline::Compute)
}

pub(crate) fn render_surfaces(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    surfaces(ctx, Pipeline::Render)
}

pub(crate) fn compute_surfaces(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    surfaces(ctx, Pipeline::Compute)
}

// =============================================================================
// VERTEX INPUT
// =============================================================================

pub(crate) fn vertex_buffers(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    let dirty = ctx.shadow.vertex.dirty();
    for slot in mask_slots(dirty) {
        let tag = BindTag::Vertex(slot as u8);
        let (range, stride, used) = match ctx.shadow.vertex.get(slot).cloned() {
            Some(binding) => {
                ctx.render
                    .bufctx
                    .reference(tag, &binding.buffer.resource, Access::READ);
                let used = uses(&binding.buffer.resource, Access::READ);
                (Some(binding.buffer.range()), binding.stride, Some(used))
            }
            None => {
                ctx.render.bufctx.reset(tag);
                (None, 0, None)
            }
        };
        ctx.push.push_using(
            Record::BindVertexBuffer {
                slot: slot as u8,
                range,
                stride,
            },
            used.as_slice(),
        )?;
    }
    ctx.shadow.vertex.take_dirty();
    Ok(())
}

pub(crate) fn index_buffer(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    let (record, used) = match ctx.shadow.index.clone() {
        Some(binding) => {
            ctx.render
                .bufctx
                .reference(BindTag::Index, &binding.buffer.resource, Access::READ);
            let record = Record::BindIndexBuffer {
                range: Some(binding.buffer.range()),
                index_size: binding.index_size,
            };
            (record, Some(uses(&binding.buffer.resource, Access::READ)))
        }
        None => {
            ctx.render.bufctx.reset(BindTag::Index);
            let record = Record::BindIndexBuffer {
                range: None,
                index_size: 0,
            };
            (record, None)
        }
    };
    ctx.push.push_using(record, used.as_slice())
}

// =============================================================================
// RENDER CONDITION
// =============================================================================

fn condition(ctx: &mut Context, pipeline: Pipeline) -> Result<()> {
    let condition = ctx.condition.clone();
    match &condition.report {
        Some(report) => ctx
            .bufctx(pipeline)
            .reference(BindTag::Condition, report, Access::READ),
        None => {
            ctx.bufctx(pipeline).reset(BindTag::Condition);
        }
    }
    let used = condition.report.as_ref().map(|report| uses(report, Access::READ));
    ctx.push.push_using(
        Record::RenderCondition {
            pipeline,
            mode: condition.mode,
            addr: condition.addr,
        },
        used.as_slice(),
    )
}

pub(crate) fn render_condition(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    condition(ctx, Pipeline::Render)
}

pub(crate) fn compute_condition(ctx: &mut Context, _shared: &mut ScreenShared) -> Result<()> {
    condition(ctx, Pipeline::Compute)
}
