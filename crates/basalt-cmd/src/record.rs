//! # Command Records
//!
//! Opaque, hardware-independent units of the command stream. The packet
//! encoding lives below the kernel channel; the core only decides which
//! records to emit and in what order.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use basalt_core::{GpuAddr, Pipeline, ShaderStage};

/// Maximum simultaneously bound color targets
pub const MAX_COLOR_TARGETS: usize = 8;

// =============================================================================
// RECORD PARAMETERS
// =============================================================================

/// Counter sampled by a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    /// Passed samples
    SampleCount,
    /// Primitives entering the pipeline
    PrimitivesGenerated,
    /// Primitives written to stream output
    PrimitivesEmitted,
    /// GPU clock only
    Timestamp,
    /// Payload only, proves the stream got this far
    Sequence,
}

/// Layout of a report written to memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// `{sequence: u32, value: u32, timestamp: u64}`
    Short,
    /// `{value: u64, timestamp: u64}`
    Long,
}

/// Memory image of a [`ReportFormat::Short`] report
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShortReport {
    /// Sequence payload
    pub sequence: u32,
    /// Counter value, truncated
    pub value: u32,
    /// GPU clock
    pub timestamp: u64,
}

/// Memory image of a [`ReportFormat::Long`] report
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LongReport {
    /// Counter value
    pub value: u64,
    /// GPU clock
    pub timestamp: u64,
}

/// Bytes one report occupies in memory
pub const REPORT_SIZE: u64 = 16;

const_assert_eq!(core::mem::size_of::<ShortReport>() as u64, REPORT_SIZE);
const_assert_eq!(core::mem::size_of::<LongReport>() as u64, REPORT_SIZE);

/// Predicated-execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondMode {
    /// Execute unconditionally
    Always,
    /// Skip unconditionally
    Never,
    /// Execute if the counter at the address is non-zero
    ResNonZero,
    /// Execute if the two reports at the address are equal
    Equal,
    /// Execute if the two reports at the address differ
    NotEqual,
}

/// Hardware descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorTable {
    /// Texture image descriptors
    Texture,
    /// Sampler descriptors
    Sampler,
}

/// Fixed-function state object kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateObject {
    /// Blend state
    Blend,
    /// Depth/stencil state
    DepthStencil,
    /// Rasterizer state
    Rasterizer,
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveMode {
    /// Point list
    Points,
    /// Line list
    Lines,
    /// Line strip
    LineStrip,
    /// Triangle list
    Triangles,
    /// Triangle strip
    TriangleStrip,
    /// Triangle fan
    TriangleFan,
}

impl PrimitiveMode {
    /// Primitives produced by `count` vertices
    pub const fn primitive_count(self, count: u32) -> u32 {
        match self {
            Self::Points => count,
            Self::Lines => count / 2,
            Self::LineStrip => count.saturating_sub(1),
            Self::Triangles => count / 3,
            Self::TriangleStrip | Self::TriangleFan => count.saturating_sub(2),
        }
    }
}

// =============================================================================
// RECORD
// =============================================================================

/// One command-stream entry
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    // =========================================================================
    // Render state
    // =========================================================================
    /// Bind render targets
    SetFramebuffer {
        /// Color target addresses
        colors: ArrayVec<GpuAddr, MAX_COLOR_TARGETS>,
        /// Depth/stencil target address
        depth: Option<GpuAddr>,
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
    },
    /// Set the viewport transform
    SetViewport {
        /// Origin and extent
        rect: [f32; 4],
        /// Depth range
        depth: [f32; 2],
    },
    /// Bind a fixed-function state object
    SetStateObject {
        /// Object kind
        kind: StateObject,
        /// Encoded state word
        state: u32,
    },
    /// Bind a vertex buffer; `None` unbinds the slot
    BindVertexBuffer {
        /// Slot index
        slot: u8,
        /// Address and size
        range: Option<(GpuAddr, u32)>,
        /// Stride in bytes
        stride: u32,
    },
    /// Bind the index buffer
    BindIndexBuffer {
        /// Address and size
        range: Option<(GpuAddr, u32)>,
        /// Index size in bytes
        index_size: u8,
    },

    // =========================================================================
    // Shader state
    // =========================================================================
    /// Set the address code offsets are relative to
    SetCodeBase {
        /// Code heap base
        addr: GpuAddr,
    },
    /// Inline code upload
    UploadCode {
        /// Destination
        addr: GpuAddr,
        /// Instruction words
        words: Vec<u32>,
    },
    /// Bind a program to a stage
    BindProgram {
        /// Stage
        stage: ShaderStage,
        /// Offset in the code heap
        offset: u64,
        /// Registers per thread
        gpr_count: u8,
    },
    /// Bind a constant buffer; `None` unbinds the slot
    BindConstBuffer {
        /// Stage
        stage: ShaderStage,
        /// Slot index
        slot: u8,
        /// Address and size
        range: Option<(GpuAddr, u32)>,
    },
    /// Write one descriptor table entry
    WriteDescriptor {
        /// Table
        table: DescriptorTable,
        /// Entry index
        index: u32,
        /// Encoded descriptor
        payload: u64,
    },
    /// Point a texture slot at a descriptor; `None` unbinds
    BindTexture {
        /// Stage
        stage: ShaderStage,
        /// Slot index
        slot: u8,
        /// Texture descriptor index
        descriptor: Option<u32>,
    },
    /// Point a sampler slot at a descriptor; `None` unbinds
    BindSampler {
        /// Stage
        stage: ShaderStage,
        /// Slot index
        slot: u8,
        /// Sampler descriptor index
        descriptor: Option<u32>,
    },
    /// Bind a storage image; `None` unbinds
    BindImage {
        /// Stage
        stage: ShaderStage,
        /// Slot index
        slot: u8,
        /// Address and size
        range: Option<(GpuAddr, u32)>,
    },

    // =========================================================================
    // Work
    // =========================================================================
    /// Draw primitives
    Draw {
        /// Topology
        mode: PrimitiveMode,
        /// First vertex or index
        start: u32,
        /// Vertex or index count
        count: u32,
        /// Instance count
        instances: u32,
        /// Indexed draw
        indexed: bool,
    },
    /// Launch a compute grid
    Launch {
        /// Grid size in blocks
        grid: [u32; 3],
        /// Block size in threads
        block: [u32; 3],
    },

    // =========================================================================
    // Queries and predicates
    // =========================================================================
    /// Write a report to memory once preceding work passes the pipeline
    Report {
        /// Engine writing the report
        pipeline: Pipeline,
        /// Destination
        addr: GpuAddr,
        /// Payload for [`ReportFormat::Short`]
        sequence: u32,
        /// Counter sampled
        kind: ReportKind,
        /// Layout
        format: ReportFormat,
    },
    /// Zero a hardware counter
    ResetCounter {
        /// Counter
        kind: ReportKind,
    },
    /// Enable or disable sample counting
    SampleCounting {
        /// Enable
        enable: bool,
    },
    /// Stall the channel until the word at `addr` equals `value`
    SemaphoreAcquire {
        /// Semaphore address
        addr: GpuAddr,
        /// Expected value
        value: u32,
    },
    /// Set predicated execution for an engine
    RenderCondition {
        /// Engine
        pipeline: Pipeline,
        /// Mode
        mode: CondMode,
        /// Report the mode compares, if any
        addr: Option<GpuAddr>,
    },

    // =========================================================================
    // Transfer and synchronization
    // =========================================================================
    /// Copy between buffers on the GPU
    CopyBuffer {
        /// Source
        src: GpuAddr,
        /// Destination
        dst: GpuAddr,
        /// Bytes
        size: u64,
    },
    /// Wait for all prior work before continuing
    Serialize,
    /// Signal the fence timeline
    FenceEmit {
        /// Sequence number
        sequence: u64,
    },
}

impl Record {
    /// Check if the record performs GPU work
    pub fn is_work(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::Launch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_count() {
        assert_eq!(PrimitiveMode::Triangles.primitive_count(9), 3);
        assert_eq!(PrimitiveMode::TriangleStrip.primitive_count(5), 3);
        assert_eq!(PrimitiveMode::TriangleFan.primitive_count(1), 0);
        assert_eq!(PrimitiveMode::Lines.primitive_count(7), 3);
        assert_eq!(PrimitiveMode::Points.primitive_count(4), 4);
    }

    #[test]
    fn test_is_work() {
        assert!(Record::Launch { grid: [1; 3], block: [64, 1, 1] }.is_work());
        assert!(!Record::Serialize.is_work());
    }
}
