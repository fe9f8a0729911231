//! # BASALT Execution Context
//!
//! Everything between a state setter and the records a draw or dispatch
//! leaves in the push buffer: dirty tracking, per-group validation, the
//! binding contexts that keep referenced buffers alive, the hardware tables
//! shared by the render and compute engines, queries and render conditions,
//! and CPU access to resource storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Context                                │
//! │  setters ──▶ Shadow ──▶ DirtyRegister (render, compute)         │
//! │                               │ draw / dispatch                 │
//! │                               ▼                                 │
//! │             request_validate ──▶ validator table ──▶ PushBuffer │
//! │                   │                   │                         │
//! │           ContextArbiter        AliasResolver                   │
//! │                   │                   │                         │
//! │  ┌────────────────┴───────────────────┴──────────────────────┐  │
//! │  │ Screen: MemoryManager, CodeHeap, DescriptorHeaps, channel │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A context belongs to one thread at a time. The screen is shared and
//! serializes access to device-wide state behind a single lock, which is
//! held for the whole of a validation pass.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod alias;
pub mod context;
pub mod descriptor;
pub mod dirty;
mod emit;
pub mod program;
pub mod query;
pub mod screen;
pub mod state;
pub mod transfer;
pub mod validate;


// Re-exports
pub use alias::{AliasResolver, AliasRule, AliasStats, Invalidation, SharedSlot};
pub use context::{Context, DrawInfo};
pub use descriptor::{DescriptorHeap, HeapStats};
pub use dirty::{ComputeDirty, DirtyRegister, RenderDirty};
pub use program::{Program, ProgramRef};
pub use query::{Query, QueryKind, QueryResult, QueryState, RenderConditionMode};
pub use screen::{ContextArbiter, DeviceStatus, Screen, ScreenConfig, ScreenShared};
pub use state::{
    BufferBinding, FramebufferState, IndexBinding, SamplerState, SamplerView, Shadow, SlotTable,
    VertexBinding, Viewport,
};
pub use transfer::{MapFlags, Mapping};
pub use validate::{BindTag, PipelineGroups, PipelineState, ValidationStats, Validator};
