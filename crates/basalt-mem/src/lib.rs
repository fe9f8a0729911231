//! # BASALT Memory Management
//!
//! Buffer objects, suballocation, resource lifetime tracking and the shader
//! code heap.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     BASALT Memory System                        │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                     MemoryManager                         │  │
//! │  │   allocate / release(fences) / reclaim / create_resource  │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │         │                  │                       │            │
//! │  ┌──────┴────────┐  ┌──────┴───────┐  ┌────────────┴────────┐   │
//! │  │  BufferCache  │  │ DeferredFrees│  │     Resource        │   │
//! │  │ (VRAM, GART)  │  │ (fence-gated)│  │ status + fences     │   │
//! │  └───────────────┘  └──────────────┘  └─────────────────────┘   │
//! │         │                                      │  drop          │
//! │  ┌──────┴──────────────┐              ┌────────┴────────────┐   │
//! │  │ BoAllocator (kernel)│              │     RetireQueue     │   │
//! │  └─────────────────────┘              └─────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Memory is never handed back to the allocator while a fence that guards
//! it is unsignalled. Frees are queued and recycled by polling
//! ([`MemoryManager::reclaim`]); nothing blocks in a destructor.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod bo;
pub mod cache;
pub mod code_heap;
pub mod manager;
pub mod resource;
pub mod tracker;

// Re-exports
pub use bo::{Allocation, Bo, BoAllocator, HostMemory};
pub use cache::{BufferCache, CacheConfig, CacheStats};
pub use code_heap::{CodeHeap, CodeHeapConfig, CodeHeapStats, InstallReport};
pub use manager::{MemoryManager, MemoryStats};
pub use resource::{Resource, ResourceDesc, ResourceKind, ResourceRef, ResourceStatus};
pub use tracker::{DeferredFrees, RetireQueue, Retired};
