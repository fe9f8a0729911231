//! # BASALT Simulator
//!
//! Software stand-in for the kernel and the shader translator, so the
//! execution core can run end to end without hardware.
//!
//! ```text
//! ┌──────────────┐  alloc_bo/free_bo  ┌─────────────────────────────┐
//! │ MemoryManager│───────────────────▶│                             │
//! └──────────────┘                    │          SimDevice          │
//! ┌──────────────┐  submit/wait       │  VA space + backing memory  │
//! │  GpuChannel  │───────────────────▶│  record interpreter         │
//! └──────────────┘                    │  counters, clock, condition │
//!                                     └─────────────────────────────┘
//! ```
//!
//! The device executes a batch when it completes. In [`ExecMode::Hold`]
//! batches queue up until a waiter asks for them or [`SimDevice::retire_all`]
//! runs; in [`ExecMode::Hang`] they never complete.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod compiler;
pub mod device;

// Re-exports
pub use compiler::{SimCompiler, FAIL_MARKER};
pub use device::{ExecMode, SimDevice, SimStats, SimSubmission};
