//! # BASALT Core
//!
//! Foundational types shared by every layer of the BASALT execution core.
//!
//! This crate carries nothing hardware specific: it defines the error
//! taxonomy, the strongly typed addresses and sizes, the fence timeline that
//! all lifetime decisions are made against, and the traits through which the
//! core talks to its external collaborators.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      basalt-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │    Sync     │  │     Error           │  │
//! │  │ (GpuAddr,   │  │  (Fence,    │  │   Handling          │  │
//! │  │  Access)    │  │  Timeline)  │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │   Traits (ShaderCompiler)                             │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use error::{Error, ErrorClass, Result, ValidationError};
pub use sync::{Fence, FenceTimeline, FenceWaiter, Timeout};
pub use traits::*;
pub use types::*;
