//! # BASALT Command System
//!
//! Command records, per-pipeline binding contexts, and submission through a
//! shared kernel channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                    Command Submission Pipeline                    │
//! │                                                                   │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐     │
//! │  │  Validators  │    │    Push      │    │   GPU Channel    │     │
//! │  │  (Records +  │───▶│   Buffer     │───▶│ (kernel + fence  │     │
//! │  │  BindingCtx) │    │ (per context)│    │    timeline)     │     │
//! │  └──────────────┘    └──────────────┘    └────────┬─────────┘     │
//! │                                                   │               │
//! │                                          ┌────────▼─────────┐     │
//! │                                          │  KernelChannel   │     │
//! │                                          │   (collaborator) │     │
//! │                                          └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. Validators append records and register the resources they bind
//! 2. The push buffer attaches its pending fence to every referenced resource
//! 3. On flush the fence is emitted and the records plus a deduplicated
//!    buffer list go to the kernel
//! 4. The kernel advances the timeline as work completes

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod bufctx;
pub mod channel;
pub mod pushbuf;
pub mod record;
pub mod stream;

// Re-exports
pub use bufctx::{BindingContext, BindingRef};
pub use channel::{BufferEntry, ChannelStats, GpuChannel, KernelChannel, Submission};
pub use pushbuf::{PushBuffer, PushStats};
pub use record::{
    CondMode, DescriptorTable, LongReport, PrimitiveMode, Record, ReportFormat, ReportKind,
    ShortReport, StateObject, MAX_COLOR_TARGETS, REPORT_SIZE,
};
pub use stream::CommandStream;
