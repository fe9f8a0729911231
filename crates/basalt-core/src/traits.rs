//! # BASALT Core Traits
//!
//! Interfaces to collaborators that live outside the execution core.
//!
//! ```text
//! API layer ──▶ Context ──▶ ShaderCompiler  (IR → machine code)
//!                  │
//!                  ├──────▶ BoAllocator     (basalt-mem)
//!                  └──────▶ KernelChannel   (basalt-cmd)
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::Result;
use crate::types::ShaderStage;

// =============================================================================
// SHADER TRANSLATION
// =============================================================================

/// Hardware-independent shader IR handed over by the API layer
#[derive(Debug, Clone)]
pub struct ShaderIr {
    /// Stage the IR was written for
    pub stage: ShaderStage,
    /// Opaque IR words
    pub words: Arc<[u32]>,
}

impl ShaderIr {
    /// Wrap IR words
    pub fn new(stage: ShaderStage, words: &[u32]) -> Self {
        Self {
            stage,
            words: Arc::from(words),
        }
    }
}

/// Machine code produced by the translator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledShader {
    /// Instruction words
    pub code: Vec<u32>,
    /// Registers used per thread
    pub gpr_count: u8,
}

impl CompiledShader {
    /// Code size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.code.len() as u64 * 4
    }
}

/// Shader-IR to machine-code translator
pub trait ShaderCompiler: Send {
    /// Translate `ir`; any error aborts the draw or dispatch that needed it
    fn translate(&mut self, ir: &ShaderIr) -> Result<CompiledShader>;
}
