//! # Simulated Shader Compiler
//!
//! Produces one machine word per IR word. IR containing [`FAIL_MARKER`]
//! fails to translate.

use basalt_core::{CompiledShader, Error, Result, ShaderCompiler, ShaderIr, ValidationError};

/// IR word that makes translation fail
pub const FAIL_MARKER: u32 = 0xDEAD_C0DE;

/// Registers every simulated program claims
const GPR_COUNT: u8 = 16;

/// Deterministic stand-in translator
#[derive(Debug, Clone, Default)]
pub struct SimCompiler {
    translations: u64,
}

impl SimCompiler {
    /// Create a compiler
    pub const fn new() -> Self {
        Self { translations: 0 }
    }

    /// Successful translations so far
    pub fn translations(&self) -> u64 {
        self.translations
    }
}

impl ShaderCompiler for SimCompiler {
    fn translate(&mut self, ir: &ShaderIr) -> Result<CompiledShader> {
        if ir.words.is_empty() || ir.words.contains(&FAIL_MARKER) {
            log::debug!("sim: rejecting {:?} IR ({} words)", ir.stage, ir.words.len());
            return Err(Error::Validation(ValidationError::ShaderTranslation));
        }
        self.translations += 1;
        Ok(CompiledShader {
            code: ir.words.iter().map(|w| w.rotate_left(7) ^ 0x5a5a_5a5a).collect(),
            gpr_count: GPR_COUNT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::ShaderStage;

    #[test]
    fn test_translate() {
        let mut compiler = SimCompiler::new();
        let shader = compiler
            .translate(&ShaderIr::new(ShaderStage::Fragment, &[1, 2, 3]))
            .unwrap();
        assert_eq!(shader.size_bytes(), 12);
        assert_eq!(compiler.translations(), 1);
    }

    #[test]
    fn test_marker_fails() {
        let mut compiler = SimCompiler::new();
        let ir = ShaderIr::new(ShaderStage::Vertex, &[1, FAIL_MARKER]);
        assert_eq!(
            compiler.translate(&ir),
            Err(Error::Validation(ValidationError::ShaderTranslation))
        );
    }
}
