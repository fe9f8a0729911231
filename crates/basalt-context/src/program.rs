//! # Programs
//!
//! A program wraps the IR handed over by the API layer. Translation happens
//! lazily on first validation and is cached; placement in the code heap is
//! owned by the screen.

use alloc::sync::Arc;

use spin::Mutex;

use basalt_core::{
    CompiledShader, Error, Result, ShaderCompiler, ShaderId, ShaderIr, ShaderStage,
    ValidationError,
};

/// Shared handle to a program
pub type ProgramRef = Arc<Program>;

/// Shader program for one stage
#[derive(Debug)]
pub struct Program {
    id: ShaderId,
    ir: ShaderIr,
    compiled: Mutex<Option<Arc<CompiledShader>>>,
}

impl Program {
    /// Wrap IR under a screen-unique id
    pub fn new(id: ShaderId, ir: ShaderIr) -> Self {
        Self {
            id,
            ir,
            compiled: Mutex::new(None),
        }
    }

    /// Program id
    pub fn id(&self) -> ShaderId {
        self.id
    }

    /// Stage the program runs in
    pub fn stage(&self) -> ShaderStage {
        self.ir.stage
    }

    /// Machine code, translating on first use
    ///
    /// Any translator error surfaces as a shader translation failure; it is
    /// not cached, so a later validation retries.
    pub fn compiled(&self, compiler: &mut dyn ShaderCompiler) -> Result<Arc<CompiledShader>> {
        let mut compiled = self.compiled.lock();
        if let Some(code) = compiled.as_ref() {
            return Ok(Arc::clone(code));
        }
        let code = compiler.translate(&self.ir).map_err(|e| {
            log::warn!("{:?}: {:?} shader failed to translate: {}", self.id, self.ir.stage, e);
            Error::Validation(ValidationError::ShaderTranslation)
        })?;
        log::debug!("{:?}: translated {} bytes", self.id, code.size_bytes());
        let code = Arc::new(code);
        *compiled = Some(Arc::clone(&code));
        Ok(code)
    }

    /// Machine code, if already translated
    pub fn cached(&self) -> Option<Arc<CompiledShader>> {
        self.compiled.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_sim::{SimCompiler, FAIL_MARKER};

    #[test]
    fn test_translation_cached() {
        let mut compiler = SimCompiler::new();
        let program = Program::new(ShaderId::new(1), ShaderIr::new(ShaderStage::Vertex, &[1, 2]));
        assert!(program.cached().is_none());
        let a = program.compiled(&mut compiler).unwrap();
        let b = program.compiled(&mut compiler).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(compiler.translations(), 1);
    }

    #[test]
    fn test_failure_is_validation_error() {
        let mut compiler = SimCompiler::new();
        let program = Program::new(
            ShaderId::new(2),
            ShaderIr::new(ShaderStage::Fragment, &[FAIL_MARKER]),
        );
        assert_eq!(
            program.compiled(&mut compiler).map(|_| ()),
            Err(Error::Validation(ValidationError::ShaderTranslation))
        );
        assert!(program.cached().is_none());
    }
}
