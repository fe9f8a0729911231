//! # BASALT Error Handling
//!
//! Error types for the execution core.
//!
//! Errors are grouped by the subsystem that raises them:
//! - validation failures abort a single draw or dispatch
//! - memory exhaustion is recovered locally before it is surfaced
//! - device loss is fatal and sticky
//! - everything else is a usage error of the API layer

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// BASALT Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// BASALT unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Operation not valid in the object's current state
    InvalidState,
    /// Object not found
    NotFound,
    /// Resource is busy and the caller asked not to block
    Busy,
    /// Operation not supported
    NotSupported,

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// A validator could not produce hardware state
    Validation(ValidationError),

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Device memory exhausted after local recovery
    OutOfDeviceMemory,
    /// Buffer object could not be mapped for CPU access
    MappingFailed,
    /// Access outside an allocation
    OutOfBounds,

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// Command stream has no room left
    CommandStreamFull,
    /// Kernel rejected the submission
    SubmissionFailed,

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// A fence never signalled; the device is considered lost
    DeviceLost,
}

/// Validation failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Shader IR could not be translated to machine code
    ShaderTranslation,
    /// A stage required for the operation has no program bound
    MissingProgram,
    /// Validation was requested from inside a validation pass
    Reentrant,
    /// A bound object is incompatible with its slot
    InvalidBinding,
}

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller misuse
    Usage,
    /// Draw or dispatch aborted, state intact
    Validation,
    /// Device memory pressure
    Memory,
    /// Device unusable
    Device,
}

impl Error {
    /// Classify the error
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) => ErrorClass::Validation,
            Self::OutOfDeviceMemory | Self::MappingFailed => ErrorClass::Memory,
            Self::DeviceLost | Self::SubmissionFailed => ErrorClass::Device,
            _ => ErrorClass::Usage,
        }
    }

    /// Whether the error leaves the device unusable
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidState => write!(f, "invalid state for operation"),
            Self::NotFound => write!(f, "object not found"),
            Self::Busy => write!(f, "resource busy"),
            Self::NotSupported => write!(f, "operation not supported"),

            // Validation
            Self::Validation(e) => write!(f, "validation failed: {}", e),

            // Memory
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::MappingFailed => write!(f, "buffer mapping failed"),
            Self::OutOfBounds => write!(f, "access out of bounds"),

            // Command
            Self::CommandStreamFull => write!(f, "command stream full"),
            Self::SubmissionFailed => write!(f, "submission failed"),

            // Device
            Self::DeviceLost => write!(f, "device lost"),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShaderTranslation => write!(f, "shader translation failed"),
            Self::MissingProgram => write!(f, "missing program"),
            Self::Reentrant => write!(f, "re-entrant validation"),
            Self::InvalidBinding => write!(f, "invalid binding"),
        }
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_classification() {
        assert_eq!(Error::DeviceLost.class(), ErrorClass::Device);
        assert_eq!(Error::OutOfDeviceMemory.class(), ErrorClass::Memory);
        assert_eq!(
            Error::from(ValidationError::ShaderTranslation).class(),
            ErrorClass::Validation
        );
        assert_eq!(Error::Busy.class(), ErrorClass::Usage);
        assert!(Error::DeviceLost.is_fatal());
        assert!(!Error::OutOfDeviceMemory.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::DeviceLost.to_string(), "device lost");
        assert_eq!(
            Error::Validation(ValidationError::Reentrant).to_string(),
            "validation failed: re-entrant validation"
        );
    }
}
