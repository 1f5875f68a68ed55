//! Error taxonomy shared by kernels, gradient functions and registries.

use thiserror::Error;

use crate::tensor::DType;

/// Coarse classification of an [`OpError`].
///
/// Configuration and arity failures indicate a mismatch between registered code and an
/// operator signature; callers should treat them as fatal rather than retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Attribute,
    ArityViolation,
    Unimplemented,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("attribute '{name}' not found")]
    AttrNotFound { name: String },

    #[error("attribute '{name}' has type {actual}, expected {expected}")]
    AttrTypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("operator expression is a {actual}, expected {expected}")]
    ClassMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{registry} '{name}' is already registered")]
    DuplicateRegistration { registry: &'static str, name: String },

    #[error("{registry} '{name}' is not registered")]
    NotRegistered { registry: &'static str, name: String },

    #[error("operator registry is frozen: {0}")]
    RegistryFrozen(String),

    #[error("operator registry has not been initialized")]
    RegistryNotInitialized,

    #[error("{op_type}: expected {expected} {what}, got {actual}")]
    ArityViolation {
        op_type: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{op_type}: no {direction} argument '{arg}' at index {index}")]
    ArgNotFound {
        op_type: String,
        direction: &'static str,
        arg: String,
        index: usize,
    },

    #[error("kernel for '{op_type}' does not implement {method}")]
    UnimplementedKernel {
        op_type: String,
        method: &'static str,
    },

    #[error("invalid capture state: {0}")]
    InvalidCaptureState(String),

    #[error("saved tensors of '{op_type}' were already released")]
    SavedTensorsReleased { op_type: String },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("execution failure: {0}")]
    Execution(String),

    #[error("invalid runtime configuration: {0}")]
    Config(String),
}

impl OpError {
    pub fn execution(message: impl Into<String>) -> Self {
        OpError::Execution(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        OpError::InvalidArgument(message.into())
    }

    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        OpError::ShapeMismatch(message.into())
    }

    pub fn unimplemented(op_type: impl Into<String>, method: &'static str) -> Self {
        OpError::UnimplementedKernel {
            op_type: op_type.into(),
            method,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::DuplicateRegistration { .. }
            | OpError::NotRegistered { .. }
            | OpError::RegistryFrozen(_)
            | OpError::RegistryNotInitialized
            | OpError::ClassMismatch { .. }
            | OpError::Config(_) => ErrorKind::Configuration,
            OpError::AttrNotFound { .. } | OpError::AttrTypeMismatch { .. } => {
                ErrorKind::Attribute
            }
            OpError::ArityViolation { .. } => ErrorKind::ArityViolation,
            OpError::UnimplementedKernel { .. } => ErrorKind::Unimplemented,
            OpError::ArgNotFound { .. }
            | OpError::InvalidCaptureState(_)
            | OpError::SavedTensorsReleased { .. }
            | OpError::ShapeMismatch(_)
            | OpError::DTypeMismatch { .. }
            | OpError::InvalidArgument(_)
            | OpError::Execution(_) => ErrorKind::Execution,
        }
    }
}

/// Convenience alias for results returned across the kernel and autograd boundary.
pub type Result<T> = std::result::Result<T, OpError>;

/// Fails with [`OpError::ArityViolation`] unless `actual == expected`.
pub fn ensure_arity(
    op_type: &str,
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(OpError::ArityViolation {
            op_type: op_type.to_string(),
            what,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_helper_reports_counts() {
        assert!(ensure_arity("diag", "outputs", 1, 1).is_ok());
        let err = ensure_arity("diag", "outputs", 1, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArityViolation);
        assert_eq!(err.to_string(), "diag: expected 1 outputs, got 2");
    }

    #[test]
    fn registry_errors_are_configuration_errors() {
        let err = OpError::DuplicateRegistration {
            registry: "kernel",
            name: "diag".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.to_string(), "kernel 'diag' is already registered");
    }
}
