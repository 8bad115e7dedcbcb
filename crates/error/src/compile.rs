//! Error types and utilities to do with lowering a tensor-level kernel module
//! through the pass pipeline.
//!
//! Locations are carried as already-rendered strings so that this crate does
//! not need to depend on the IR it describes.

use thiserror::Error;

/// The result type for use in the compiler.
pub type Result<T> = std::result::Result<T, Error>;

/// This error type is for use during the process of lowering a module from the
/// tensor level down to the LLVM level.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Error {
    /// A generic compilation failure with a string message, used as a catch-all
    /// for cases that are uncommon enough to not have specific error variants
    /// for them.
    #[error("Compilation failed: {_0}")]
    CompilationFailure(String),

    /// The module handed to the pipeline violates a structural invariant, such
    /// as single assignment or block termination.
    #[error("Malformed module at {location}: {message}")]
    MalformedModule { location: String, message: String },

    /// A tensor has a dynamic dimension that cannot be bounded statically, and
    /// hence cannot be assigned a buffer.
    #[error("Tensor of type {ty} at {location} has a dimension that cannot be bounded statically")]
    IllegalTensorShape { location: String, ty: String },

    /// Two values that must share a buffer at a control-flow merge point have
    /// been assigned different buffers.
    #[error("Conflicting buffer assignment at {location}: {message}")]
    ConflictingBufferAssignment { location: String, message: String },

    /// The offset of a slice could not be expressed as a bounded affine
    /// expression.
    ///
    /// This is a diagnostic rather than a failure: the slice is treated as
    /// opaque for the remainder of the pipeline.
    #[error("Offset of slice {value} at {location} is not a bounded affine expression: {reason}")]
    UnresolvedSliceIndex {
        location: String,
        value:    String,
        reason:   String,
    },

    /// An operation has no lowering to the LLVM instruction vocabulary.
    #[error("Operation `{opcode}` at {location} has no lowering to LLVM")]
    UnsupportedOperation { location: String, opcode: String },

    /// The module did not satisfy the legality requirements expected at a
    /// particular point in the pipeline.
    #[error("Verification of {stage} legality failed at {location}: {message}")]
    VerificationFailed {
        stage:    String,
        location: String,
        message:  String,
    },

    /// Emitted when code tries to construct an invalid ordering of compiler
    /// passes.
    #[error("Invalid Pass Ordering: {_0}")]
    InvalidPassOrdering(String),

    /// Wraps an error raised while running a pass with the name of that pass.
    #[error("Pass `{pass}` failed: {source}")]
    PassFailed {
        pass:   String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps `self` in an [`Error::PassFailed`] naming the provided `pass`,
    /// leaving errors that already name a pass untouched.
    #[must_use]
    pub fn in_pass(self, pass: &str) -> Self {
        match self {
            Self::PassFailed { .. } => self,
            other => Self::PassFailed {
                pass:   pass.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Gets the underlying error, looking through any [`Error::PassFailed`]
    /// wrapper.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::PassFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if the error must abort the pipeline, and `false` if it
    /// is a diagnostic that the pipeline can continue past.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self.root(), Self::UnresolvedSliceIndex { .. })
    }
}

#[cfg(test)]
mod test {
    use crate::compile::Error;

    #[test]
    fn pass_wrapping_is_not_nested() {
        let error = Error::UnsupportedOperation {
            location: "kernel.mlir:3:5".to_string(),
            opcode:   "tensor.extract".to_string(),
        };
        let wrapped = error.clone().in_pass("lower-to-llvm").in_pass("other");

        match &wrapped {
            Error::PassFailed { pass, source } => {
                assert_eq!(pass, "lower-to-llvm");
                assert_eq!(source.as_ref(), &error);
            }
            other => panic!("Expected a wrapped error, found {other:?}"),
        }
        assert_eq!(wrapped.root(), &error);
    }

    #[test]
    fn only_unresolved_slice_indices_are_recoverable() {
        let diagnostic = Error::UnresolvedSliceIndex {
            location: "<unknown>".to_string(),
            value:    "%4".to_string(),
            reason:   "non-affine".to_string(),
        };
        assert!(!diagnostic.is_fatal());
        assert!(!diagnostic.in_pass("propagate-slice-indices").is_fatal());
        assert!(Error::CompilationFailure("boom".to_string()).is_fatal());
    }
}
