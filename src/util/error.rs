//! Error types for boxrefine.

use thiserror::Error;

/// Result alias for boxrefine operations.
pub type BoxRefineResult<T> = std::result::Result<T, BoxRefineError>;

/// Errors that can occur when decoding, proposing or assembling predictions.
///
/// An empty candidate set is never an error; selection steps return empty
/// collections instead.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BoxRefineError {
    /// Paired tensors disagree in rank or size.
    #[error("shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// A mode string or mode combination is not supported.
    #[error("unsupported {kind}: {value}")]
    UnsupportedMode { kind: &'static str, value: String },
    /// A configuration value is out of range.
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: &'static str },
}

impl BoxRefineError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    pub(crate) fn unsupported(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnsupportedMode {
            kind,
            value: value.into(),
        }
    }
}
