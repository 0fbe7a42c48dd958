//! Error Types - Axonml Core Error Handling
//!
//! Provides the error type shared by storage and parameter operations.
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// The main error type for Axonml core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A view or index reached past the end of a buffer.
    #[error("Index out of bounds: index {index} for buffer of size {size}")]
    IndexOutOfBounds {
        /// The invalid index.
        index: usize,
        /// The size of the buffer.
        size: usize,
    },

    /// Two buffers that must have the same number of elements do not.
    #[error("Length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch {
        /// The expected number of elements.
        expected: usize,
        /// The actual number of elements.
        actual: usize,
    },

    /// Invalid operation for the given storage or parameter.
    #[error("Invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl Error {
    /// Creates a length mismatch error.
    #[must_use]
    pub fn length_mismatch(expected: usize, actual: usize) -> Self {
        Self::LengthMismatch { expected, actual }
    }

    /// Creates an invalid operation error.
    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

// =============================================================================
// Result Type
// =============================================================================

/// Result type alias for Axonml core operations.
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
