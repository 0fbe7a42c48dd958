//! Error Types - Optimizer Failures
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by optimizers, schedulers and sharded optimizer state.
#[derive(Error, Debug)]
pub enum Error {
    /// A collective failed.
    #[error(transparent)]
    Distributed(#[from] axonml_distributed::Error),

    /// Storage or parameter operation failed.
    #[error(transparent)]
    Core(#[from] axonml_core::Error),

    /// The optimizer was given no parameter groups.
    #[error("optimizer got an empty parameter list")]
    EmptyParameters,

    /// A hyperparameter or call argument is not usable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A state dict does not fit the optimizer it is loaded into.
    #[error("State dict mismatch: {0}")]
    StateDictMismatch(String),

    /// Reading or writing a state file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A state file is not valid JSON for a state dict.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for optimizer operations.
pub type Result<T> = core::result::Result<T, Error>;
