//! Error Types - Collective Communication Failures
//!
//! @version 0.2.6
//! @author `AutomataNexus` Development Team

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by communication backends and process groups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Participants of one collective disagreed on its arguments.
    #[error("Collective mismatch on rank {rank}: {message}")]
    CollectiveMismatch {
        /// Rank that detected the disagreement.
        rank: usize,
        /// What disagreed.
        message: String,
    },

    /// A rank index outside the group.
    #[error("Rank {rank} out of bounds for group of size {size}")]
    RankOutOfBounds {
        /// The offending rank.
        rank: usize,
        /// Number of ranks in the group.
        size: usize,
    },

    /// The participant list is not usable for a collective.
    #[error("Invalid process group: {0}")]
    InvalidGroup(String),

    /// An object could not be encoded or decoded for transfer.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Error from the storage layer.
    #[error(transparent)]
    Core(#[from] axonml_core::Error),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for distributed operations.
pub type Result<T> = core::result::Result<T, Error>;
