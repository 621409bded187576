//! Error types for the explore_pca library.

use thiserror::Error;

/// Main error type for the library.
///
/// Every variant names the contract that was violated and carries the
/// offending value(s), so callers can report failures without re-deriving them.
#[derive(Error, Debug)]
pub enum PcaError {
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Dimension mismatch ({context}): expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Degenerate input: {0}")]
    DegenerateInput(String),

    #[error("Insufficient samples for {context}: need at least {required}, got {actual}")]
    InsufficientSamples {
        context: String,
        required: usize,
        actual: usize,
    },

    #[error("Insufficient components for {context}: need at least {required}, got {actual}")]
    InsufficientComponents {
        context: String,
        required: usize,
        actual: usize,
    },

    #[error("Unknown metadata attribute '{0}'")]
    UnknownAttribute(String),

    #[error("No complete observations for component '{component}' and attribute '{attribute}'")]
    EmptyIntersection { component: String, attribute: String },

    #[error("Requested rank {requested} exceeds matrix rank {rank}")]
    RankExceeded { requested: usize, rank: usize },

    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Parallel analysis cancelled after {completed} of {requested} iterations")]
    Cancelled { completed: usize, requested: usize },

    #[error("Parallel analysis iteration {iteration} failed: {source}")]
    IterationFailed {
        iteration: usize,
        #[source]
        source: Box<PcaError>,
    },
}

impl PcaError {
    /// Shorthand for an `InvalidParameter` error.
    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        PcaError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, PcaError>;
