//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// A required identifier was missing or a value failed contract validation.
    ///
    /// Validation errors are surfaced synchronously and never change stored state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested checkpoint does not exist
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend storage error (connectivity, I/O, transaction failure)
    #[error("storage error: {0}")]
    Storage(String),
}

impl CheckpointError {
    /// Shorthand for a missing-field validation error.
    pub fn missing(field: &str) -> Self {
        CheckpointError::Validation(format!("{field} is required"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_field_message() {
        let err = CheckpointError::missing("lineage_id");
        assert_eq!(err.to_string(), "validation failed: lineage_id is required");
    }
}
