//! Error types shared across the Gamelake workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while parsing shared types
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid partition date '{value}': expected YYYY-MM-DD")]
    InvalidPartition { value: String },

    #[error("Invalid object status: {0}")]
    InvalidStatus(String),
}
