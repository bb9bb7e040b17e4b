//! Error types for CPU-side scene data.

use thiserror::Error;

/// Errors found while validating scene data before upload.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Data is internally inconsistent
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// An index points past the end of what it addresses
    #[error("{what} index {index} out of bounds (len {len})")]
    OutOfBounds {
        what: &'static str,
        index: i64,
        len: usize,
    },
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
