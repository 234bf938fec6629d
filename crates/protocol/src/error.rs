//! Decode error types

use thiserror::Error;

/// Errors produced when a payload cannot be turned into a report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload carried no bytes at all
    #[error("Empty report payload")]
    Empty,

    /// Payload shorter than the fixed report length
    #[error("Short report: expected {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },
}

/// Type alias for decode results
pub type Result<T> = std::result::Result<T, DecodeError>;
