//! Codec errors

use thiserror::Error;

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors from decoding structural values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Bytes are not valid JSON
    #[error("Invalid value encoding: {0}")]
    InvalidEncoding(String),

    /// Compact payload refers to a structure the dictionary does not have
    #[error("Unknown structure index {index} (dictionary has {known})")]
    UnknownStructure { index: usize, known: usize },

    /// Compact payload is not `[index, values...]` or has the wrong arity
    #[error("Malformed compact value: {0}")]
    MalformedCompact(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::InvalidEncoding(err.to_string())
    }
}
