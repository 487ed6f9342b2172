use std::fmt::{self, Display};

use crate::result::ExpectedResult;

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A status update referenced a key that was never expected.
    UnknownResult(ExpectedResult),
    /// A node name or result type cannot be used as a path segment.
    InvalidSegment(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownResult(key) => {
                write!(f, "result {key} is not expected in this run")
            }
            ModelError::InvalidSegment(segment) => {
                write!(f, "invalid path segment: {segment:?}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
