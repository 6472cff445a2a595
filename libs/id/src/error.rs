//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The identifier contains whitespace or control characters.
    #[error("ID contains invalid character {character:?} at position {position}")]
    InvalidCharacter { character: char, position: usize },

    /// The identifier exceeds the maximum length accepted by the protocol.
    #[error("ID too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
