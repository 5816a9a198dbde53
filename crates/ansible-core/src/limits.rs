//! Input-size limits for tool-surface parameters.
//!
//! Limits are counted in characters, matching what every writer on the
//! mesh enforces. Validation accepts a value exactly at the boundary and
//! rejects one past it.

use crate::error::ErrorKind;
use thiserror::Error;

/// Maximum task title length.
pub const MAX_TITLE: usize = 200;
/// Maximum task description length.
pub const MAX_DESCRIPTION: usize = 5_000;
/// Maximum message content length.
pub const MAX_MESSAGE: usize = 10_000;
/// Maximum task context length.
pub const MAX_CONTEXT: usize = 5_000;
/// Maximum task result length.
pub const MAX_RESULT: usize = 5_000;

/// A parameter failed shape or size validation.
#[derive(Debug, Error)]
pub enum LimitError {
    #[error("{field} exceeds {max} characters (got {got})")]
    TooLong {
        field: &'static str,
        max: usize,
        got: usize,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

impl LimitError {
    /// All limit violations surface as `invalid_params`.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidParams
    }
}

/// Check that `value` is at most `max` characters.
pub fn ensure_max_len(field: &'static str, value: &str, max: usize) -> Result<(), LimitError> {
    let got = value.chars().count();
    if got > max {
        return Err(LimitError::TooLong { field, max, got });
    }
    Ok(())
}

/// Check that `value` is non-empty and at most `max` characters.
pub fn ensure_len(field: &'static str, value: &str, max: usize) -> Result<(), LimitError> {
    if value.is_empty() {
        return Err(LimitError::Empty { field });
    }
    ensure_max_len(field, value, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exactly_at_boundary() {
        let s = "x".repeat(MAX_TITLE);
        assert!(ensure_len("title", &s, MAX_TITLE).is_ok());
    }

    #[test]
    fn rejects_one_past_boundary() {
        let s = "x".repeat(MAX_TITLE + 1);
        let err = ensure_len("title", &s, MAX_TITLE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
        assert!(err.to_string().contains("201"));
    }

    #[test]
    fn counts_characters_not_bytes() {
        // Multibyte characters count once each.
        let s = "é".repeat(MAX_TITLE);
        assert!(ensure_len("title", &s, MAX_TITLE).is_ok());
    }

    #[test]
    fn rejects_empty_required_field() {
        assert!(ensure_len("title", "", MAX_TITLE).is_err());
        assert!(ensure_max_len("result", "", MAX_RESULT).is_ok());
    }
}
