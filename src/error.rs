//! Error types for the decoding engine.

use thiserror::Error;

/// Errors produced while decoding a batch.
///
/// Shape mismatches are caller bugs: they abort the request with no partial output.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid decode config: {0}")]
    InvalidConfig(&'static str),

    #[error("step budget of {max_length} already exhausted")]
    Exhausted { max_length: usize },

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl DecodeError {
    /// Return `Ok(())` when `actual == expected`, otherwise a [`DecodeError::ShapeMismatch`].
    ///
    /// # Errors
    /// Returns [`DecodeError::ShapeMismatch`] when the two sizes differ.
    pub fn check(what: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::ShapeMismatch {
                what,
                expected,
                actual,
            })
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, DecodeError>;
