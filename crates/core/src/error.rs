//! Errors raised while building domain values.

use thiserror::Error;

/// Rejected input at the domain boundary. Never retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An id string did not parse or is out of range.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid value: {0}")]
    Validation(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
